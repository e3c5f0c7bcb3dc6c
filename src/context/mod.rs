//! Per-request security context
//!
//! ```text
//! Empty ──establish──▶ Authenticated ──clear──▶ Cleared
//!   └──────────────────clear─────────────────────▲
//! ```
//!
//! A context is created `Empty` for every request, moved to `Authenticated`
//! at most once by the authentication coordinator, and `Cleared` when the
//! request finishes. Contexts are never cloned or shared between requests;
//! handlers borrow the one for their request.

use crate::auth::Principal;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Lifecycle state of a security context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Empty,
    Authenticated,
    Cleared,
}

/// Illegal state transitions
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("Cannot authenticate a context in state {0:?}")]
    IllegalTransition(ContextState),
}

/// Holder of the current principal for one request
#[derive(Debug)]
pub struct SecurityContext {
    state: ContextState,
    principal: Option<Principal>,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityContext {
    /// Create an empty, unauthenticated context
    pub fn new() -> Self {
        Self {
            state: ContextState::Empty,
            principal: None,
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// True only in the `Authenticated` state
    pub fn is_authenticated(&self) -> bool {
        self.state == ContextState::Authenticated
    }

    /// The authenticated principal, if any
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Granted authorities (empty when unauthenticated)
    pub fn authorities(&self) -> BTreeSet<String> {
        self.principal
            .as_ref()
            .map(|p| p.authorities().clone())
            .unwrap_or_default()
    }

    /// Move `Empty` → `Authenticated`
    ///
    /// Crate-private: only the authentication coordinator may call this,
    /// after a token or password has been verified.
    pub(crate) fn establish(&mut self, principal: Principal) -> Result<(), ContextError> {
        match self.state {
            ContextState::Empty => {
                self.principal = Some(principal);
                self.state = ContextState::Authenticated;
                Ok(())
            }
            state => Err(ContextError::IllegalTransition(state)),
        }
    }

    /// Drop the principal and enter the terminal `Cleared` state
    pub(crate) fn clear(&mut self) {
        self.principal = None;
        self.state = ContextState::Cleared;
    }
}

/// Scope guard owning one request's security context
///
/// Clears the context when dropped, whether the request completed normally,
/// was short-circuited, or its future was cancelled mid-flight.
#[derive(Debug)]
pub struct ContextScope {
    context: SecurityContext,
    live: Arc<AtomicUsize>,
}

impl ContextScope {
    /// Open a fresh scope, counting it in `live` until dropped
    pub fn open(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::ACTIVE_CONTEXTS.inc();

        Self {
            context: SecurityContext::new(),
            live,
        }
    }
}

impl Deref for ContextScope {
    type Target = SecurityContext;

    fn deref(&self) -> &SecurityContext {
        &self.context
    }
}

impl DerefMut for ContextScope {
    fn deref_mut(&mut self) -> &mut SecurityContext {
        &mut self.context
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.context.clear();
        self.live.fetch_sub(1, Ordering::SeqCst);
        #[cfg(feature = "metrics")]
        crate::metrics::ACTIVE_CONTEXTS.dec();
        debug!("Security context released");
    }
}
