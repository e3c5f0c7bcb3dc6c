//! Authorization module
//!
//! Decides whether the principal in a [`SecurityContext`] may access a
//! route, given the route's [`AuthorityRequirement`]. The engine is pure:
//! it never modifies the context and performs no I/O.

use crate::context::SecurityContext;
use crate::router::PolicyTable;
use hyper::Method;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Authorization errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzError {
    /// Authenticated, but lacking the required authorities
    #[error("Access denied")]
    AccessDenied,

    /// Anonymous caller on a route that needs a principal
    #[error("Authentication required")]
    Unauthenticated,
}

impl AuthzError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthzError::AccessDenied => "access_denied",
            AuthzError::Unauthenticated => "unauthenticated",
        }
    }
}

/// Access rule attached to a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityRequirement {
    /// Anyone, authenticated or not
    Public,
    /// Any authenticated principal
    Authenticated,
    /// Authenticated and holding every listed authority
    HasAll(BTreeSet<String>),
    /// Authenticated and holding at least one listed authority
    HasAny(BTreeSet<String>),
    /// Nobody
    DenyAll,
}

impl AuthorityRequirement {
    pub fn has_all<I, S>(authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::HasAll(authorities.into_iter().map(Into::into).collect())
    }

    pub fn has_any<I, S>(authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::HasAny(authorities.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for AuthorityRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Public => write!(f, "public"),
            Self::Authenticated => write!(f, "authenticated"),
            Self::HasAll(set) => write!(f, "has_all({})", join(set)),
            Self::HasAny(set) => write!(f, "has_any({})", join(set)),
            Self::DenyAll => write!(f, "deny_all"),
        }
    }
}

/// Evaluates route requirements against security contexts
#[derive(Debug, Clone, Default)]
pub struct AccessDecisionEngine {
    policies: Arc<PolicyTable>,
}

impl AccessDecisionEngine {
    pub fn new(policies: Arc<PolicyTable>) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Grant or deny `requirement` for the principal in `context`
    ///
    /// Denials for an anonymous caller are `Unauthenticated` so the caller
    /// can be asked to log in; denials for an authenticated caller are
    /// `AccessDenied`.
    pub fn decide(
        &self,
        context: &SecurityContext,
        requirement: &AuthorityRequirement,
    ) -> Result<(), AuthzError> {
        let granted = match (requirement, context.principal()) {
            (AuthorityRequirement::Public, _) => true,
            (AuthorityRequirement::DenyAll, _) => false,
            (_, None) => false,
            (AuthorityRequirement::Authenticated, Some(_)) => true,
            (AuthorityRequirement::HasAll(required), Some(principal)) => {
                required.is_subset(principal.authorities())
            }
            (AuthorityRequirement::HasAny(required), Some(principal)) => {
                !required.is_disjoint(principal.authorities())
            }
        };

        let result = if granted {
            Ok(())
        } else if context.is_authenticated() {
            Err(AuthzError::AccessDenied)
        } else {
            Err(AuthzError::Unauthenticated)
        };

        debug!(
            requirement = %requirement,
            authenticated = context.is_authenticated(),
            granted,
            "Access decision"
        );

        #[cfg(feature = "metrics")]
        crate::metrics::record_access_decision(
            result.as_ref().map_or_else(|e| e.kind(), |_| "granted"),
        );

        result
    }

    /// Look up the route's requirement and decide on it
    pub fn check(
        &self,
        context: &SecurityContext,
        method: &Method,
        path: &str,
    ) -> Result<(), AuthzError> {
        let rule = self.policies.resolve(method, path);
        self.decide(context, rule.requirement())
    }
}
