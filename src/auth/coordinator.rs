//! Authentication coordinator
//!
//! Runs extraction → validation → resolution → context population for one
//! request. A failure is returned to the caller, which records it for the
//! pipeline's exception-translation stage; the coordinator never aborts the
//! pipeline itself.

use super::extractor::CredentialExtractor;
use super::jwt::TokenValidator;
use super::principal::PrincipalResolver;
use super::{AuthError, Credentials};
use crate::context::{ContextState, SecurityContext};
use crate::request::InboundRequest;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a successful coordinator run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No credentials were presented
    Anonymous,
    /// Credentials verified and the context populated
    Authenticated,
    /// Context was not `Empty`; nothing was attempted
    Unchanged,
}

pub struct AuthenticationCoordinator {
    extractor: CredentialExtractor,
    validator: TokenValidator,
    resolver: Arc<dyn PrincipalResolver>,
}

impl AuthenticationCoordinator {
    pub fn new(
        extractor: CredentialExtractor,
        validator: TokenValidator,
        resolver: Arc<dyn PrincipalResolver>,
    ) -> Self {
        Self {
            extractor,
            validator,
            resolver,
        }
    }

    /// Authenticate `request` into `context`
    ///
    /// Idempotent: an already-authenticated (or cleared) context is left
    /// untouched and no extraction or resolver lookup happens.
    pub async fn authenticate(
        &self,
        request: &InboundRequest,
        context: &mut SecurityContext,
    ) -> Result<AuthOutcome, AuthError> {
        if context.state() != ContextState::Empty {
            debug!(state = ?context.state(), "Context already populated, skipping authentication");
            return Ok(AuthOutcome::Unchanged);
        }

        let credentials = match self.extractor.extract(request) {
            Some(credentials) => credentials,
            None => {
                debug!("No credentials presented");
                return Ok(AuthOutcome::Anonymous);
            }
        };

        let method = credentials.method();
        let result = self.verify(credentials).await;

        #[cfg(feature = "metrics")]
        crate::metrics::record_auth_attempt(
            method,
            result.as_ref().map_or_else(AuthError::kind, |_| "success"),
        );

        match result {
            Ok(principal) => {
                info!(
                    auth.method = method,
                    principal = %principal.id(),
                    "Authentication successful"
                );
                context
                    .establish(principal)
                    .map_err(|_| AuthError::UnknownPrincipal)?;
                Ok(AuthOutcome::Authenticated)
            }
            Err(e) => {
                warn!(auth.method = method, error.kind = e.kind(), "Authentication failed");
                Err(e)
            }
        }
    }

    async fn verify(&self, credentials: Credentials) -> Result<super::Principal, AuthError> {
        match credentials {
            Credentials::Bearer(token) => {
                let identity = self.validator.validate(&token)?;
                self.resolver.resolve(&identity).await
            }
            Credentials::Password { username, password } => {
                self.resolver.verify_password(&username, &password).await
            }
        }
    }
}
