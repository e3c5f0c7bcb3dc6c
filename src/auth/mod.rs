//! Authentication module
//!
//! Turns raw request credentials into a verified principal:
//!
//! - [`extractor`] pulls a bearer token or form-login credentials out of a request
//! - [`jwt`] verifies tokens against the process-wide signing key
//! - [`principal`] maps a verified identity to a [`Principal`]
//! - [`coordinator`] runs the three steps and populates the security context

use std::fmt;
use thiserror::Error;

pub mod coordinator;
pub mod extractor;
pub mod jwt;
pub mod principal;

pub use coordinator::{AuthOutcome, AuthenticationCoordinator};
pub use extractor::CredentialExtractor;
pub use jwt::{SigningKey, TokenIssuer, TokenValidator, VerifiedIdentity};
pub use principal::{
    ClaimsPrincipalResolver, DirectoryPrincipalResolver, Principal, PrincipalResolver,
};

/// Authentication errors
///
/// Every variant surfaces as `401 Unauthorized` unless the matched route
/// allows anonymous fallback. The `Display` text is for logs only and is
/// never written to a response body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token expired")]
    ExpiredToken,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Unknown principal")]
    UnknownPrincipal,

    #[error("Bad credentials")]
    BadCredentials,
}

impl AuthError {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MalformedToken(_) => "malformed_token",
            AuthError::ExpiredToken => "expired_token",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::UnknownPrincipal => "unknown_principal",
            AuthError::BadCredentials => "bad_credentials",
        }
    }
}

/// Raw credentials pulled from one request
///
/// Lives only for the duration of a single authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Bearer token (header, query parameter, or custom header)
    Bearer(String),
    /// Username and password submitted to the form-login endpoint
    Password { username: String, password: String },
}

impl Credentials {
    /// Authentication method label ("bearer" or "form")
    pub fn method(&self) -> &'static str {
        match self {
            Credentials::Bearer(_) => "bearer",
            Credentials::Password { .. } => "form",
        }
    }
}

// Secrets stay out of Debug output so they can never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}
