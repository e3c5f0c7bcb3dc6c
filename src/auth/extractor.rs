//! Credential extraction
//!
//! Absence of credentials is not an error: [`CredentialExtractor::extract`]
//! returns `None` and the request proceeds unauthenticated.

use super::Credentials;
use crate::config::{FormLoginConfig, TokenSource};
use crate::request::InboundRequest;
use hyper::Method;

const BEARER_SCHEME: &str = "bearer";

/// Pulls a bearer token or form-login credentials from a request
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    sources: Vec<TokenSource>,
    form_login: Option<FormLoginConfig>,
}

impl Default for CredentialExtractor {
    fn default() -> Self {
        Self::new(vec![TokenSource::Bearer])
    }
}

impl CredentialExtractor {
    /// Create an extractor that tries `sources` in order
    ///
    /// An empty list falls back to the `Authorization: Bearer` header.
    pub fn new(sources: Vec<TokenSource>) -> Self {
        let sources = if sources.is_empty() {
            vec![TokenSource::Bearer]
        } else {
            sources
        };

        Self {
            sources,
            form_login: None,
        }
    }

    /// Also accept username/password posted to the form-login endpoint
    #[must_use]
    pub fn with_form_login(mut self, form_login: FormLoginConfig) -> Self {
        self.form_login = Some(form_login);
        self
    }

    /// Extract credentials from the request
    ///
    /// Token sources are tried in configuration order; the first one present
    /// wins. Form login is only considered for `POST` to the login path.
    pub fn extract(&self, request: &InboundRequest) -> Option<Credentials> {
        for source in &self.sources {
            let token = match source {
                TokenSource::Bearer => request.header("authorization").and_then(parse_bearer),
                TokenSource::Query { name } => request.query_param(name),
                TokenSource::Header { name } => {
                    request.header(name).map(|v| v.trim().to_string())
                }
            };

            if let Some(token) = token {
                return Some(Credentials::Bearer(token));
            }
        }

        self.extract_form_login(request)
    }

    fn extract_form_login(&self, request: &InboundRequest) -> Option<Credentials> {
        let form = self.form_login.as_ref()?;
        if request.method != Method::POST || request.path != form.path {
            return None;
        }

        let username = request.form_field(&form.username_field)?;
        let password = request.form_field(&form.password_field)?;

        Some(Credentials::Password { username, password })
    }
}

/// Parse `Bearer <token>` (scheme is case-insensitive)
///
/// Other schemes such as `Basic` are not bearer credentials and yield `None`.
/// A bearer header with an empty token yields `Some("")` so the validator
/// rejects it as malformed rather than treating the request as anonymous.
fn parse_bearer(header: &str) -> Option<String> {
    let header = header.trim();
    let (scheme, rest) = match header.split_once(' ') {
        Some(parts) => parts,
        None => (header, ""),
    };

    if scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        Some(rest.trim().to_string())
    } else {
        None
    }
}
