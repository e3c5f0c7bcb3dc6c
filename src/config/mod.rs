//! Configuration module for Gatekeep
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and comprehensive validation.
//!
//! The route table, signing key and account directory are read once at
//! startup and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Validation Helpers
// ============================================================================

const SUPPORTED_ALGORITHMS: &[&str] = &["HS256", "RS256", "ES256"];

fn is_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub security: SecurityConfig,
    #[serde(default)]
    pub principals: PrincipalsConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.security.validate()?;
        self.principals.validate()?;

        if self.security.form_login.is_some()
            && self.principals.resolver != ResolverKind::Directory
        {
            return Err(ConfigError::ValidationError(
                "form_login requires the 'directory' principal resolver".into(),
            ));
        }

        for (index, route) in self.routes.iter().enumerate() {
            route.validate().map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Route #{} ('{}'): {}",
                    index, route.pattern, e
                ))
            })?;
        }

        Ok(())
    }
}

// ============================================================================
// Security Configuration
// ============================================================================

/// Token verification and credential extraction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub signing_key: SigningKeyConfig,
    /// Required `iss` claim
    #[serde(default)]
    pub issuer: Option<String>,
    /// Required `aud` claim
    #[serde(default)]
    pub audience: Option<String>,
    /// Clock-skew tolerance applied to `exp` and `iat`. Default: 0
    #[serde(default)]
    pub leeway_seconds: u64,
    /// Claim holding the granted authorities. Default: "authorities"
    #[serde(default = "default_authorities_claim")]
    pub authorities_claim: String,
    /// Lifetime of tokens minted by `gatekeep issue-token`. Default: 3600
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,
    /// Where to look for a bearer token, in order. Default: Authorization header
    #[serde(default = "default_token_sources")]
    pub token_sources: Vec<TokenSource>,
    #[serde(default)]
    pub form_login: Option<FormLoginConfig>,
}

impl SecurityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.signing_key.validate()?;

        if self.authorities_claim.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "authorities_claim cannot be empty".into(),
            ));
        }

        if self.token_ttl_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "token_ttl_seconds must be greater than zero".into(),
            ));
        }

        for source in &self.token_sources {
            match source {
                TokenSource::Query { name } | TokenSource::Header { name }
                    if name.trim().is_empty() =>
                {
                    return Err(ConfigError::ValidationError(
                        "token source name cannot be empty".into(),
                    ));
                }
                _ => {}
            }
        }

        if let Some(ref form) = self.form_login {
            if !form.path.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "form_login path '{}' must start with /",
                    form.path
                )));
            }
        }

        Ok(())
    }
}

fn default_authorities_claim() -> String {
    "authorities".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_token_sources() -> Vec<TokenSource> {
    vec![TokenSource::Bearer]
}

/// Process-wide signing key
///
/// `HS256` uses `secret` for both signing and verification. `RS256` and
/// `ES256` verify with `public_key_pem`; `private_key_pem` is only needed
/// to mint tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyConfig {
    pub algorithm: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub public_key_pem: Option<String>,
    #[serde(default)]
    pub private_key_pem: Option<String>,
}

impl SigningKeyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let algorithm = self.algorithm.to_uppercase();
        if !SUPPORTED_ALGORITHMS.contains(&algorithm.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unsupported signing algorithm '{}': must be one of {}",
                self.algorithm,
                SUPPORTED_ALGORITHMS.join(", ")
            )));
        }

        if algorithm == "HS256" {
            match self.secret.as_deref() {
                Some(secret) if !secret.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::ValidationError(
                        "HS256 signing key requires a non-empty secret".into(),
                    ))
                }
            }
        } else if self.public_key_pem.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(ConfigError::ValidationError(format!(
                "{} signing key requires public_key_pem",
                algorithm
            )));
        }

        Ok(())
    }
}

/// Token source configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TokenSource {
    #[serde(rename = "bearer")]
    Bearer,
    #[serde(rename = "query")]
    Query { name: String },
    #[serde(rename = "header")]
    Header { name: String },
}

/// Username/password login endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormLoginConfig {
    #[serde(default = "default_login_path")]
    pub path: String,
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,
}

impl Default for FormLoginConfig {
    fn default() -> Self {
        Self {
            path: default_login_path(),
            username_field: default_username_field(),
            password_field: default_password_field(),
        }
    }
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_username_field() -> String {
    "username".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

// ============================================================================
// Principal Configuration
// ============================================================================

/// How a verified subject becomes a principal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    /// Build the principal from token claims alone
    #[default]
    Claims,
    /// Look the subject up in the configured account directory
    Directory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrincipalsConfig {
    #[serde(default)]
    pub resolver: ResolverKind,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl PrincipalsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Account id cannot be empty".into(),
                ));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate account id '{}'",
                    account.id
                )));
            }
            if let Some(ref digest) = account.password_sha256 {
                if !is_sha256_hex(digest) {
                    return Err(ConfigError::ValidationError(format!(
                        "Account '{}' has an invalid password_sha256 (expected 64 hex characters)",
                        account.id
                    )));
                }
            }
        }

        if self.resolver == ResolverKind::Directory && self.accounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "The 'directory' resolver needs at least one account".into(),
            ));
        }

        Ok(())
    }
}

/// One account in the static directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Hex-encoded SHA-256 of the password, for form login
    #[serde(default)]
    pub password_sha256: Option<String>,
    #[serde(default = "default_account_enabled")]
    pub enabled: bool,
}

fn default_account_enabled() -> bool {
    true
}

// ============================================================================
// Route Policy Configuration
// ============================================================================

/// Access rule attached to a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Public,
    Authenticated,
    HasAll,
    HasAny,
    DenyAll,
}

/// One entry in the route policy table
///
/// # Example
///
/// ```yaml
/// routes:
///   - pattern: "/admin/**"
///     methods: ["GET", "POST"]
///     access: has_all
///     authorities: ["ADMIN"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,
    /// HTTP methods this rule applies to. Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub access: AccessKind,
    #[serde(default)]
    pub authorities: Vec<String>,
    /// Continue anonymously when presented credentials fail verification
    #[serde(default)]
    pub anonymous_fallback: bool,
}

impl RouteConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.pattern.starts_with('/') {
            return Err("pattern must start with /".into());
        }

        for method in &self.methods {
            hyper::Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| format!("invalid HTTP method '{}'", method))?;
        }

        match self.access {
            AccessKind::HasAll | AccessKind::HasAny => {
                if self.authorities.is_empty() {
                    return Err("has_all/has_any access needs at least one authority".into());
                }
                if self.authorities.iter().any(|a| a.trim().is_empty()) {
                    return Err("authority names cannot be empty".into());
                }
            }
            _ => {
                if !self.authorities.is_empty() {
                    return Err(
                        "authorities are only allowed with has_all or has_any access".into(),
                    );
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Logging & Metrics
// ============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset. Default: "info"
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Record Prometheus counters and allow `evaluate --metrics` to print them
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
