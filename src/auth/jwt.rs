//! JWT verification and issuance
//!
//! Supports HS256, RS256 and ES256 keys. The signing key is process-wide and
//! shared read-only behind an `Arc`.
//!
//! # Expiry boundary
//!
//! A token is expired when `now >= exp + leeway`. With the default leeway of
//! zero a token presented at exactly its `exp` second is rejected.

use super::AuthError;
use crate::config::{SecurityConfig, SigningKeyConfig};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Key material errors (configuration time, never per request)
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signing key has no private component")]
    NoPrivateKey,

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// JWT Claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Everything else, including `iss`, `aud` and the authorities claim
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Process-wide signing key
#[derive(Clone)]
pub struct SigningKey {
    algorithm: Algorithm,
    decoding: DecodingKey,
    encoding: Option<EncodingKey>,
}

impl SigningKey {
    /// Shared-secret key (HS256), usable for both signing and verification
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            decoding: DecodingKey::from_secret(secret),
            encoding: Some(EncodingKey::from_secret(secret)),
        }
    }

    /// RSA key (RS256) from a PEM public key and optional PEM private key
    pub fn rs256(public_key_pem: &str, private_key_pem: Option<&str>) -> Result<Self, KeyError> {
        let decoding = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| KeyError::InvalidKey(format!("RSA public key: {}", e)))?;
        let encoding = private_key_pem
            .map(|pem| {
                EncodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|e| KeyError::InvalidKey(format!("RSA private key: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            algorithm: Algorithm::RS256,
            decoding,
            encoding,
        })
    }

    /// EC key (ES256, P-256) from a PEM public key and optional PKCS#8 private key
    pub fn es256(public_key_pem: &str, private_key_pem: Option<&str>) -> Result<Self, KeyError> {
        let decoding = DecodingKey::from_ec_pem(public_key_pem.as_bytes())
            .map_err(|e| KeyError::InvalidKey(format!("EC public key: {}", e)))?;
        let encoding = private_key_pem
            .map(|pem| {
                EncodingKey::from_ec_pem(pem.as_bytes())
                    .map_err(|e| KeyError::InvalidKey(format!("EC private key: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            algorithm: Algorithm::ES256,
            decoding,
            encoding,
        })
    }

    /// Build the key described by configuration
    pub fn from_config(config: &SigningKeyConfig) -> Result<Self, KeyError> {
        match config.algorithm.to_uppercase().as_str() {
            "HS256" => {
                let secret = config
                    .secret
                    .as_deref()
                    .ok_or_else(|| KeyError::InvalidKey("HS256 requires a secret".into()))?;
                Ok(Self::hs256(secret.as_bytes()))
            }
            "RS256" => {
                let public = config.public_key_pem.as_deref().ok_or_else(|| {
                    KeyError::InvalidKey("RS256 requires public_key_pem".into())
                })?;
                Self::rs256(public, config.private_key_pem.as_deref())
            }
            "ES256" => {
                let public = config.public_key_pem.as_deref().ok_or_else(|| {
                    KeyError::InvalidKey("ES256 requires public_key_pem".into())
                })?;
                Self::es256(public, config.private_key_pem.as_deref())
            }
            other => Err(KeyError::InvalidKey(format!(
                "Unsupported algorithm: {}",
                other
            ))),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether this key can mint tokens
    pub fn can_sign(&self) -> bool {
        self.encoding.is_some()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("can_sign", &self.can_sign())
            .finish_non_exhaustive()
    }
}

/// Identity extracted from a token whose signature and expiry were verified
///
/// Only [`TokenValidator`] constructs this type, so holding one proves the
/// claims came from a validated token.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    subject: String,
    display_name: Option<String>,
    authorities: BTreeSet<String>,
    issued_at: Option<i64>,
    expires_at: i64,
    claims: HashMap<String, Value>,
}

impl VerifiedIdentity {
    pub(crate) fn new(
        subject: impl Into<String>,
        display_name: Option<String>,
        authorities: BTreeSet<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            subject: subject.into(),
            display_name,
            authorities,
            issued_at: None,
            expires_at,
            claims: HashMap::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn authorities(&self) -> &BTreeSet<String> {
        &self.authorities
    }

    pub fn issued_at(&self) -> Option<i64> {
        self.issued_at
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Remaining claims (`iss`, `aud`, custom claims)
    pub fn claims(&self) -> &HashMap<String, Value> {
        &self.claims
    }
}

/// Verifies bearer tokens against the process-wide key
///
/// # Example
///
/// ```
/// use gatekeep::auth::jwt::{SigningKey, TokenValidator};
/// use std::sync::Arc;
///
/// let key = Arc::new(SigningKey::hs256(b"my-secret"));
/// let validator = TokenValidator::new(key)
///     .with_issuer("https://auth.example.com")
///     .with_audience("my-api");
/// assert!(validator.validate("not-a-token").is_err());
/// ```
pub struct TokenValidator {
    key: Arc<SigningKey>,
    validation: Validation,
    leeway: i64,
    authorities_claim: String,
}

impl TokenValidator {
    pub fn new(key: Arc<SigningKey>) -> Self {
        let mut validation = Validation::new(key.algorithm());
        // Expiry is checked by `check_times` so the boundary policy is ours.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.validate_aud = false; // Only validate aud when explicitly set
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            key,
            validation,
            leeway: 0,
            authorities_claim: "authorities".to_string(),
        }
    }

    /// Validator with issuer, audience, leeway and claim name from config
    pub fn from_config(config: &SecurityConfig, key: Arc<SigningKey>) -> Self {
        let mut validator = Self::new(key)
            .with_leeway(config.leeway_seconds)
            .with_authorities_claim(&config.authorities_claim);
        if let Some(ref issuer) = config.issuer {
            validator = validator.with_issuer(issuer);
        }
        if let Some(ref audience) = config.audience {
            validator = validator.with_audience(audience);
        }
        validator
    }

    /// Set the required issuer (`iss` claim)
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        // A configured issuer must be present, not merely match when present
        self.validation.required_spec_claims.insert("iss".to_string());
        self
    }

    /// Set the required audience (`aud` claim)
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self.validation.required_spec_claims.insert("aud".to_string());
        self
    }

    /// Clock-skew tolerance in seconds for `exp` and `iat`
    #[must_use]
    pub fn with_leeway(mut self, seconds: u64) -> Self {
        self.leeway = i64::try_from(seconds).unwrap_or(i64::MAX);
        self
    }

    /// Name of the claim holding granted authorities
    #[must_use]
    pub fn with_authorities_claim(mut self, claim: &str) -> Self {
        self.authorities_claim = claim.to_string();
        self
    }

    /// Validate a token against the current time
    pub fn validate(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        self.validate_at(token, chrono::Utc::now().timestamp())
    }

    /// Validate a token as of `now` (seconds since the Unix epoch)
    ///
    /// The signature is verified before any time check, so an expired token
    /// with a bad signature reports `InvalidSignature`.
    pub fn validate_at(&self, token: &str, now: i64) -> Result<VerifiedIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MalformedToken("empty token".into()));
        }

        let token_data = decode::<Claims>(token, &self.key.decoding, &self.validation)
            .map_err(classify_jwt_error)?;
        let mut claims = token_data.claims;

        if claims.sub.trim().is_empty() {
            return Err(AuthError::MalformedToken("empty subject".into()));
        }

        self.check_times(&claims, now)?;

        let authorities = parse_authorities(claims.extra.remove(&self.authorities_claim))?;

        Ok(VerifiedIdentity {
            subject: claims.sub,
            display_name: claims.name,
            authorities,
            issued_at: claims.iat,
            expires_at: claims.exp,
            claims: claims.extra,
        })
    }

    fn check_times(&self, claims: &Claims, now: i64) -> Result<(), AuthError> {
        if now >= claims.exp.saturating_add(self.leeway) {
            return Err(AuthError::ExpiredToken);
        }

        if let Some(iat) = claims.iat {
            if iat > now.saturating_add(self.leeway) {
                return Err(AuthError::MalformedToken("issued in the future".into()));
            }
        }

        Ok(())
    }
}

/// Map `jsonwebtoken` failures onto the three token error kinds
fn classify_jwt_error(error: jsonwebtoken::errors::Error) -> AuthError {
    match error.kind() {
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        _ => AuthError::MalformedToken(error.to_string()),
    }
}

/// Accepts a JSON array of strings or a space-separated string
fn parse_authorities(value: Option<Value>) -> Result<BTreeSet<String>, AuthError> {
    match value {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(AuthError::MalformedToken(
                    "authorities must be strings".into(),
                )),
            })
            .collect(),
        Some(_) => Err(AuthError::MalformedToken(
            "authorities claim has an unsupported type".into(),
        )),
    }
}

/// What to put in a freshly minted token
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub subject: String,
    pub display_name: Option<String>,
    pub authorities: Vec<String>,
}

/// Signs tokens with the process-wide key
///
/// Used by the `issue-token` command and by tests; production tokens normally
/// come from an external identity provider.
pub struct TokenIssuer {
    key: Arc<SigningKey>,
    ttl_seconds: i64,
    issuer: Option<String>,
    audience: Option<String>,
    authorities_claim: String,
}

impl TokenIssuer {
    pub fn new(key: Arc<SigningKey>) -> Self {
        Self {
            key,
            ttl_seconds: 3600,
            issuer: None,
            audience: None,
            authorities_claim: "authorities".to_string(),
        }
    }

    /// Issuer whose tokens pass a validator built from the same config
    pub fn from_config(config: &SecurityConfig, key: Arc<SigningKey>) -> Self {
        let mut issuer = Self::new(key)
            .with_ttl(config.token_ttl_seconds)
            .with_authorities_claim(&config.authorities_claim);
        if let Some(ref iss) = config.issuer {
            issuer = issuer.with_issuer(iss);
        }
        if let Some(ref aud) = config.audience {
            issuer = issuer.with_audience(aud);
        }
        issuer
    }

    #[must_use]
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.issuer = Some(issuer.to_string());
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.audience = Some(audience.to_string());
        self
    }

    #[must_use]
    pub fn with_authorities_claim(mut self, claim: &str) -> Self {
        self.authorities_claim = claim.to_string();
        self
    }

    /// Sign a token valid from now for the configured TTL
    pub fn issue(&self, request: &TokenRequest) -> Result<String, KeyError> {
        self.issue_at(request, chrono::Utc::now().timestamp())
    }

    /// Sign a token as if issued at `now`
    pub fn issue_at(&self, request: &TokenRequest, now: i64) -> Result<String, KeyError> {
        let encoding = self.key.encoding.as_ref().ok_or(KeyError::NoPrivateKey)?;

        let mut extra = HashMap::new();
        extra.insert(
            self.authorities_claim.clone(),
            Value::Array(
                request
                    .authorities
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        if let Some(ref iss) = self.issuer {
            extra.insert("iss".into(), Value::String(iss.clone()));
        }
        if let Some(ref aud) = self.audience {
            extra.insert("aud".into(), Value::String(aud.clone()));
        }

        let claims = Claims {
            sub: request.subject.clone(),
            exp: now.saturating_add(self.ttl_seconds),
            iat: Some(now),
            name: request.display_name.clone(),
            extra,
        };

        encode(&Header::new(self.key.algorithm), &claims, encoding)
            .map_err(|e| KeyError::Signing(e.to_string()))
    }
}
