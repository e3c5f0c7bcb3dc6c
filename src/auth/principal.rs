//! Principal resolution
//!
//! A [`PrincipalResolver`] turns a verified identity into the [`Principal`]
//! stored in the security context. Resolution is async because real
//! resolvers look accounts up in a database or directory service.

use super::jwt::VerifiedIdentity;
use super::AuthError;
use crate::config::{AccountConfig, PrincipalsConfig, ResolverKind};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// The verified identity and authority set associated with a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    id: String,
    display_name: String,
    authorities: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(id: impl Into<String>, display_name: impl Into<String>, authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            authorities: authorities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn authorities(&self) -> &BTreeSet<String> {
        &self.authorities
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }
}

/// Maps a verified identity to a principal record
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    /// Resolve the principal for a validated token
    ///
    /// Returns `UnknownPrincipal` when the subject no longer maps to a valid
    /// account.
    async fn resolve(&self, identity: &VerifiedIdentity) -> Result<Principal, AuthError>;

    /// Verify a username/password pair and resolve its principal
    ///
    /// Resolvers without password support reject every attempt.
    async fn verify_password(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<Principal, AuthError> {
        Err(AuthError::BadCredentials)
    }
}

/// Builds the principal from token claims alone
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimsPrincipalResolver;

#[async_trait]
impl PrincipalResolver for ClaimsPrincipalResolver {
    async fn resolve(&self, identity: &VerifiedIdentity) -> Result<Principal, AuthError> {
        let display_name = identity.display_name().unwrap_or(identity.subject());
        Ok(Principal::new(
            identity.subject(),
            display_name,
            identity.authorities().iter().cloned(),
        ))
    }
}

/// Resolves subjects against a static account directory
///
/// Authorities come from the directory, not from the token, so revoking an
/// authority takes effect for tokens that are still unexpired.
#[derive(Debug, Clone)]
pub struct DirectoryPrincipalResolver {
    accounts: HashMap<String, DirectoryEntry>,
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    account: AccountConfig,
    /// Decoded `password_sha256`; `None` disables password login
    password_digest: Option<[u8; 32]>,
}

impl DirectoryPrincipalResolver {
    pub fn new(accounts: impl IntoIterator<Item = AccountConfig>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| {
                    let password_digest = account
                        .password_sha256
                        .as_deref()
                        .and_then(|digest| decode_digest(&account.id, digest));
                    (
                        account.id.clone(),
                        DirectoryEntry {
                            account,
                            password_digest,
                        },
                    )
                })
                .collect(),
        }
    }

    fn active_entry(&self, id: &str) -> Option<&DirectoryEntry> {
        self.accounts.get(id).filter(|entry| entry.account.enabled)
    }

    fn principal_for(account: &AccountConfig) -> Principal {
        Principal::new(
            account.id.clone(),
            account
                .display_name
                .clone()
                .unwrap_or_else(|| account.id.clone()),
            account.authorities.iter().cloned(),
        )
    }
}

fn decode_digest(id: &str, digest: &str) -> Option<[u8; 32]> {
    let decoded = hex::decode(digest)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
    if decoded.is_none() {
        warn!(account = %id, "Ignoring malformed password digest");
    }
    decoded
}

#[async_trait]
impl PrincipalResolver for DirectoryPrincipalResolver {
    async fn resolve(&self, identity: &VerifiedIdentity) -> Result<Principal, AuthError> {
        match self.active_entry(identity.subject()) {
            Some(entry) => Ok(Self::principal_for(&entry.account)),
            None => {
                debug!(subject = %identity.subject(), "Subject not found in directory");
                Err(AuthError::UnknownPrincipal)
            }
        }
    }

    async fn verify_password(&self, username: &str, password: &str) -> Result<Principal, AuthError> {
        // Unknown user, disabled account and wrong password are indistinguishable.
        let entry = self
            .active_entry(username)
            .ok_or(AuthError::BadCredentials)?;
        let expected = entry.password_digest.ok_or(AuthError::BadCredentials)?;

        let actual: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if bool::from(actual.ct_eq(&expected)) {
            Ok(Self::principal_for(&entry.account))
        } else {
            Err(AuthError::BadCredentials)
        }
    }
}

/// Build the resolver selected in configuration
pub fn resolver_from_config(config: &PrincipalsConfig) -> Arc<dyn PrincipalResolver> {
    match config.resolver {
        ResolverKind::Claims => Arc::new(ClaimsPrincipalResolver),
        ResolverKind::Directory => {
            Arc::new(DirectoryPrincipalResolver::new(config.accounts.iter().cloned()))
        }
    }
}
