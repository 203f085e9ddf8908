//! Authentication and wallet-access collaborators
//!
//! The engine never issues or inspects tokens itself; it asks a
//! [`TokenVerifier`] for the user behind a bearer token and a
//! [`WalletAccess`] whether that user may watch a wallet.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{AuthError, RealtimeError, Result};

/// Resolves a bearer token to a user id
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> std::result::Result<String, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletAccessResult {
    pub has_access: bool,
}

/// Answers per-wallet authorization questions
#[async_trait]
pub trait WalletAccess: Send + Sync {
    async fn check_wallet_access(&self, wallet_id: &str, user_id: &str) -> WalletAccessResult;
}

/// Fixed token → user table
#[derive(Debug, Default, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> std::result::Result<String, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Fixed user → wallets table
#[derive(Debug, Default, Clone)]
pub struct StaticWalletAccess {
    wallets: HashMap<String, HashSet<String>>,
}

impl StaticWalletAccess {
    pub fn new(wallets: HashMap<String, HashSet<String>>) -> Self {
        Self { wallets }
    }

    pub fn grant(mut self, user_id: impl Into<String>, wallet_id: impl Into<String>) -> Self {
        self.wallets
            .entry(user_id.into())
            .or_default()
            .insert(wallet_id.into());
        self
    }
}

#[async_trait]
impl WalletAccess for StaticWalletAccess {
    async fn check_wallet_access(&self, wallet_id: &str, user_id: &str) -> WalletAccessResult {
        WalletAccessResult {
            has_access: self
                .wallets
                .get(user_id)
                .map(|wallets| wallets.contains(wallet_id))
                .unwrap_or(false),
        }
    }
}

/// Grants every authenticated user access to every wallet
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllWalletAccess;

#[async_trait]
impl WalletAccess for AllowAllWalletAccess {
    async fn check_wallet_access(&self, _wallet_id: &str, _user_id: &str) -> WalletAccessResult {
        WalletAccessResult { has_access: true }
    }
}

/// On-disk form of the static collaborators, as passed to `--tokens`
///
/// ```json
/// { "tokens": { "t-alice": "alice" }, "wallets": { "alice": ["w1", "w2"] } }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct StaticAuthFile {
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    #[serde(default)]
    pub wallets: HashMap<String, HashSet<String>>,
}

impl StaticAuthFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| RealtimeError::Configuration {
            message: format!("Invalid token file {}: {}", path.display(), e),
        })
    }

    pub fn into_parts(self) -> (StaticTokenVerifier, StaticWalletAccess) {
        (
            StaticTokenVerifier::new(self.tokens),
            StaticWalletAccess::new(self.wallets),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticTokenVerifier::default().with_token("t1", "alice");
        assert_eq!(verifier.verify("t1").await, Ok("alice".to_string()));
        assert_eq!(verifier.verify("nope").await, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_static_wallet_access() {
        let access = StaticWalletAccess::default().grant("alice", "w1");
        assert!(access.check_wallet_access("w1", "alice").await.has_access);
        assert!(!access.check_wallet_access("w2", "alice").await.has_access);
        assert!(!access.check_wallet_access("w1", "bob").await.has_access);
        assert!(AllowAllWalletAccess.check_wallet_access("any", "bob").await.has_access);
    }

    #[tokio::test]
    async fn test_auth_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tokens": {{"t-alice": "alice"}}, "wallets": {{"alice": ["w1"]}}}}"#
        )
        .unwrap();

        let (verifier, access) = StaticAuthFile::load(file.path()).unwrap().into_parts();
        assert_eq!(verifier.verify("t-alice").await.unwrap(), "alice");
        assert!(access.check_wallet_access("w1", "alice").await.has_access);
    }
}
