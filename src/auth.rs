//! Session Authentication
//!
//! The auth provider is an external collaborator; the gateway only needs a
//! token-to-user resolution seam.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Token resolution seam
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError>;
}

/// Static token map for tests and local development
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: RwLock<HashMap<String, Uuid>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: Uuid) {
        self.tokens.write().insert(token.into(), user_id);
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        self.tokens
            .read()
            .get(token)
            .copied()
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new();
        let user = Uuid::now_v7();
        auth.insert("tok-1", user);

        assert_eq!(auth.authenticate("tok-1").await.unwrap(), user);
        assert!(auth.authenticate("tok-2").await.is_err());
    }
}
