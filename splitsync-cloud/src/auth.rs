//! Access-token collaborator.
//!
//! The login flow is owned by the host application; the engine only asks for
//! the current token and, after a 401, for a refreshed one.

use crate::error::{CloudError, CloudResult};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, or `AuthRequired` when signed out.
    async fn access_token(&self) -> CloudResult<String>;

    /// Obtain a fresh access token after the server rejected the current one.
    async fn refresh(&self) -> CloudResult<String>;
}

/// Token provider holding a token set by the host. `refresh` cannot mint a
/// new token, so it returns the current one (the host may have swapped it in).
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            token: RwLock::new(None),
        }
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> CloudResult<String> {
        self.token.read().await.clone().ok_or(CloudError::AuthRequired)
    }

    async fn refresh(&self) -> CloudResult<String> {
        self.access_token().await
    }
}
