//! Continuation token persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ContinuationError;
use crate::token::ContinuationToken;

/// Token store trait.
///
/// Tokens are immutable once saved; a new one is written per chunk.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a token.
    async fn save(&self, token: &ContinuationToken) -> Result<(), ContinuationError>;

    /// Load a token by ID.
    async fn get(&self, id: &Uuid) -> Result<Option<ContinuationToken>, ContinuationError>;

    /// Most recently saved token for an activity, expired or not.
    async fn latest_for_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<ContinuationToken>, ContinuationError>;

    /// Every token, oldest first. Filtered to one activity when given.
    async fn list(
        &self,
        activity_id: Option<&str>,
    ) -> Result<Vec<ContinuationToken>, ContinuationError>;

    /// Delete tokens expired at `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ContinuationError>;
}

/// In-memory token store. Keeps save order.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Vec<ContinuationToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, token: &ContinuationToken) -> Result<(), ContinuationError> {
        let mut tokens = self.tokens.write().await;
        tokens.retain(|t| t.id != token.id);
        tokens.push(token.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ContinuationToken>, ContinuationError> {
        Ok(self.tokens.read().await.iter().find(|t| t.id == *id).cloned())
    }

    async fn latest_for_activity(
        &self,
        activity_id: &str,
    ) -> Result<Option<ContinuationToken>, ContinuationError> {
        Ok(self
            .tokens
            .read()
            .await
            .iter()
            .rev()
            .find(|t| t.activity_id == activity_id)
            .cloned())
    }

    async fn list(
        &self,
        activity_id: Option<&str>,
    ) -> Result<Vec<ContinuationToken>, ContinuationError> {
        Ok(self
            .tokens
            .read()
            .await
            .iter()
            .filter(|t| activity_id.is_none_or(|id| t.activity_id == id))
            .cloned()
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ContinuationError> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|t| !t.is_expired(now));
        Ok(before - tokens.len())
    }
}
