//! Destination handlers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_protocols::WorkItem;

use crate::error::DispatchError;

/// Handler subscribed to a destination.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Handle one item. An error counts as a failed attempt.
    async fn handle(&self, item: &WorkItem) -> Result<(), DispatchError>;
}

/// Adapter turning an async closure into a [`WorkHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> WorkHandler for FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    async fn handle(&self, item: &WorkItem) -> Result<(), DispatchError> {
        (self.f)(item.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn WorkHandler>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_fn_passes_item() {
        let handler = handler_fn(|item: WorkItem| async move {
            if item.payload["ok"] == true {
                Ok(())
            } else {
                Err(DispatchError::HandlerFailed("not ok".to_string()))
            }
        });

        let good = WorkItem::new("d", serde_json::json!({"ok": true}));
        let bad = WorkItem::new("d", serde_json::json!({"ok": false}));
        assert!(handler.handle(&good).await.is_ok());
        assert!(handler.handle(&bad).await.is_err());
    }
}
