//! Shared store seam: the pub/sub transport and the ordered-list store that
//! every instance of the fabric talks to.
//!
//! Both are external, already concurrency-safe services. Callers add nothing
//! but per-call timeouts on top. `MemoryStore` serves one process;
//! `RedisStore` lets instances in separate processes share a server.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed store entry: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A live wire-level subscription. Frames arrive in publish order per publisher.
#[derive(Debug)]
pub struct WireSubscription {
    pub id: u64,
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Cross-instance publish/subscribe transport.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to every current subscriber of `topic`.
    /// Returns the number of subscribers it was handed to.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize, StoreError>;

    async fn subscribe(&self, topic: &str) -> Result<WireSubscription, StoreError>;

    async fn unsubscribe(&self, topic: &str, subscription_id: u64) -> Result<(), StoreError>;
}

/// Ordered list store with prepend/trim/range semantics (index 0 is the head).
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Insert at the head. Returns the new list length.
    async fn push_front(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError>;

    /// Keep only the inclusive index range `start..=stop`.
    async fn trim(&self, key: &str, start: usize, stop: usize) -> Result<(), StoreError>;

    /// Read the inclusive index range `start..=stop`, head first.
    async fn range(&self, key: &str, start: usize, stop: usize)
    -> Result<Vec<Vec<u8>>, StoreError>;
}

/// Run a store call under a deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
