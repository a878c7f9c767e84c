use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ListStore, PubSub, StoreError, WireSubscription};

/// Shared store backed by a Redis server: PUBLISH/SUBSCRIBE for the bus and
/// LPUSH/LTRIM/LRANGE for history. Instances in separate processes pointed at
/// the same server form one cluster.
///
/// Nothing is dialed until the first call, and a broken command connection is
/// dropped and re-dialed on the next call, so a server outage shows up as
/// `Unavailable` errors rather than a dead store.
pub struct RedisStore {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    subscriptions: DashMap<u64, CancellationToken>,
    next_subscription: AtomicU64,
}

impl RedisStore {
    /// Parse `url` (`redis://host:port/db`). Does not connect.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        info!("connected to redis");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one command, forgetting the connection if it broke.
    async fn call<T, F, Fut>(&self, command: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match command(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    warn!(error = %e, "redis connection lost");
                    self.conn.lock().await.take();
                }
                Err(unavailable(e))
            }
        }
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn index(i: usize) -> isize {
    isize::try_from(i).unwrap_or(isize::MAX)
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize, StoreError> {
        self.call(|mut conn| async move {
            let receivers: RedisResult<usize> = conn.publish(topic, payload).await;
            receivers
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> Result<WireSubscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(topic).await.map_err(unavailable)?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.subscriptions.insert(id, cancel.clone());

        let topic_name = topic.to_string();
        tokio::spawn(async move {
            let mut messages = std::pin::pin!(pubsub.into_on_message());
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = messages.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!(topic = %topic_name, subscription_id = id, "redis subscription ended");
                    break;
                };
                if tx.send(msg.get_payload_bytes().to_vec()).is_err() {
                    break;
                }
            }
            debug!(topic = %topic_name, subscription_id = id, "redis subscription task stopped");
        });

        debug!(%topic, subscription_id = id, "redis subscription opened");
        Ok(WireSubscription { id, frames: rx })
    }

    async fn unsubscribe(&self, _topic: &str, subscription_id: u64) -> Result<(), StoreError> {
        // Dropping the dedicated pub/sub connection ends the subscription server-side.
        if let Some((_, cancel)) = self.subscriptions.remove(&subscription_id) {
            cancel.cancel();
        }
        Ok(())
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn push_front(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        self.call(|mut conn| async move {
            let len: RedisResult<usize> = conn.lpush(key, value).await;
            len
        })
        .await
    }

    async fn trim(&self, key: &str, start: usize, stop: usize) -> Result<(), StoreError> {
        self.call(|mut conn| async move {
            let done: RedisResult<()> = conn.ltrim(key, index(start), index(stop)).await;
            done
        })
        .await
    }

    async fn range(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.call(|mut conn| async move {
            let entries: RedisResult<Vec<Vec<u8>>> =
                conn.lrange(key, index(start), index(stop)).await;
            entries
        })
        .await
    }
}
