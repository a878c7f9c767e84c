use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ListStore, PubSub, StoreError, WireSubscription};

/// In-process shared store. One `Arc<MemoryStore>` handed to several engines
/// behaves like a shared pub/sub + list server for all of them.
///
/// `set_reachable(false)` makes every call fail with `Unavailable`, which is
/// how outages are simulated.
pub struct MemoryStore {
    lists: DashMap<String, VecDeque<Vec<u8>>>,
    topics: DashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>,
    next_subscription: AtomicU64,
    reachable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            lists: DashMap::new(),
            topics: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }

    /// Drop every subscription on a topic, as a server restart would.
    /// Subscribers see their frame stream end.
    pub fn close_subscriptions(&self, topic: &str) -> usize {
        self.topics
            .remove(topic)
            .map(|(_, subs)| subs.len())
            .unwrap_or(0)
    }

    /// Current length of a list (0 when absent).
    pub fn list_len(&self, key: &str) -> usize {
        self.lists.get(key).map(|list| list.len()).unwrap_or(0)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize, StoreError> {
        self.check_reachable()?;

        let Some(mut subs) = self.topics.get_mut(topic) else {
            return Ok(0);
        };

        // Subscribers whose receiver is gone are pruned on the way.
        subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        Ok(subs.len())
    }

    async fn subscribe(&self, topic: &str) -> Result<WireSubscription, StoreError> {
        self.check_reachable()?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));

        debug!(%topic, subscription_id = id, "wire subscription opened");
        Ok(WireSubscription { id, frames: rx })
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: u64) -> Result<(), StoreError> {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|(id, _)| *id != subscription_id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
        Ok(())
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push_front(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        self.check_reachable()?;

        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        Ok(list.len())
    }

    async fn trim(&self, key: &str, start: usize, stop: usize) -> Result<(), StoreError> {
        self.check_reachable()?;

        if let Some(mut list) = self.lists.get_mut(key) {
            if start > stop || start >= list.len() {
                list.clear();
            } else {
                list.truncate(stop + 1);
                list.drain(..start);
            }
        }
        self.lists.remove_if(key, |_, list| list.is_empty());
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.check_reachable()?;

        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start)
            .take(stop - start + 1)
            .cloned()
            .collect())
    }
}
