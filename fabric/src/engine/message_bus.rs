//! Cross-instance relay of chat messages through the shared pub/sub topic.
//!
//! Every instance publishes to the same topic and every instance (the publisher
//! included) receives what was published, so local and remote messages reach
//! the broadcaster through one code path.
//!
//! ```text
//!  publish ──► PubSub topic ──► wire frames ──► pump ──► DeliveryQueue ──► loop ──► handler
//!     │                                                       ▲
//!     └──── transport failure, or no live subscription ───────┘
//! ```
//!
//! The pump owns the wire subscription. When it cannot be opened, or the store
//! closes it, the pump keeps retrying until the bus is unsubscribed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery_queue::{DeliveryQueue, PushOutcome};
use super::message::Message;
use crate::config::BusSection;
use crate::error::ChatError;
use crate::store::{PubSub, WireSubscription, with_timeout};

/// Well-known topic all instances publish chat traffic on.
pub const BUS_TOPIC: &str = "chat:messages";

/// Serialized form carried on the topic: the message plus its chat group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub message: Message,
}

/// Where a published message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the shared topic; every subscribed instance will see it.
    Relayed,
    /// The shared topic was unreachable; only this instance will see it.
    LocalOnly,
    /// The shared topic was unreachable and the bus is not running, so
    /// nobody will see it.
    Dropped,
}

/// A failure reported on the bus error channel.
#[derive(Debug, Clone)]
pub struct BusFailure {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Tunables for publishing and local delivery.
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub queue_capacity: usize,
    /// Extra publish attempts against the shared topic before falling back to local delivery.
    pub publish_retries: u32,
    pub publish_retry_delay: Duration,
    pub call_timeout: Duration,
    /// Pause between attempts to restore a lost wire subscription.
    pub resubscribe_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            publish_retries: 0,
            publish_retry_delay: Duration::from_millis(100),
            call_timeout: Duration::from_secs(2),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

impl From<&BusSection> for BusOptions {
    fn from(bus: &BusSection) -> Self {
        Self {
            queue_capacity: bus.queue_capacity,
            publish_retries: bus.publish_retries,
            publish_retry_delay: Duration::from_millis(bus.publish_retry_delay_ms),
            call_timeout: Duration::from_millis(bus.store_timeout_ms),
            resubscribe_delay: Duration::from_millis(bus.resubscribe_delay_ms),
        }
    }
}

struct Subscription {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    processor: JoinHandle<()>,
}

pub struct MessageBus {
    transport: Arc<dyn PubSub>,
    topic: String,
    options: BusOptions,
    queue: Arc<DeliveryQueue<Envelope>>,
    failures: broadcast::Sender<BusFailure>,
    subscribed: AtomicBool,
    /// True while the pump holds an open wire subscription.
    wire_live: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn PubSub>, options: BusOptions) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            transport,
            topic: BUS_TOPIC.to_string(),
            queue: Arc::new(DeliveryQueue::new(options.queue_capacity)),
            options,
            failures,
            subscribed: AtomicBool::new(false),
            wire_live: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
        }
    }

    /// Receive transport failures (publish fallbacks, lost subscriptions).
    pub fn failures(&self) -> broadcast::Receiver<BusFailure> {
        self.failures.subscribe()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Whether this instance is currently receiving from the shared topic.
    pub fn is_wire_live(&self) -> bool {
        self.wire_live.load(Ordering::SeqCst)
    }

    /// Entries evicted from the local queue by overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Entries waiting for the processing loop.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Publish a message to every instance.
    ///
    /// Transport failures do not fail the call: the message is delivered to
    /// this instance only and the failure is reported on [`Self::failures`].
    /// While the wire subscription is down, a relayed message is also queued
    /// locally, since this instance would not hear it back.
    pub async fn publish(
        &self,
        channel: &str,
        message: Message,
    ) -> Result<PublishOutcome, ChatError> {
        let envelope = Envelope {
            channel: channel.to_string(),
            message,
        };
        let payload = serde_json::to_vec(&envelope)?;

        let mut attempt = 0;
        let err = loop {
            let listening = self.is_wire_live();
            match with_timeout(
                self.options.call_timeout,
                self.transport.publish(&self.topic, payload.clone()),
            )
            .await
            {
                Ok(receivers) => {
                    debug!(sender = %envelope.message.sender, %channel, receivers, "published message");
                    if !listening && self.is_subscribed() {
                        debug!("not listening on the bus topic, delivering locally as well");
                        self.deliver_locally(envelope);
                    }
                    return Ok(PublishOutcome::Relayed);
                }
                Err(e) if attempt < self.options.publish_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "publish failed, retrying");
                    tokio::time::sleep(self.options.publish_retry_delay).await;
                }
                Err(e) => break e,
            }
        };

        error!(error = %err, sender = %envelope.message.sender, "failed to publish message, delivering locally");
        self.report(format!("publish failed: {err}"));

        if self.deliver_locally(envelope) {
            Ok(PublishOutcome::LocalOnly)
        } else {
            Ok(PublishOutcome::Dropped)
        }
    }

    /// Queue an envelope for this instance only. False when the bus is stopped.
    fn deliver_locally(&self, envelope: Envelope) -> bool {
        match self.queue.push(envelope) {
            PushOutcome::Queued => true,
            PushOutcome::Displaced => {
                warn!("local delivery queue full, dropped oldest message");
                true
            }
            PushOutcome::Closed => {
                warn!("bus is not running, message discarded");
                false
            }
        }
    }

    /// Register the single handler for this instance and start the processing loop.
    pub async fn subscribe<F, Fut>(&self, handler: F) -> Result<(), ChatError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ChatError::AlreadySubscribed);
        }

        let mut slot = self.subscription.lock().await;
        self.queue.reopen();
        let cancel = CancellationToken::new();

        let wire = match with_timeout(
            self.options.call_timeout,
            self.transport.subscribe(&self.topic),
        )
        .await
        {
            Ok(wire) => {
                info!(topic = %self.topic, "subscribed to bus topic");
                self.wire_live.store(true, Ordering::SeqCst);
                Some(wire)
            }
            Err(e) => {
                error!(topic = %self.topic, error = %e, "bus subscription failed, local delivery only");
                self.report(format!("subscribe failed: {e}"));
                None
            }
        };

        let pump = WirePump {
            transport: self.transport.clone(),
            topic: self.topic.clone(),
            queue: self.queue.clone(),
            cancel: cancel.clone(),
            failures: self.failures.clone(),
            live: self.wire_live.clone(),
            call_timeout: self.options.call_timeout,
            resubscribe_delay: self.options.resubscribe_delay,
        };
        let pump = tokio::spawn(pump.run(wire));
        let processor = tokio::spawn(process_queue(self.queue.clone(), cancel.clone(), handler));

        *slot = Some(Subscription {
            cancel,
            pump,
            processor,
        });
        Ok(())
    }

    /// Stop the processing loop and release the wire subscription.
    ///
    /// A handler invocation already running is allowed to finish first.
    /// Entries still queued are discarded.
    pub async fn unsubscribe(&self) {
        let Some(sub) = self.subscription.lock().await.take() else {
            return;
        };

        sub.cancel.cancel();
        self.queue.close();

        if let Err(e) = sub.pump.await {
            warn!(error = %e, "bus pump task ended abnormally");
        }
        if let Err(e) = sub.processor.await {
            warn!(error = %e, "bus processing loop ended abnormally");
        }

        let discarded = self.queue.clear();
        if discarded > 0 {
            info!(discarded, "discarded undelivered bus messages");
        }

        self.subscribed.store(false, Ordering::SeqCst);
        info!(topic = %self.topic, "bus subscription closed");
    }

    fn report(&self, reason: String) {
        // No listeners is fine; the failure has already been logged.
        let _ = self.failures.send(BusFailure {
            at: Utc::now(),
            reason,
        });
    }
}

/// Moves wire frames into the local queue without ever waiting on the
/// handler, and restores the wire subscription whenever it is lost.
struct WirePump {
    transport: Arc<dyn PubSub>,
    topic: String,
    queue: Arc<DeliveryQueue<Envelope>>,
    cancel: CancellationToken,
    failures: broadcast::Sender<BusFailure>,
    live: Arc<AtomicBool>,
    call_timeout: Duration,
    resubscribe_delay: Duration,
}

impl WirePump {
    async fn run(self, mut wire: Option<WireSubscription>) {
        loop {
            let current = match wire.take() {
                Some(current) => current,
                None => match self.resubscribe().await {
                    Some(current) => current,
                    None => break,
                },
            };

            self.live.store(true, Ordering::SeqCst);
            let cancelled = self.forward(current).await;
            self.live.store(false, Ordering::SeqCst);
            if cancelled {
                break;
            }
        }
        debug!("bus pump stopped");
    }

    /// Retry until a subscription is open. `None` once cancelled.
    async fn resubscribe(&self) -> Option<WireSubscription> {
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }

            attempts += 1;
            match with_timeout(self.call_timeout, self.transport.subscribe(&self.topic)).await {
                Ok(wire) => {
                    info!(topic = %self.topic, attempts, "bus subscription restored");
                    return Some(wire);
                }
                Err(e) => debug!(topic = %self.topic, attempts, error = %e, "resubscribe failed"),
            }
        }
    }

    /// Forward frames until the subscription ends. True when cancelled.
    async fn forward(&self, mut wire: WireSubscription) -> bool {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(e) = with_timeout(
                        self.call_timeout,
                        self.transport.unsubscribe(&self.topic, wire.id),
                    )
                    .await
                    {
                        warn!(error = %e, "error unsubscribing from bus topic");
                    }
                    return true;
                }
                frame = wire.frames.recv() => frame,
            };

            let Some(bytes) = frame else {
                warn!("bus wire subscription closed by the store, resubscribing");
                let _ = self.failures.send(BusFailure {
                    at: Utc::now(),
                    reason: "wire subscription closed".into(),
                });
                return false;
            };

            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => {
                    if self.queue.push(envelope) == PushOutcome::Displaced {
                        warn!("local delivery queue full, dropped oldest message");
                    }
                }
                Err(e) => error!(error = %e, "failed to decode bus frame"),
            }
        }
    }
}

/// The single consumer: hands queued envelopes to the handler one at a time.
async fn process_queue<F, Fut>(
    queue: Arc<DeliveryQueue<Envelope>>,
    cancel: CancellationToken,
    handler: F,
) where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = queue.pop() => next,
        };
        let Some(envelope) = next else { break };

        let sender = envelope.message.sender.clone();
        if AssertUnwindSafe(handler(envelope))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(%sender, "bus handler panicked while processing message");
        }
    }
    debug!("bus processing loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc;

    use super::*;
    use crate::store::MemoryStore;

    fn bus(store: &Arc<MemoryStore>, capacity: usize) -> MessageBus {
        MessageBus::new(
            store.clone(),
            BusOptions {
                queue_capacity: capacity,
                publish_retry_delay: Duration::from_millis(1),
                resubscribe_delay: Duration::from_millis(10),
                ..BusOptions::default()
            },
        )
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn collector() -> (
        impl Fn(Envelope) -> std::future::Ready<()> + Send + Sync + 'static,
        mpsc::UnboundedReceiver<Envelope>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |env: Envelope| {
            let _ = tx.send(env);
            std::future::ready(())
        };
        (handler, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_publisher_receives_its_own_message() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let (handler, mut rx) = collector();
        bus.subscribe(handler).await.unwrap();

        let msg = Message::user("alice", "hi", Utc::now());
        let outcome = bus.publish("global", msg.clone()).await.unwrap();

        assert_eq!(outcome, PublishOutcome::Relayed);
        let env = recv(&mut rx).await;
        assert_eq!(env.channel, "global");
        assert_eq!(env.message, msg);
    }

    #[tokio::test]
    async fn test_every_instance_receives() {
        let store = Arc::new(MemoryStore::new());
        let bus_a = bus(&store, 16);
        let bus_b = bus(&store, 16);
        let (handler_a, mut rx_a) = collector();
        let (handler_b, mut rx_b) = collector();
        bus_a.subscribe(handler_a).await.unwrap();
        bus_b.subscribe(handler_b).await.unwrap();

        bus_a
            .publish("global", Message::user("alice", "from a", Utc::now()))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx_a).await.message.body, "from a");
        assert_eq!(recv(&mut rx_b).await.message.body, "from a");
    }

    #[tokio::test]
    async fn test_publish_order_is_preserved() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 64);
        let (handler, mut rx) = collector();
        bus.subscribe(handler).await.unwrap();

        for i in 0..20 {
            bus.publish("global", Message::user("a", format!("{i}"), Utc::now()))
                .await
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(recv(&mut rx).await.message.body, format!("{i}"));
        }
    }

    #[tokio::test]
    async fn test_second_subscribe_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let (h1, _rx1) = collector();
        let (h2, _rx2) = collector();

        bus.subscribe(h1).await.unwrap();
        assert!(matches!(
            bus.subscribe(h2).await,
            Err(ChatError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_local_delivery() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let mut failures = bus.failures();
        let (handler, mut rx) = collector();
        bus.subscribe(handler).await.unwrap();

        store.set_reachable(false);
        let outcome = bus
            .publish("global", Message::user("alice", "still local", Utc::now()))
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::LocalOnly);
        assert_eq!(recv(&mut rx).await.message.body, "still local");
        let failure = failures.try_recv().unwrap();
        assert!(failure.reason.contains("publish failed"));
    }

    #[tokio::test]
    async fn test_local_fallback_does_not_reach_other_instances() {
        let store = Arc::new(MemoryStore::new());
        let bus_a = bus(&store, 16);
        let bus_b = bus(&store, 16);
        let (handler_a, mut rx_a) = collector();
        let (handler_b, mut rx_b) = collector();
        bus_a.subscribe(handler_a).await.unwrap();
        bus_b.subscribe(handler_b).await.unwrap();

        store.set_reachable(false);
        bus_a
            .publish("global", Message::user("alice", "a only", Utc::now()))
            .await
            .unwrap();

        assert_eq!(recv(&mut rx_a).await.message.body, "a only");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_retries_before_falling_back() {
        let store = Arc::new(MemoryStore::new());
        let bus = MessageBus::new(
            store.clone(),
            BusOptions {
                queue_capacity: 16,
                publish_retries: 20,
                publish_retry_delay: Duration::from_millis(5),
                call_timeout: Duration::from_secs(1),
                ..BusOptions::default()
            },
        );
        let (handler, mut rx) = collector();
        bus.subscribe(handler).await.unwrap();

        store.set_reachable(false);
        let restore = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(15)).await;
                store.set_reachable(true);
            })
        };

        let outcome = bus
            .publish("global", Message::user("alice", "retried", Utc::now()))
            .await
            .unwrap();
        restore.await.unwrap();

        assert_eq!(outcome, PublishOutcome::Relayed);
        assert_eq!(recv(&mut rx).await.message.body, "retried");
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest_and_delivers_last() {
        let store = Arc::new(MemoryStore::new());
        let capacity = 8;
        let bus = bus(&store, capacity);
        let (handler, mut rx) = collector();
        bus.subscribe(handler).await.unwrap();

        // With the store down every publish lands in the local queue without
        // yielding, so the loop cannot drain in between.
        store.set_reachable(false);
        let total = 50;
        for i in 0..total {
            bus.publish("global", Message::user("a", format!("{i}"), Utc::now()))
                .await
                .unwrap();
        }
        assert_eq!(bus.dropped(), (total - capacity) as u64);

        let mut consumed = Vec::new();
        loop {
            let env = recv(&mut rx).await;
            let last = env.message.body == format!("{}", total - 1);
            consumed.push(env.message.body);
            if last {
                break;
            }
        }

        assert!(consumed.len() <= capacity);
        let expected: Vec<String> = (total - capacity..total).map(|i| i.to_string()).collect();
        assert_eq!(consumed, expected);
    }

    #[tokio::test]
    async fn test_unsubscribe_waits_for_in_flight_handler() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let started = Arc::new(tokio::sync::Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        {
            let started = started.clone();
            let finished = finished.clone();
            bus.subscribe(move |_env| {
                let started = started.clone();
                let finished = finished.clone();
                async move {
                    started.notify_one();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.store(true, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        }

        bus.publish("global", Message::user("a", "slow", Utc::now()))
            .await
            .unwrap();
        started.notified().await;

        bus.unsubscribe().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!bus.is_subscribed());
        assert_eq!(store.subscriber_count(BUS_TOPIC), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_after_unsubscribe() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let (h1, _rx1) = collector();
        bus.subscribe(h1).await.unwrap();
        bus.unsubscribe().await;

        let (h2, mut rx2) = collector();
        bus.subscribe(h2).await.unwrap();
        bus.publish("global", Message::user("a", "again", Utc::now()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx2).await.message.body, "again");
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_stop_loop() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let seen = Arc::new(AtomicUsize::new(0));

        {
            let seen = seen.clone();
            bus.subscribe(move |env: Envelope| {
                let seen = seen.clone();
                async move {
                    if env.message.body == "boom" {
                        panic!("handler failure");
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        }

        bus.publish("global", Message::user("a", "boom", Utc::now()))
            .await
            .unwrap();
        bus.publish("global", Message::user("a", "fine", Utc::now()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_during_outage_still_delivers_locally() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let bus = bus(&store, 16);
        let mut failures = bus.failures();
        let (handler, mut rx) = collector();

        bus.subscribe(handler).await.unwrap();
        assert!(failures.try_recv().is_ok());

        bus.publish("global", Message::user("a", "local", Utc::now()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.message.body, "local");
    }

    #[tokio::test]
    async fn test_subscription_restored_after_outage() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let bus_a = bus(&store, 16);
        let bus_b = bus(&store, 16);
        let (handler_a, mut rx_a) = collector();
        bus_a.subscribe(handler_a).await.unwrap();
        assert!(!bus_a.is_wire_live());

        store.set_reachable(true);

        // Relayed to the others, and still seen here while not listening.
        let outcome = bus_a
            .publish("global", Message::user("alice", "own", Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Relayed);
        assert_eq!(recv(&mut rx_a).await.message.body, "own");

        wait_until("wire subscription", || bus_a.is_wire_live()).await;
        assert_eq!(store.subscriber_count(BUS_TOPIC), 1);

        bus_b
            .publish("global", Message::user("bob", "from b", Utc::now()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx_a).await.message.body, "from b");

        bus_a
            .publish("global", Message::user("alice", "once", Utc::now()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx_a).await.message.body, "once");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribes_when_store_drops_subscription() {
        let store = Arc::new(MemoryStore::new());
        let bus_a = bus(&store, 16);
        let bus_b = bus(&store, 16);
        let mut failures = bus_a.failures();
        let (handler_a, mut rx_a) = collector();
        bus_a.subscribe(handler_a).await.unwrap();

        assert_eq!(store.close_subscriptions(BUS_TOPIC), 1);
        let failure = tokio::time::timeout(Duration::from_secs(2), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failure.reason.contains("closed"));

        wait_until("resubscribe", || store.subscriber_count(BUS_TOPIC) == 1).await;
        wait_until("wire subscription", || bus_a.is_wire_live()).await;

        bus_b
            .publish("global", Message::user("bob", "after restart", Utc::now()))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx_a).await.message.body, "after restart");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_resubscribing() {
        let store = Arc::new(MemoryStore::new());
        store.set_reachable(false);
        let bus = bus(&store, 16);
        let (handler, _rx) = collector();
        bus.subscribe(handler).await.unwrap();

        bus.unsubscribe().await;
        store.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.subscriber_count(BUS_TOPIC), 0);
        assert!(!bus.is_wire_live());
    }

    #[tokio::test]
    async fn test_fallback_on_stopped_bus_reports_dropped() {
        let store = Arc::new(MemoryStore::new());
        let bus = bus(&store, 16);
        let (handler, _rx) = collector();
        bus.subscribe(handler).await.unwrap();
        bus.unsubscribe().await;

        store.set_reachable(false);
        let outcome = bus
            .publish("global", Message::user("a", "nowhere", Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(bus.queued(), 0);
    }
}
