use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::chat_engine::ChatEngine;

/// Start the periodic server time notice for one instance.
/// Returns `None` without spawning anything when notifications are disabled.
/// The task stops when the cancellation token is triggered.
pub fn spawn_server_notifications(
    engine: Arc<ChatEngine>,
    interval: Duration,
    enabled: bool,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !enabled {
        info!(instance = %engine.instance_name(), "server notifications are disabled");
        return None;
    }

    info!(
        instance = %engine.instance_name(),
        interval_secs = interval.as_secs(),
        "server notification service started"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; the first notice goes out one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(instance = %engine.instance_name(), "server notification service stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match engine.server_ping().await {
                        Ok(outcome) => debug!(?outcome, "sent server notification"),
                        Err(e) => error!(error = %e, "error sending server notification"),
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::ServerConfig;
    use crate::store::MemoryStore;

    async fn engine() -> Arc<ChatEngine> {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(ChatEngine::new("notify", &ServerConfig::default(), store));
        engine.start().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_disabled_does_not_start() {
        let engine = engine().await;
        let handle = spawn_server_notifications(
            engine,
            Duration::from_millis(10),
            false,
            CancellationToken::new(),
        );
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_sends_pings_until_cancelled() {
        let engine = engine().await;
        let (mut session, mut rx): (_, mpsc::Receiver<_>) = engine.open_session();
        session.join("listener").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_server_notifications(
            engine.clone(),
            Duration::from_millis(20),
            true,
            cancel.clone(),
        )
        .unwrap();

        let ping = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = rx.recv().await.unwrap();
                if msg.sender.starts_with("SERVER:") {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ping.sender, "SERVER:notify");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
