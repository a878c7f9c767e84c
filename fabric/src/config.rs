use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::info;

/// Top-level configuration, loaded from chatfabric.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub chat: ChatSection,
    pub bus: BusSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address of the first instance. Further instances use the following ports.
    pub web_address: String,
    /// Name shown in server pings (`SERVER:<name>`).
    pub instance_name: String,
    /// Instances to run in this process, all sharing one store.
    pub instances: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:5000".into(),
            instance_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "chatfabric".into()),
            instances: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    pub max_username_length: usize,
    pub max_message_length: usize,
    pub max_history_messages: usize,
    pub notification_interval_secs: u64,
    pub notifications_enabled: bool,
    /// Broadcast group every session joins.
    pub channel: String,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_username_length: 50,
            max_message_length: 4000,
            max_history_messages: 100,
            notification_interval_secs: 30,
            notifications_enabled: true,
            channel: "global".into(),
        }
    }
}

impl ChatSection {
    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Local delivery queue bound; the oldest entry is dropped when full.
    pub queue_capacity: usize,
    /// Extra publish attempts before falling back to local-only delivery.
    pub publish_retries: u32,
    pub publish_retry_delay_ms: u64,
    /// Deadline for each call to the shared store.
    pub store_timeout_ms: u64,
    /// Pause between attempts to restore a lost topic subscription.
    pub resubscribe_delay_ms: u64,
    /// Shared store server, e.g. `redis://127.0.0.1:6379/`. Unset runs every
    /// instance of this process against an in-process store.
    pub store_url: Option<String>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            publish_retries: 0,
            publish_retry_delay_ms: 100,
            store_timeout_ms: 2000,
            resubscribe_delay_ms: 1000,
            store_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 3000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values; the result is range-checked.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHATFABRIC_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> anyhow::Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
                None => Ok(None),
            }
        }

        if let Some(v) = lookup("CHATFABRIC_WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Some(v) = lookup("CHATFABRIC_INSTANCE_NAME") {
            self.server.instance_name = v;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_INSTANCES")? {
            self.server.instances = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_MAX_USERNAME_LENGTH")? {
            self.chat.max_username_length = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_MAX_MESSAGE_LENGTH")? {
            self.chat.max_message_length = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_MAX_HISTORY_MESSAGES")? {
            self.chat.max_history_messages = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_NOTIFICATION_INTERVAL_SECS")? {
            self.chat.notification_interval_secs = n;
        }
        if let Some(b) = parsed(&lookup, "CHATFABRIC_NOTIFICATIONS_ENABLED")? {
            self.chat.notifications_enabled = b;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_QUEUE_CAPACITY")? {
            self.bus.queue_capacity = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_PUBLISH_RETRIES")? {
            self.bus.publish_retries = n;
        }
        if let Some(v) = lookup("CHATFABRIC_STORE_URL") {
            self.bus.store_url = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_MAX_RECONNECT_ATTEMPTS")? {
            self.client.max_reconnect_attempts = n;
        }
        if let Some(n) = parsed(&lookup, "CHATFABRIC_RECONNECT_DELAY_MS")? {
            self.client.reconnect_delay_ms = n;
        }
        Ok(())
    }

    /// Reject values outside the supported ranges.
    pub fn validate(&self) -> anyhow::Result<()> {
        fn in_range<T: PartialOrd + std::fmt::Display>(
            name: &str,
            value: T,
            min: T,
            max: T,
        ) -> anyhow::Result<()> {
            if value < min || value > max {
                bail!("{name} must be between {min} and {max}, got {value}");
            }
            Ok(())
        }

        in_range(
            "chat.max_username_length",
            self.chat.max_username_length,
            1,
            100,
        )?;
        in_range(
            "chat.max_message_length",
            self.chat.max_message_length,
            1,
            10_000,
        )?;
        in_range(
            "chat.max_history_messages",
            self.chat.max_history_messages,
            1,
            1000,
        )?;
        in_range(
            "chat.notification_interval_secs",
            self.chat.notification_interval_secs,
            1,
            3600,
        )?;
        in_range("server.instances", self.server.instances, 1, 64)?;

        if self.chat.channel.trim().is_empty() {
            bail!("chat.channel cannot be empty");
        }
        if self.bus.queue_capacity == 0 {
            bail!("bus.queue_capacity must be at least 1");
        }
        if self.bus.store_timeout_ms == 0 {
            bail!("bus.store_timeout_ms must be at least 1");
        }
        if self.bus.resubscribe_delay_ms == 0 {
            bail!("bus.resubscribe_delay_ms must be at least 1");
        }
        if let Some(url) = &self.bus.store_url
            && !(url.starts_with("redis://") || url.starts_with("rediss://"))
        {
            bail!("bus.store_url must be a redis:// or rediss:// URL, got {url}");
        }
        if self.client.max_reconnect_attempts == 0 {
            bail!("client.max_reconnect_attempts must be at least 1");
        }
        Ok(())
    }
}
