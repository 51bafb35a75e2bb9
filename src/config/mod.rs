use serde::Deserialize;
use std::time::Duration;
use std::{fs, path::Path};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Tokio task per connection.
    Spawned,
    /// One mio event loop on a dedicated thread.
    Polled,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// Publisher writes to every candidate inline.
    Direct,
    /// Round-robin worker pool; publisher awaits every completion.
    Pooled,
    /// Per-client worker binding; fire-and-forget.
    Sticky,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub transport: Transport,
    /// Echo a `ServerResponse` after every non-bye command.
    pub ack_responses: bool,
    /// Further delivery passes after a failed send.
    pub max_send_retries: u32,
    pub max_connections: usize,
    /// Frames a session outbox buffers before senders see backpressure.
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7171".to_string(),
            transport: Transport::Spawned,
            ack_responses: true,
            max_send_retries: 2,
            max_connections: 1024,
            outbox_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliveryConfig {
    pub strategy: DeliveryStrategy,
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry_interval_ms: u64,
    /// Sticky bindings idle longer than this are evicted.
    pub sticky_idle_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            strategy: DeliveryStrategy::Direct,
            workers: 4,
            queue_capacity: 512,
            retry_interval_ms: 50,
            sticky_idle_ms: 300_000,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn sticky_idle(&self) -> Duration {
        Duration::from_millis(self.sticky_idle_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Flush once this many bytes are buffered.
    pub max_bytes: usize,
    /// Flush once the oldest buffered byte is this old.
    pub max_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 64 * 1024,
            max_delay_ms: 5,
        }
    }
}

impl BatchConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Replay window for sent application messages.
    pub retention_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Zero disables acknowledged sends.
    pub ack_timeout_ms: u64,
    pub inbox_capacity: usize,
    /// Zero disables reconnection.
    pub reconnect_count: u32,
    pub reconnect_interval_ms: u64,
    /// Catch-up overlap subtracted from the last received timestamp.
    pub reconnect_buffer_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 1_000,
            inbox_capacity: 256,
            reconnect_count: 3,
            reconnect_interval_ms: 1_000,
            reconnect_buffer_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub delivery: DeliveryConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub client: ClientConfig,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    Ok(config)
}
