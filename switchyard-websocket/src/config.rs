//! Hub configuration.
//!
//! Configuration can be built in code with [`HubConfig::builder`], parsed
//! from TOML with [`HubConfig::from_toml_str`], or overridden from
//! environment variables with [`HubConfig::from_env`].

use crate::error::{WebSocketError, WebSocketResult};
use crate::room::RoomConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default outbound queue capacity per client.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Default keepalive ping period.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(54);

/// Default time allowed between inbound frames.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);

/// Configuration for a [`Hub`](crate::Hub) and the clients it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
    /// Upgrade handshake timeout
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Maximum silence on the read side before the client is dropped
    #[serde(rename = "pong_wait_ms", with = "duration_ms")]
    pub pong_wait: Duration,
    /// Deadline for a single frame write
    #[serde(rename = "write_timeout_ms", with = "duration_ms")]
    pub write_timeout: Duration,
    /// Keepalive ping interval; must be shorter than `pong_wait`
    #[serde(rename = "ping_period_ms", with = "duration_ms")]
    pub ping_period: Duration,
    /// Read buffer size handed to the protocol layer
    pub read_buffer_size: usize,
    /// Write buffer size handed to the protocol layer
    pub write_buffer_size: usize,
    /// Outbound queue capacity per client
    pub send_queue_capacity: usize,
    /// Request per-message compression (not negotiated by the protocol layer)
    pub enable_compression: bool,
    /// Maximum number of live rooms, `0` for unlimited
    pub max_rooms: usize,
    /// Configuration used for implicitly created rooms
    pub default_room: RoomConfig,
    /// Allow rooms to be created on first join
    pub allow_dynamic_rooms: bool,
    /// Upper bound on a single fan-out send before it is abandoned
    #[serde(rename = "broadcast_timeout_ms", with = "duration_ms")]
    pub broadcast_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512 * 1024,
            handshake_timeout: Duration::from_secs(10),
            pong_wait: DEFAULT_PONG_WAIT,
            write_timeout: Duration::from_secs(10),
            ping_period: DEFAULT_PING_PERIOD,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            enable_compression: false,
            max_rooms: 0,
            default_room: RoomConfig::default(),
            allow_dynamic_rooms: true,
            broadcast_timeout: Duration::from_secs(5),
        }
    }
}

impl HubConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::new()
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> WebSocketResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| WebSocketError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the defaults, overridden by `<PREFIX>_*` environment variables.
    ///
    /// Recognized keys: `MAX_MESSAGE_SIZE`, `HANDSHAKE_TIMEOUT_MS`,
    /// `PONG_WAIT_MS`, `WRITE_TIMEOUT_MS`, `PING_PERIOD_MS`,
    /// `READ_BUFFER_SIZE`, `WRITE_BUFFER_SIZE`, `SEND_QUEUE_CAPACITY`,
    /// `ENABLE_COMPRESSION`, `MAX_ROOMS`, `ALLOW_DYNAMIC_ROOMS`,
    /// `BROADCAST_TIMEOUT_MS`.
    pub fn from_env(prefix: &str) -> WebSocketResult<Self> {
        let mut config = Self::default();
        let loader = EnvLoader { prefix };

        if let Some(v) = loader.parse("MAX_MESSAGE_SIZE")? {
            config.max_message_size = v;
        }
        if let Some(v) = loader.parse("HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(v);
        }
        if let Some(v) = loader.parse("PONG_WAIT_MS")? {
            config.pong_wait = Duration::from_millis(v);
        }
        if let Some(v) = loader.parse("WRITE_TIMEOUT_MS")? {
            config.write_timeout = Duration::from_millis(v);
        }
        if let Some(v) = loader.parse("PING_PERIOD_MS")? {
            config.ping_period = Duration::from_millis(v);
        }
        if let Some(v) = loader.parse("READ_BUFFER_SIZE")? {
            config.read_buffer_size = v;
        }
        if let Some(v) = loader.parse("WRITE_BUFFER_SIZE")? {
            config.write_buffer_size = v;
        }
        if let Some(v) = loader.parse("SEND_QUEUE_CAPACITY")? {
            config.send_queue_capacity = v;
        }
        if let Some(v) = loader.flag("ENABLE_COMPRESSION") {
            config.enable_compression = v;
        }
        if let Some(v) = loader.parse("MAX_ROOMS")? {
            config.max_rooms = v;
        }
        if let Some(v) = loader.flag("ALLOW_DYNAMIC_ROOMS") {
            config.allow_dynamic_rooms = v;
        }
        if let Some(v) = loader.parse("BROADCAST_TIMEOUT_MS")? {
            config.broadcast_timeout = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints.
    pub fn validate(&self) -> WebSocketResult<()> {
        if self.send_queue_capacity == 0 {
            return Err(WebSocketError::Config(
                "send_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.ping_period.is_zero() {
            return Err(WebSocketError::Config(
                "ping_period must be greater than zero".to_string(),
            ));
        }
        if self.ping_period >= self.pong_wait {
            return Err(WebSocketError::Config(format!(
                "ping_period ({:?}) must be shorter than pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        Ok(())
    }
}

struct EnvLoader<'a> {
    prefix: &'a str,
}

impl EnvLoader<'_> {
    fn var(&self, key: &str) -> Option<String> {
        let full_key = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}_{}", self.prefix, key)
        };
        env::var(full_key).ok()
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> WebSocketResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.var(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| WebSocketError::Config(format!("{}_{}: {}", self.prefix, key, e))),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.var(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }
}

/// Builder for [`HubConfig`].
#[derive(Debug, Default)]
pub struct HubConfigBuilder {
    config: HubConfig,
}

impl HubConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum inbound message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the read-side silence limit.
    pub fn pong_wait(mut self, wait: Duration) -> Self {
        self.config.pong_wait = wait;
        self
    }

    /// Set the per-frame write deadline.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    /// Set the keepalive ping period.
    pub fn ping_period(mut self, period: Duration) -> Self {
        self.config.ping_period = period;
        self
    }

    /// Set the protocol read and write buffer sizes.
    pub fn buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.config.read_buffer_size = read;
        self.config.write_buffer_size = write;
        self
    }

    /// Set the per-client outbound queue capacity.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    /// Request per-message compression.
    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.config.enable_compression = enabled;
        self
    }

    /// Limit the number of live rooms (`0` for unlimited).
    pub fn max_rooms(mut self, max: usize) -> Self {
        self.config.max_rooms = max;
        self
    }

    /// Set the configuration for implicitly created rooms.
    pub fn default_room(mut self, config: RoomConfig) -> Self {
        self.config.default_room = config;
        self
    }

    /// Allow or forbid room creation on first join.
    pub fn allow_dynamic_rooms(mut self, allow: bool) -> Self {
        self.config.allow_dynamic_rooms = allow;
        self
    }

    /// Set the fan-out send deadline.
    pub fn broadcast_timeout(mut self, timeout: Duration) -> Self {
        self.config.broadcast_timeout = timeout;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> WebSocketResult<HubConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.send_queue_capacity, 256);
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert!(config.allow_dynamic_rooms);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_ping_slower_than_pong_wait() {
        let result = HubConfig::builder()
            .ping_period(Duration::from_secs(60))
            .pong_wait(Duration::from_secs(30))
            .build();
        assert!(matches!(result, Err(WebSocketError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_queue() {
        let result = HubConfig::builder().send_queue_capacity(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = HubConfig::from_toml_str(
            r#"
            max_rooms = 2
            allow_dynamic_rooms = false
            ping_period_ms = 1000
            pong_wait_ms = 3000

            [default_room]
            max_clients = 10
            destroy_when_empty = true
            tags = ["public"]
            "#,
        )
        .unwrap();

        assert_eq!(config.max_rooms, 2);
        assert!(!config.allow_dynamic_rooms);
        assert_eq!(config.ping_period, Duration::from_secs(1));
        assert_eq!(config.default_room.max_clients, 10);
        assert!(config.default_room.destroy_when_empty);
        assert_eq!(config.default_room.tags, vec!["public".to_string()]);
        assert_eq!(config.max_message_size, 512 * 1024);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(HubConfig::from_toml_str("max_rooms = \"many\"").is_err());
    }

    #[test]
    fn test_from_env_without_overrides() {
        let config = HubConfig::from_env("SWITCHYARD_TEST_UNSET_PREFIX_93412").unwrap();
        assert_eq!(config.max_rooms, 0);
        assert_eq!(config.send_queue_capacity, DEFAULT_SEND_QUEUE_CAPACITY);
    }
}
