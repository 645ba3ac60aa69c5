//! Configuration for the relay.
//!
//! Configuration can be built programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"25s"`, `"500ms"`); an
//! unparseable duration falls back to the field's default.
//!
//! # Quick Start
//!
//! ```rust
//! use registry_relay::config::RelayConfig;
//!
//! let config = RelayConfig::for_testing("registry-events", "my-system");
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── broker: BrokerConfig                 # stream, reference, Redis URL
//! ├── consumer: ConsumerConfig             # checkpoint cadence, retry, drain
//! ├── dispatcher: DispatcherConfig         # jitter, rate limit, retry
//! ├── checkpoint: CheckpointConfig         # sqlite | broker | memory
//! ├── lookup: LookupConfig                 # entity detail endpoint
//! └── initial_population: InitialPopulationConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! broker:
//!   redis_url: "redis://broker:6379"
//!   stream: "registry-events"
//!   reference: "my-system"
//!
//! consumer:
//!   checkpoint_interval: 10
//!   retry_delay: "25s"
//!
//! checkpoint:
//!   backend: sqlite
//!   sqlite_path: "/var/lib/relay/checkpoints.db"
//!
//! lookup:
//!   base_url: "https://registry.example/api"
//!   username: "relay"
//!   password: "secret"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::OffsetSpec;
use crate::error::{RelayError, Result};
use crate::resilience::{Jitter, RateLimitConfig};

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub initial_population: InitialPopulationConfig,
}

impl RelayConfig {
    /// In-memory checkpoints and millisecond delays.
    pub fn for_testing(stream: &str, reference: &str) -> Self {
        Self {
            broker: BrokerConfig {
                stream: stream.to_string(),
                reference: reference.to_string(),
                ..Default::default()
            },
            consumer: ConsumerConfig {
                retry_delay: "10ms".to_string(),
                drain_grace: "100ms".to_string(),
                ..Default::default()
            },
            dispatcher: DispatcherConfig {
                min_delay_ms: 0,
                max_delay_ms: 0,
                ..Default::default()
            },
            checkpoint: CheckpointConfig::in_memory(),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| RelayError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.stream.trim().is_empty() {
            return Err(RelayError::Config("broker.stream must not be empty".into()));
        }
        if self.broker.reference.trim().is_empty() {
            return Err(RelayError::Config("broker.reference must not be empty".into()));
        }
        if self.consumer.checkpoint_interval == 0 {
            return Err(RelayError::Config("consumer.checkpoint_interval must be at least 1".into()));
        }
        if self.dispatcher.min_delay_ms > self.dispatcher.max_delay_ms {
            return Err(RelayError::Config(format!(
                "dispatcher.min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.dispatcher.min_delay_ms, self.dispatcher.max_delay_ms
            )));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(RelayError::Config("dispatcher.max_attempts must be at least 1".into()));
        }
        if self.checkpoint.backend == CheckpointBackend::Sqlite && self.checkpoint.sqlite_path.is_empty() {
            return Err(RelayError::Config("checkpoint.sqlite_path must be set for the sqlite backend".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Stream broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream to consume.
    #[serde(default)]
    pub stream: String,

    /// Unique consumer identity. Checkpoints are keyed by it.
    #[serde(default)]
    pub reference: String,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,

    /// XREAD block timeout.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per XREAD.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Key prefix for broker-side offset tracking.
    #[serde(default = "default_offsets_key")]
    pub offsets_key: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connection_timeout() -> String {
    "10s".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_offsets_key() -> String {
    "relay:offsets".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            stream: String::new(),
            reference: String::new(),
            connection_timeout: default_connection_timeout(),
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
            offsets_key: default_offsets_key(),
        }
    }
}

impl BrokerConfig {
    pub fn connection_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connection_timeout, Duration::from_secs(10))
    }

    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Where to start when no offset is stored anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackOffset {
    First,
    #[default]
    Last,
    Next,
}

impl FallbackOffset {
    pub fn to_spec(self) -> OffsetSpec {
        match self {
            Self::First => OffsetSpec::First,
            Self::Last => OffsetSpec::Last,
            Self::Next => OffsetSpec::Next,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Commit the offset every this many deliveries.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Fixed delay between setup attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// How long an in-flight delivery may run after cancellation.
    #[serde(default = "default_drain_grace")]
    pub drain_grace: String,

    /// Deliveries buffered between the reader task and the consumer loop.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub fallback_offset: FallbackOffset,
}

fn default_checkpoint_interval() -> u64 {
    10
}

fn default_retry_delay() -> String {
    "25s".to_string()
}

fn default_drain_grace() -> String {
    "1s".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            retry_delay: default_retry_delay(),
            drain_grace: default_drain_grace(),
            channel_capacity: default_channel_capacity(),
            fallback_offset: FallbackOffset::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn retry_delay_duration(&self) -> Duration {
        parse_duration_or(&self.retry_delay, Duration::from_secs(25))
    }

    pub fn drain_grace_duration(&self) -> Duration {
        parse_duration_or(&self.drain_grace, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatcherConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Lower bound of the random pre-lookup delay.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound of the random pre-lookup delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Put a token bucket in front of the lookup service.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Lookup + sink attempts per event. 1 drops the event on the first
    /// failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts.
    #[serde(default = "default_dispatch_retry_delay")]
    pub retry_delay: String,
}

fn default_min_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_rate_limit_per_sec() -> u32 {
    10
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    1
}

fn default_dispatch_retry_delay() -> String {
    "1s".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            max_attempts: default_max_attempts(),
            retry_delay: default_dispatch_retry_delay(),
        }
    }
}

impl DispatcherConfig {
    pub fn jitter(&self) -> Jitter {
        Jitter::new(
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_duration_or(&self.retry_delay, Duration::from_secs(1))
    }

    /// `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Local SQLite file.
    #[default]
    Sqlite,
    /// Offsets tracked on the broker.
    Broker,
    /// Lost on restart.
    Memory,
}

/// Checkpoint persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    "relay_checkpoints.db".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Sqlite,
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl CheckpointConfig {
    pub fn in_memory() -> Self {
        Self {
            backend: CheckpointBackend::Memory,
            sqlite_path: String::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LookupConfig / InitialPopulationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Entity detail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_lookup_timeout")]
    pub timeout: String,
}

fn default_lookup_timeout() -> String {
    "30s".to_string()
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: None,
            password: None,
            timeout: default_lookup_timeout(),
        }
    }
}

impl LookupConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(30))
    }
}

/// Bulk export used by initial population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialPopulationConfig {
    #[serde(default)]
    pub export_url: String,
    /// Whole-export timeout. Exports are large.
    #[serde(default = "default_export_timeout")]
    pub timeout: String,
}

fn default_export_timeout() -> String {
    "10m".to_string()
}

impl Default for InitialPopulationConfig {
    fn default() -> Self {
        Self {
            export_url: String::new(),
            timeout: default_export_timeout(),
        }
    }
}

impl InitialPopulationConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration_or(&self.timeout, Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.consumer.checkpoint_interval, 10);
        assert_eq!(config.consumer.retry_delay_duration(), Duration::from_secs(25));
        assert_eq!(config.consumer.drain_grace_duration(), Duration::from_secs(1));
        assert_eq!(config.consumer.fallback_offset, FallbackOffset::Last);
        assert_eq!(config.dispatcher.min_delay_ms, 50);
        assert_eq!(config.dispatcher.max_delay_ms, 5000);
        assert_eq!(config.dispatcher.max_attempts, 1);
        assert_eq!(config.dispatcher.retry_delay_duration(), Duration::from_secs(1));
        assert_eq!(config.broker.connection_timeout_duration(), Duration::from_secs(10));
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Sqlite);
        assert_eq!(config.lookup.timeout_duration(), Duration::from_secs(30));
        assert_eq!(config.initial_population.timeout_duration(), Duration::from_secs(600));
    }

    #[test]
    fn test_default_requires_stream_and_reference() {
        assert!(RelayConfig::default().validate().is_err());
        assert!(RelayConfig::for_testing("s", "r").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = RelayConfig::for_testing("s", "r");
        config.consumer.checkpoint_interval = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_delay() {
        let mut config = RelayConfig::for_testing("s", "r");
        config.dispatcher.min_delay_ms = 10;
        config.dispatcher.max_delay_ms = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = RelayConfig::for_testing("s", "r");
        config.dispatcher.max_attempts = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn test_duration_formats() {
        let cases = [
            ("25s", Duration::from_secs(25)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];
        for (input, expected) in cases {
            let config = ConsumerConfig {
                retry_delay: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.retry_delay_duration(), expected, "input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = ConsumerConfig {
            retry_delay: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.retry_delay_duration(), Duration::from_secs(25));
    }

    #[test]
    fn test_yaml() {
        let yaml = r#"
broker:
  redis_url: "redis://broker:6379"
  stream: "registry-events"
  reference: "my-system"
consumer:
  checkpoint_interval: 5
  fallback_offset: first
dispatcher:
  rate_limit_enabled: true
  rate_limit_per_sec: 3
  max_attempts: 4
  retry_delay: "250ms"
checkpoint:
  backend: broker
lookup:
  base_url: "https://registry.example/api"
  username: "relay"
"#;
        let config = RelayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.broker.stream, "registry-events");
        assert_eq!(config.consumer.checkpoint_interval, 5);
        assert_eq!(config.consumer.fallback_offset.to_spec(), OffsetSpec::First);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Broker);
        assert_eq!(config.lookup.username.as_deref(), Some("relay"));
        assert_eq!(config.lookup.password, None);

        let rate = config.dispatcher.rate_limit_config().unwrap();
        assert_eq!(rate.refill_rate, 3);
        assert_eq!(rate.burst_size, 10);
        assert_eq!(config.dispatcher.max_attempts, 4);
        assert_eq!(config.dispatcher.retry_delay_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_yaml_invalid_is_config_error() {
        let err = RelayConfig::from_yaml_str("broker: [").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "broker:\n  stream: s\n  reference: r\n").unwrap();
        let config = RelayConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.broker.reference, "r");
    }

    #[test]
    fn test_jitter_from_config() {
        let jitter = DispatcherConfig::default().jitter();
        assert_eq!(jitter.min(), Duration::from_millis(50));
        assert_eq!(jitter.max(), Duration::from_millis(5000));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RelayConfig::for_testing("s", "r");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.broker.stream, "s");
        assert_eq!(parsed.checkpoint.backend, CheckpointBackend::Memory);
    }
}
