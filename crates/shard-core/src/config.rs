//! Dataset configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main dataset configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Local shard cache settings
    pub cache: CacheConfig,

    /// Shard reader settings
    pub reader: ReaderConfig,

    /// Streaming pipeline settings
    pub stream: StreamConfig,

    /// Chunked sampler settings
    pub sampler: SamplerConfig,

    /// Logging settings
    pub logging: LogConfig,
}

impl DatasetConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DatasetConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> Result<()> {
        if self.stream.batch_size == 0 {
            return Err(invalid("stream.batch_size must be at least 1"));
        }
        if self.sampler.chunk_size == 0 {
            return Err(invalid("sampler.chunk_size must be at least 1"));
        }
        if self.stream.epoch_length == Some(0) {
            return Err(invalid("stream.epoch_length must be positive when set"));
        }
        if self.cache.max_bytes == Some(0) {
            return Err(invalid("cache.max_bytes must be positive when set"));
        }
        if self.cache.retry.backoff_multiplier < 1.0 {
            return Err(invalid("cache.retry.backoff_multiplier must be >= 1.0"));
        }
        for rule in &self.reader.pipelines {
            if !rule.command.contains("{}") {
                return Err(invalid(&format!(
                    "pipeline command for suffix '{}' has no '{{}}' placeholder",
                    rule.suffix
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub filter: String,

    /// Log every shard open and download at info level
    pub log_opens: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            log_opens: false,
        }
    }
}

/// How streaming mode reacts to shard- and record-level errors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log a warning and skip the shard or record
    #[default]
    Warn,

    /// Surface the error and end the stream
    Strict,
}

/// Route shards with a matching URL suffix through an external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRule {
    /// URL suffix, e.g. ".tar.gz"
    pub suffix: String,

    /// Shell command with `{}` replaced by the shard URL
    pub command: String,
}

/// Shard reader configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Error handling in streaming mode
    pub policy: ErrorPolicy,

    /// Suffix-triggered decompression commands
    pub pipelines: Vec<PipelineRule>,

    /// Open logging
    pub log: LogConfig,
}

/// Local shard cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory
    pub dir: PathBuf,

    /// Byte budget; `None` grows without bound
    pub max_bytes: Option<u64>,

    /// Interval of the optional background cleanup loop
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,

    /// Unreferenced entries older than this are removed by cleanup
    #[serde(with = "duration_ms")]
    pub max_age: Duration,

    /// Download retry settings
    pub retry: RetryConfig,

    /// Download logging
    pub log: LogConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("shard-cache"),
            max_bytes: None,
            cleanup_interval: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Reservoir size for per-worker sample shuffling (0 disables)
    pub shuffle_buffer: usize,

    /// Reservoir size for the cross-worker remix (0 disables)
    pub remix_buffer: usize,

    /// Samples per batch
    pub batch_size: usize,

    /// Keep the final short batch of a finite stream
    pub partial_batches: bool,

    /// Draw shards with replacement forever instead of splitting them
    pub resampled: bool,

    /// Shuffle the shard list once per epoch before splitting
    pub shuffle_shards: bool,

    /// Base seed for all stream randomness
    pub seed: u64,

    /// Batches per epoch; `None` runs until the source ends
    pub epoch_length: Option<u64>,

    /// Bounded queue depth between loader workers and the consumer
    pub prefetch_batches: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            shuffle_buffer: 1000,
            remix_buffer: 1000,
            batch_size: 32,
            partial_batches: true,
            resampled: false,
            shuffle_shards: true,
            seed: 0,
            epoch_length: None,
            prefetch_batches: 8,
        }
    }
}

/// Chunked distributed sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Samples per chunk
    pub chunk_size: u64,

    /// Shuffle indices within each chunk
    pub shuffle: bool,

    /// Base seed combined with the epoch number
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            shuffle: true,
            seed: 0,
        }
    }
}

/// Duration (de)serialization as integer milliseconds
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatasetConfig::default();
        assert_eq!(config.stream.shuffle_buffer, 1000);
        assert_eq!(config.sampler.chunk_size, 1000);
        assert!(config.cache.max_bytes.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = DatasetConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = DatasetConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.cache.cleanup_interval, config.cache.cleanup_interval);
        assert_eq!(parsed.stream.batch_size, config.stream.batch_size);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed = DatasetConfig::from_json_str(
            r#"{"stream": {"batch_size": 8, "resampled": true}, "reader": {"policy": "strict"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.stream.batch_size, 8);
        assert!(parsed.stream.resampled);
        assert_eq!(parsed.stream.shuffle_buffer, 1000);
        assert_eq!(parsed.reader.policy, ErrorPolicy::Strict);
    }

    #[test]
    fn test_validate_rejects_bad_pipeline() {
        let result = DatasetConfig::from_json_str(
            r#"{"reader": {"pipelines": [{"suffix": ".tar.gz", "command": "gzip -dc"}]}}"#,
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, r#"{"sampler": {"chunk_size": 5, "seed": 9}}"#).unwrap();

        let config = DatasetConfig::from_json_file(&path).unwrap();
        assert_eq!(config.sampler.chunk_size, 5);
        assert_eq!(config.sampler.seed, 9);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(5), Duration::from_millis(500));
    }
}
