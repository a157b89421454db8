//! Engine and pipeline configuration.
//!
//! Configuration comes from `CONVEYOR_*` environment variables or is
//! built in code with the `with_*` methods; there is no config-file
//! loader here.

use std::time::Duration;

/// Configuration for the state engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// When true, an unresolvable `${...}` reference fails task
    /// creation instead of yielding null/empty.
    pub strict_references: bool,

    /// Safety cap on follow-up updates chained off one ingress record
    /// (container completions, sub-workflow bubbling, restarts).
    pub max_chained_updates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict_references: false,
            max_chained_updates: 1000,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables, falling back to defaults.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CONVEYOR_STRICT_REFERENCES` | `false` |
    /// | `CONVEYOR_MAX_CHAINED_UPDATES` | `1000` |
    pub fn from_env() -> Self {
        Self {
            strict_references: env_bool("CONVEYOR_STRICT_REFERENCES", false),
            max_chained_updates: env_usize("CONVEYOR_MAX_CHAINED_UPDATES", 1000),
        }
    }

    pub fn with_strict_references(mut self, strict: bool) -> Self {
        self.strict_references = strict;
        self
    }

    pub fn with_max_chained_updates(mut self, max: usize) -> Self {
        self.max_chained_updates = max.max(1);
        self
    }
}

/// Configuration for the event pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of partition workers. Updates are routed by
    /// `hash(transaction_id) % partitions`.
    pub partitions: usize,

    /// Maximum records per consumer poll.
    pub poll_batch_size: usize,

    /// Sleep between empty polls.
    pub poll_interval: Duration,

    /// Maximum publish attempts for outbound effects before the
    /// partition worker gives up and exits.
    pub publish_max_attempts: u32,

    /// Initial backoff between publish attempts; doubles per attempt.
    pub publish_base_delay: Duration,

    /// Backoff ceiling.
    pub publish_max_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            poll_batch_size: 64,
            poll_interval: Duration::from_millis(50),
            publish_max_attempts: 8,
            publish_base_delay: Duration::from_millis(100),
            publish_max_delay: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables, falling back to defaults.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CONVEYOR_PARTITIONS` | `4` |
    /// | `CONVEYOR_POLL_BATCH_SIZE` | `64` |
    /// | `CONVEYOR_POLL_INTERVAL_MS` | `50` |
    /// | `CONVEYOR_PUBLISH_MAX_ATTEMPTS` | `8` |
    /// | `CONVEYOR_PUBLISH_BASE_DELAY_MS` | `100` |
    /// | `CONVEYOR_PUBLISH_MAX_DELAY_MS` | `10000` |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            partitions: env_usize("CONVEYOR_PARTITIONS", defaults.partitions),
            poll_batch_size: env_usize("CONVEYOR_POLL_BATCH_SIZE", defaults.poll_batch_size),
            poll_interval: Duration::from_millis(env_u64("CONVEYOR_POLL_INTERVAL_MS", 50)),
            publish_max_attempts: env_u64("CONVEYOR_PUBLISH_MAX_ATTEMPTS", 8) as u32,
            publish_base_delay: Duration::from_millis(env_u64(
                "CONVEYOR_PUBLISH_BASE_DELAY_MS",
                100,
            )),
            publish_max_delay: Duration::from_millis(env_u64(
                "CONVEYOR_PUBLISH_MAX_DELAY_MS",
                10_000,
            )),
        }
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_poll_batch_size(mut self, size: usize) -> Self {
        self.poll_batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_publish_max_attempts(mut self, attempts: u32) -> Self {
        self.publish_max_attempts = attempts.max(1);
        self
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert!(!config.strict_references);
    }

    #[test]
    fn test_pipeline_config_builders() {
        let config = PipelineConfig::new()
            .with_partitions(0)
            .with_poll_batch_size(16)
            .with_publish_max_attempts(3);

        // Partition count is clamped to at least one.
        assert_eq!(config.partitions, 1);
        assert_eq!(config.poll_batch_size, 16);
        assert_eq!(config.publish_max_attempts, 3);
    }
}
