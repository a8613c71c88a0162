//! Consumer configuration, validated once at construction.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default maximum records per poll.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;
/// Default poll wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default fill ratio under which a batch is treated as the partition tail.
pub const DEFAULT_MIN_BATCH_FILL_RATIO: f64 = 0.1;

/// Invalid configuration, with every problem found.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more fields are missing or out of range
    #[error("Invalid configuration: {}", .problems.join("; "))]
    Invalid {
        /// Human-readable description of each problem
        problems: Vec<String>,
    },
}

/// Settings shared by every batch consumer of one topic.
///
/// # Example
///
/// ```
/// use lockstep_core::ConsumerSettings;
/// use std::time::Duration;
///
/// let settings = ConsumerSettings::new("page-views", "analytics")
///     .with_batch_size(500)
///     .with_poll_timeout(Duration::from_secs(2))
///     .with_min_batch_fill_ratio(0.25);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    /// Topic name
    pub topic: String,
    /// Consumer group offsets are committed for
    pub group_id: String,
    /// Max records per poll
    pub batch_size: usize,
    /// How long one poll may wait for records
    pub poll_timeout: Duration,
    /// Batches filled below `batch_size * min_batch_fill_ratio` end a pass (0.0-1.0)
    pub min_batch_fill_ratio: f64,
}

impl ConsumerSettings {
    /// Settings for `topic` / `group_id` with default tuning.
    #[must_use]
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            min_batch_fill_ratio: DEFAULT_MIN_BATCH_FILL_RATIO,
        }
    }

    /// Set max records per poll.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set poll wait.
    #[must_use]
    pub const fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Set minimum fill ratio.
    #[must_use]
    pub const fn with_min_batch_fill_ratio(mut self, ratio: f64) -> Self {
        self.min_batch_fill_ratio = ratio;
        self
    }

    /// Load settings from environment variables.
    ///
    /// | variable | default |
    /// |----------|---------|
    /// | `CONSUMER_TOPIC` | required |
    /// | `CONSUMER_GROUP_ID` | required |
    /// | `CONSUMER_BATCH_SIZE` | 1000 |
    /// | `CONSUMER_POLL_TIMEOUT_MS` | 10000 |
    /// | `CONSUMER_MIN_BATCH_FILL_RATIO` | 0.1 |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every missing, unparsable or
    /// out-of-range value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let topic = env::var("CONSUMER_TOPIC").unwrap_or_default();
        let group_id = env::var("CONSUMER_GROUP_ID").unwrap_or_default();
        let batch_size = parse_env("CONSUMER_BATCH_SIZE", DEFAULT_BATCH_SIZE, &mut problems);
        let poll_timeout_ms = parse_env(
            "CONSUMER_POLL_TIMEOUT_MS",
            u64::try_from(DEFAULT_POLL_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            &mut problems,
        );
        let ratio = parse_env(
            "CONSUMER_MIN_BATCH_FILL_RATIO",
            DEFAULT_MIN_BATCH_FILL_RATIO,
            &mut problems,
        );

        let settings = Self {
            topic,
            group_id,
            batch_size,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            min_batch_fill_ratio: ratio,
        };
        problems.extend(settings.problems());

        if problems.is_empty() {
            Ok(settings)
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any field is missing or out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Whether a poll that returned `raw_count` records signals the partition tail.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_below_fill_ratio(&self, raw_count: usize) -> bool {
        (raw_count as f64) < self.batch_size as f64 * self.min_batch_fill_ratio
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.topic.trim().is_empty() {
            problems.push("`topic` must be set".to_string());
        }
        if self.group_id.trim().is_empty() {
            problems.push("`group_id` must be set".to_string());
        }
        if self.batch_size == 0 {
            problems.push("`batch_size` must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_batch_fill_ratio) {
            problems.push(format!(
                "`min_batch_fill_ratio` must be between 0 and 1, got {}",
                self.min_batch_fill_ratio
            ));
        }
        problems
    }
}

fn parse_env<T: FromStr>(name: &str, default: T, problems: &mut Vec<String>) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            problems.push(format!("`{name}` has an invalid value: {raw:?}"));
            default
        }),
        Err(_) => default,
    }
}
