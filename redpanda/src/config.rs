//! librdkafka client configuration for consumers and producers.
//!
//! Defaults favour large fetches and manual commits on the consumer side and
//! low-latency, leader-acknowledged sends on the producer side. Every value
//! can be overridden with a `with_*` method or from the environment.

use lockstep_core::ConfigError;
use rdkafka::config::ClientConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Oldest retained record
    #[default]
    Earliest,
    /// Only records produced after the consumer starts
    Latest,
}

impl OffsetReset {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(format!("unknown offset reset policy '{other}'")),
        }
    }
}

/// Tuning for [`KafkaPartitionTransport`](crate::KafkaPartitionTransport).
///
/// # Example
///
/// ```
/// use lockstep_redpanda::KafkaConsumerConfig;
/// use std::time::Duration;
///
/// let config = KafkaConsumerConfig::new(["localhost:9092"])
///     .with_session_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.fetch_min_bytes, 120_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConsumerConfig {
    /// Broker addresses (`host:port`)
    pub bootstrap_servers: Vec<String>,
    /// Start position when the group has no committed offset
    pub auto_offset_reset: OffsetReset,
    /// Let the client commit in the background (off: offsets are committed explicitly)
    pub enable_auto_commit: bool,
    /// Group session timeout
    pub session_timeout: Duration,
    /// Network request timeout, also bounds offset lookups and commits
    pub request_timeout: Duration,
    /// Group heartbeat interval
    pub heartbeat_interval: Duration,
    /// Back-off before retrying a failed request
    pub retry_backoff: Duration,
    /// Minimum bytes the broker accumulates before answering a fetch
    pub fetch_min_bytes: u32,
    /// Maximum bytes returned by one fetch
    pub fetch_max_bytes: u32,
    /// Maximum time the broker waits to reach `fetch_min_bytes`
    pub fetch_max_wait: Duration,
    /// Maximum bytes returned per partition by one fetch
    pub max_partition_fetch_bytes: u32,
    /// Once a poll has received a record, how long it waits for the next one
    /// before returning what it has
    pub poll_linger: Duration,
}

impl KafkaConsumerConfig {
    /// Defaults for the given brokers.
    #[must_use]
    pub fn new<S: Into<String>>(bootstrap_servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into_iter().map(Into::into).collect(),
            auto_offset_reset: OffsetReset::Earliest,
            enable_auto_commit: false,
            session_timeout: Duration::from_millis(20_000),
            request_timeout: Duration::from_millis(25_000),
            heartbeat_interval: Duration::from_millis(6_500),
            retry_backoff: Duration::from_millis(1_000),
            fetch_min_bytes: 120_000,
            fetch_max_bytes: 125_000_000,
            fetch_max_wait: Duration::from_millis(1_000),
            max_partition_fetch_bytes: 25_000_000,
            poll_linger: Duration::from_millis(100),
        }
    }

    /// Set the offset reset policy.
    #[must_use]
    pub const fn with_auto_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.auto_offset_reset = policy;
        self
    }

    /// Set the group session timeout.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the fetch sizes (`min`, `max`, per-partition max).
    #[must_use]
    pub const fn with_fetch_bytes(mut self, min: u32, max: u32, per_partition: u32) -> Self {
        self.fetch_min_bytes = min;
        self.fetch_max_bytes = max;
        self.max_partition_fetch_bytes = per_partition;
        self
    }

    /// Set the broker-side fetch wait.
    #[must_use]
    pub const fn with_fetch_max_wait(mut self, wait: Duration) -> Self {
        self.fetch_max_wait = wait;
        self
    }

    /// Set the inter-record poll linger.
    #[must_use]
    pub const fn with_poll_linger(mut self, linger: Duration) -> Self {
        self.poll_linger = linger;
        self
    }

    /// Load from environment variables.
    ///
    /// | variable | default |
    /// |----------|---------|
    /// | `KAFKA_BOOTSTRAP_SERVERS` | required, comma-separated |
    /// | `KAFKA_AUTO_OFFSET_RESET` | `earliest` |
    /// | `KAFKA_SESSION_TIMEOUT_MS` | 20000 |
    /// | `KAFKA_REQUEST_TIMEOUT_MS` | 25000 |
    /// | `KAFKA_FETCH_MAX_WAIT_MS` | 1000 |
    /// | `KAFKA_POLL_LINGER_MS` | 100 |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every missing or malformed value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let mut config = Self::new(bootstrap_servers_from_env());

        if let Some(policy) = env_value("KAFKA_AUTO_OFFSET_RESET", &mut problems) {
            config.auto_offset_reset = policy;
        }
        if let Some(ms) = env_value("KAFKA_SESSION_TIMEOUT_MS", &mut problems) {
            config.session_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("KAFKA_REQUEST_TIMEOUT_MS", &mut problems) {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("KAFKA_FETCH_MAX_WAIT_MS", &mut problems) {
            config.fetch_max_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("KAFKA_POLL_LINGER_MS", &mut problems) {
            config.poll_linger = Duration::from_millis(ms);
        }

        problems.extend(config.problems());
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Check brokers are set and sizes are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// librdkafka properties for a consumer in `group_id`.
    #[must_use]
    pub fn client_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers.join(","))
            .set("group.id", group_id)
            .set("auto.offset.reset", self.auto_offset_reset.as_str())
            .set("enable.auto.commit", self.enable_auto_commit.to_string())
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", millis(self.session_timeout))
            .set("socket.timeout.ms", millis(self.request_timeout))
            .set("heartbeat.interval.ms", millis(self.heartbeat_interval))
            .set("retry.backoff.ms", millis(self.retry_backoff))
            .set("fetch.min.bytes", self.fetch_min_bytes.to_string())
            .set("fetch.max.bytes", self.fetch_max_bytes.to_string())
            .set("fetch.wait.max.ms", millis(self.fetch_max_wait))
            .set("max.partition.fetch.bytes", self.max_partition_fetch_bytes.to_string());
        config
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = bootstrap_problems(&self.bootstrap_servers);
        if self.heartbeat_interval >= self.session_timeout {
            problems.push("`heartbeat_interval` must be shorter than `session_timeout`".to_string());
        }
        if self.max_partition_fetch_bytes > self.fetch_max_bytes {
            problems.push(
                "`max_partition_fetch_bytes` must not exceed `fetch_max_bytes`".to_string(),
            );
        }
        if self.request_timeout.is_zero() {
            problems.push("`request_timeout` must be greater than 0".to_string());
        }
        problems
    }
}

/// Tuning for [`KafkaProducer`](crate::KafkaProducer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaProducerConfig {
    /// Broker addresses (`host:port`)
    pub bootstrap_servers: Vec<String>,
    /// Replica acknowledgements required per send (`0`, `1`, or `-1` for all)
    pub acks: i16,
    /// How long the client waits to fill a batch
    pub linger: Duration,
    /// Maximum bytes per batch
    pub max_batch_size: u32,
    /// Back-off before retrying a failed send
    pub retry_backoff: Duration,
    /// Interval after which cluster metadata is refreshed
    pub metadata_max_age: Duration,
    /// Time a send may take, including retries, before it is reported failed
    pub request_timeout: Duration,
}

impl KafkaProducerConfig {
    /// Defaults for the given brokers.
    #[must_use]
    pub fn new<S: Into<String>>(bootstrap_servers: impl IntoIterator<Item = S>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into_iter().map(Into::into).collect(),
            acks: 1,
            linger: Duration::from_millis(50),
            max_batch_size: 32_000,
            retry_backoff: Duration::from_millis(500),
            metadata_max_age: Duration::from_millis(30_000),
            request_timeout: Duration::from_millis(5_000),
        }
    }

    /// Set the acknowledgement level.
    #[must_use]
    pub const fn with_acks(mut self, acks: i16) -> Self {
        self.acks = acks;
        self
    }

    /// Set the batching linger.
    #[must_use]
    pub const fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Set the per-send timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Load from environment variables.
    ///
    /// | variable | default |
    /// |----------|---------|
    /// | `KAFKA_BOOTSTRAP_SERVERS` | required, comma-separated |
    /// | `KAFKA_PRODUCER_ACKS` | 1 |
    /// | `KAFKA_PRODUCER_LINGER_MS` | 50 |
    /// | `KAFKA_PRODUCER_REQUEST_TIMEOUT_MS` | 5000 |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every missing or malformed value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let mut config = Self::new(bootstrap_servers_from_env());

        if let Some(acks) = env_value("KAFKA_PRODUCER_ACKS", &mut problems) {
            config.acks = acks;
        }
        if let Some(ms) = env_value("KAFKA_PRODUCER_LINGER_MS", &mut problems) {
            config.linger = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("KAFKA_PRODUCER_REQUEST_TIMEOUT_MS", &mut problems) {
            config.request_timeout = Duration::from_millis(ms);
        }

        problems.extend(config.problems());
        if problems.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Check brokers are set and `acks` is a known level.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// librdkafka properties for a producer.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers.join(","))
            .set("acks", self.acks.to_string())
            .set("linger.ms", millis(self.linger))
            .set("batch.size", self.max_batch_size.to_string())
            .set("retry.backoff.ms", millis(self.retry_backoff))
            .set("metadata.max.age.ms", millis(self.metadata_max_age))
            .set("request.timeout.ms", millis(self.request_timeout))
            .set("message.timeout.ms", millis(self.request_timeout));
        config
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = bootstrap_problems(&self.bootstrap_servers);
        if !matches!(self.acks, -1..=1) {
            problems.push(format!("`acks` must be -1, 0 or 1, got {}", self.acks));
        }
        if self.request_timeout.is_zero() {
            problems.push("`request_timeout` must be greater than 0".to_string());
        }
        problems
    }
}

fn bootstrap_servers_from_env() -> Vec<String> {
    env::var("KAFKA_BOOTSTRAP_SERVERS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(String::from)
        .collect()
}

fn bootstrap_problems(servers: &[String]) -> Vec<String> {
    if servers.is_empty() {
        return vec!["`bootstrap_servers` must list at least one broker".to_string()];
    }
    servers
        .iter()
        .filter(|server| !server.contains(':'))
        .map(|server| format!("bootstrap server '{server}' must be host:port"))
        .collect()
}

fn env_value<T>(name: &str, problems: &mut Vec<String>) -> Option<T>
where
    T: FromStr,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            problems.push(format!("{name}: '{raw}' is not a valid value"));
            None
        }
    }
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}
