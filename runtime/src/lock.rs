//! Distributed mutual-exclusion lease.
//!
//! [`DistributedLock`] is one holder's view of a named lease kept in a
//! [`LeaseBackend`]. Each handle carries a random owner token, so two handles
//! for the same key (in one process or many) contend with each other.
//!
//! ```text
//! new ──acquire──▶ held ──extend*──▶ held ──release──▶ released
//!        │
//!        └── AlreadyAcquired (someone else holds it)
//! ```

use crate::metrics::LockMetrics;
use crate::retry::{RetryPolicy, poll_until};
use lockstep_core::{ConfigError, LeaseBackend, LockError, Lockable};
use std::env;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use uuid::Uuid;

/// Default lease duration.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// How a lease is taken and how long it lives.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration, reset by every `extend`
    pub timeout: Duration,
    /// Wait for a contended lease instead of failing immediately
    pub blocking: bool,
    /// Longest wait in blocking mode (defaults to `timeout`)
    pub blocking_timeout: Option<Duration>,
    /// Backoff between attempts in blocking mode
    pub retry: RetryPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            blocking: false,
            blocking_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl LockOptions {
    /// Non-blocking options with the default lease duration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lease duration.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wait for contended leases, up to `wait` (or the lease duration).
    #[must_use]
    pub const fn blocking(mut self, wait: Option<Duration>) -> Self {
        self.blocking = true;
        self.blocking_timeout = wait;
        self
    }

    /// Set the backoff used while waiting.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Longest time a blocking `acquire` waits.
    #[must_use]
    pub fn wait_limit(&self) -> Duration {
        self.blocking_timeout.unwrap_or(self.timeout)
    }

    /// Load from `LOCK_TIMEOUT_MS`, `LOCK_BLOCKING` and
    /// `LOCK_BLOCKING_TIMEOUT_MS`, with defaults for missing variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every unparsable or
    /// out-of-range value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let mut options = Self::default();

        if let Ok(raw) = env::var("LOCK_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => options.timeout = Duration::from_millis(ms),
                Err(_) => problems.push(format!("LOCK_TIMEOUT_MS: '{raw}' is not a number")),
            }
        }
        if let Ok(raw) = env::var("LOCK_BLOCKING") {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => options.blocking = true,
                "0" | "false" | "no" => options.blocking = false,
                _ => problems.push(format!("LOCK_BLOCKING: '{raw}' is not a boolean")),
            }
        }
        if let Ok(raw) = env::var("LOCK_BLOCKING_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => options.blocking_timeout = Some(Duration::from_millis(ms)),
                Err(_) => {
                    problems.push(format!("LOCK_BLOCKING_TIMEOUT_MS: '{raw}' is not a number"));
                }
            }
        }

        if let Err(ConfigError::Invalid { problems: more }) = options.validate() {
            problems.extend(more);
        }
        if problems.is_empty() {
            Ok(options)
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Check the lease duration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the timeout is under a millisecond.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout < Duration::from_millis(1) {
            return Err(ConfigError::Invalid {
                problems: vec!["lock timeout must be at least 1ms".to_string()],
            });
        }
        Ok(())
    }
}

/// A named lease held through a [`LeaseBackend`].
///
/// # Example
///
/// ```
/// use lockstep_core::{LockError, Lockable};
/// use lockstep_runtime::{DistributedLock, LockOptions};
/// use lockstep_testing::InMemoryLeaseBackend;
///
/// # async fn example() -> Result<(), LockError> {
/// let backend = InMemoryLeaseBackend::new();
/// let mut first = DistributedLock::new(backend.clone(), "orders_partition_0", LockOptions::new());
/// let mut second = DistributedLock::new(backend, "orders_partition_0", LockOptions::new());
///
/// first.acquire().await?;
/// assert!(second.acquire().await.unwrap_err().is_contention());
/// first.release().await?;
/// second.acquire().await?;
/// # second.release().await?;
/// # Ok(())
/// # }
/// ```
pub struct DistributedLock<B: LeaseBackend> {
    backend: B,
    key: String,
    token: String,
    options: LockOptions,
    acquired: bool,
}

impl<B: LeaseBackend> DistributedLock<B> {
    /// Create an unacquired handle for `key` with a fresh owner token.
    pub fn new(backend: B, key: impl Into<String>, options: LockOptions) -> Self {
        Self {
            backend,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            options,
            acquired: false,
        }
    }

    /// Owner token written to the backend.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether this handle currently believes it holds the lease.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Options this handle was built with.
    #[must_use]
    pub const fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire, run `body`, then release on every exit path.
    ///
    /// If both `body` and the release fail, the release error is logged and
    /// the body's error returned.
    ///
    /// # Errors
    ///
    /// Returns the acquire error, the body's error, or the release error.
    pub async fn hold<T, E>(
        mut self,
        body: impl AsyncFnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<LockError>,
    {
        self.acquire().await?;
        let outcome = body(&mut self).await;
        let released = self.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_error)) => Err(release_error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(release_error)) => {
                tracing::error!(key = %self.key, error = %release_error, "Failed to release lock after body failed");
                Err(error)
            }
        }
    }

    async fn attempt(&self) -> Result<bool, LockError> {
        if !self.options.blocking {
            return self
                .backend
                .try_acquire(&self.key, &self.token, self.options.timeout)
                .await;
        }

        let deadline = Instant::now() + self.options.wait_limit();
        let (backend, key, token, ttl) = (&self.backend, &self.key, &self.token, self.options.timeout);
        poll_until(&self.options.retry, deadline, || backend.try_acquire(key, token, ttl)).await
    }
}

impl<B: LeaseBackend> Lockable for DistributedLock<B> {
    fn key(&self) -> &str {
        &self.key
    }

    async fn acquire(&mut self) -> Result<(), LockError> {
        if self.acquired {
            return Err(LockError::AlreadyHeld { key: self.key.clone() });
        }

        if !self.attempt().await? {
            LockMetrics::record_contended();
            tracing::info!(key = %self.key, blocking = self.options.blocking, "Lock is held by another owner");
            return Err(LockError::AlreadyAcquired { key: self.key.clone() });
        }

        self.acquired = true;
        LockMetrics::record_acquired();
        tracing::info!(
            key = %self.key,
            timeout_ms = self.options.timeout.as_millis(),
            "Lock acquired"
        );
        Ok(())
    }

    async fn extend(&mut self) -> Result<(), LockError> {
        if !self.acquired {
            return Err(LockError::NotAcquired { key: self.key.clone() });
        }

        if self
            .backend
            .extend(&self.key, &self.token, self.options.timeout)
            .await?
        {
            tracing::debug!(key = %self.key, "Lock extended");
            Ok(())
        } else {
            tracing::warn!(key = %self.key, "Lease expired or was taken over before it could be extended");
            Err(LockError::LeaseLost { key: self.key.clone() })
        }
    }

    async fn release(&mut self) -> Result<(), LockError> {
        if !self.acquired {
            return Err(LockError::NotAcquired { key: self.key.clone() });
        }

        let released = self.backend.release(&self.key, &self.token).await?;
        self.acquired = false;

        if released {
            tracing::info!(key = %self.key, "Lock released");
        } else {
            tracing::warn!(key = %self.key, "Lease already expired or taken over; nothing to release");
        }
        Ok(())
    }
}

/// A handle dropped while held (its task cancelled or aborted) releases the
/// lease in the background, owner-checked like [`Lockable::release`]. Outside
/// a tokio runtime the lease is left to expire.
impl<B: LeaseBackend> Drop for DistributedLock<B> {
    fn drop(&mut self) {
        if !self.acquired {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(key = %self.key, "Lock dropped while held outside a runtime; lease will expire on its own");
            return;
        };

        self.acquired = false;
        let backend = self.backend.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        tracing::warn!(key = %key, "Lock dropped while held; releasing in the background");

        runtime.spawn(async move {
            match backend.release(&key, &token).await {
                Ok(true) => tracing::info!(key = %key, "Dropped lock released"),
                Ok(false) => {
                    tracing::debug!(key = %key, "Dropped lock had already expired or been taken over");
                }
                Err(error) => {
                    tracing::error!(key = %key, error = %error, "Failed to release dropped lock; lease will expire on its own");
                }
            }
        });
    }
}
