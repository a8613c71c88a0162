//! Bounded waiting with exponential backoff.
//!
//! Used by blocking lock acquisition: keep re-trying a non-blocking attempt,
//! backing off between attempts, until it succeeds or a deadline passes.
//! Errors are never retried; only a negative answer is.
//!
//! # Example
//!
//! ```rust
//! use lockstep_runtime::retry::{RetryPolicy, poll_until};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .initial_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_millis(500))
//!     .multiplier(2.0)
//!     .build();
//!
//! let deadline = Instant::now() + Duration::from_secs(1);
//! let mut attempts = 0;
//! let succeeded = poll_until(&policy, deadline, || {
//!     attempts += 1;
//!     let ready = attempts >= 3;
//!     async move { Ok::<_, String>(ready) }
//! })
//! .await?;
//! assert!(succeeded);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Backoff configuration.
///
/// # Default Values
///
/// - `initial_delay`: 50ms
/// - `max_delay`: 1 second
/// - `multiplier`: 2.0 (delay doubles each attempt)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = initial_delay * (multiplier ^ attempt)
    /// Capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set initial delay.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Re-run `attempt` until it answers `true` or `deadline` passes.
///
/// The first attempt runs immediately. Sleeps never overshoot the deadline,
/// and one last attempt is made at the deadline itself.
///
/// Returns `Ok(true)` on success, `Ok(false)` if the deadline passed.
///
/// # Errors
///
/// Returns the first error produced by `attempt`, without retrying.
pub async fn poll_until<F, Fut, E>(
    policy: &RetryPolicy,
    deadline: Instant,
    mut attempt: F,
) -> Result<bool, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let mut attempt_number = 0;

    loop {
        if attempt().await? {
            if attempt_number > 0 {
                tracing::debug!(attempt = attempt_number, "Condition met after waiting");
            }
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }

        let delay = policy
            .delay_for_attempt(attempt_number)
            .min(deadline.saturating_duration_since(now));
        tracing::trace!(
            attempt = attempt_number,
            delay_ms = delay.as_millis(),
            "Condition not met, waiting"
        );
        sleep(delay).await;
        attempt_number += 1;
    }
}
