//! # Lockstep Testing
//!
//! In-memory doubles for every seam in `lockstep-core`:
//!
//! - [`ScriptedTransport`]: replays scripted polls and records commits
//! - [`InMemoryLeaseBackend`]: TTL leases on tokio's (pausable) clock
//! - [`CountingFactory`]: counts resource constructions and disposals
//! - [`FixedClock`]: deterministic "now"
//! - [`CallLog`]: shared, ordered log of calls across doubles
//!
//! ## Example
//!
//! ```
//! use lockstep_testing::{ScriptedTransport, json_records};
//!
//! let transport = ScriptedTransport::new()
//!     .then_poll(json_records(0, 0..10, |i| serde_json::json!({ "n": i })));
//! assert_eq!(transport.remaining_polls(), 1);
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned test mutexes

pub mod lease;
pub mod resource;
pub mod transport;

use chrono::{DateTime, Utc};
use lockstep_core::Clock;
use std::sync::{Arc, Mutex};

pub use lease::InMemoryLeaseBackend;
pub use resource::{CountedResource, CountingFactory};
pub use transport::{ScriptedTransport, json_records};

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use lockstep_testing::mocks::FixedClock;
    /// use lockstep_core::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use mocks::{FixedClock, test_clock};

/// Ordered record of calls made on the doubles sharing it.
///
/// Lets a test assert cross-component ordering such as
/// "commit, then stop, then release".
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    /// Snapshot of every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
///
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn call_log_is_shared_between_clones() {
        let log = CallLog::new();
        let clone = log.clone();
        log.push("a");
        clone.push("b");
        assert_eq!(log.calls(), vec!["a", "b"]);
    }
}
