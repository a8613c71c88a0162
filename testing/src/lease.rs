//! In-memory lease store with expiring entries.

use crate::CallLog;
use lockstep_core::{LeaseBackend, LockError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    leases: HashMap<String, (String, Instant)>,
    fail_extend: Option<LockError>,
    fail_release: Option<LockError>,
    extend_calls: usize,
    release_calls: usize,
    call_log: Option<CallLog>,
}

impl State {
    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .leases
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= Instant::now());
        if expired {
            self.leases.remove(key);
        }
    }

    fn log(&self, call: &str) {
        if let Some(log) = &self.call_log {
            log.push(call);
        }
    }
}

/// Lease store backed by a `HashMap`, expiring on tokio's clock.
///
/// Use `#[tokio::test(start_paused = true)]` and `tokio::time::advance` to
/// expire leases deterministically. Clones share state, standing in for one
/// store reached from several processes.
///
/// # Example
///
/// ```
/// use lockstep_core::LeaseBackend;
/// use lockstep_testing::InMemoryLeaseBackend;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = InMemoryLeaseBackend::new();
/// assert!(backend.try_acquire("orders_partition_0", "a", Duration::from_secs(10)).await?);
/// assert!(!backend.try_acquire("orders_partition_0", "b", Duration::from_secs(10)).await?);
/// assert_eq!(backend.holder("orders_partition_0").as_deref(), Some("a"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryLeaseBackend {
    state: Arc<Mutex<State>>,
}

impl InMemoryLeaseBackend {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `extend` fail with `error`.
    #[must_use]
    pub fn failing_extend(self, error: LockError) -> Self {
        self.state.lock().unwrap().fail_extend = Some(error);
        self
    }

    /// Make the next `release` fail with `error`.
    #[must_use]
    pub fn failing_release(self, error: LockError) -> Self {
        self.state.lock().unwrap().fail_release = Some(error);
        self
    }

    /// Log `extend` and `release` calls into `log`.
    #[must_use]
    pub fn with_call_log(self, log: CallLog) -> Self {
        self.state.lock().unwrap().call_log = Some(log);
        self
    }

    /// Current unexpired owner token of `key`.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.purge_expired(key);
        state.leases.get(key).map(|(token, _)| token.clone())
    }

    /// Time left on the lease for `key`.
    #[must_use]
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        state.purge_expired(key);
        state
            .leases
            .get(key)
            .map(|(_, expires_at)| expires_at.saturating_duration_since(Instant::now()))
    }

    /// Drop the lease for `key` as if it had expired.
    pub fn expire(&self, key: &str) {
        self.state.lock().unwrap().leases.remove(key);
    }

    /// Hand the lease for `key` to a different owner.
    pub fn steal(&self, key: &str, token: &str, ttl: Duration) {
        self.state
            .lock()
            .unwrap()
            .leases
            .insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
    }

    /// Number of `extend` calls.
    #[must_use]
    pub fn extend_calls(&self) -> usize {
        self.state.lock().unwrap().extend_calls
    }

    /// Number of `release` calls.
    #[must_use]
    pub fn release_calls(&self) -> usize {
        self.state.lock().unwrap().release_calls
    }
}

impl LeaseBackend for InMemoryLeaseBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut state = self.state.lock().unwrap();
        state.purge_expired(key);
        if state.leases.contains_key(key) {
            return Ok(false);
        }
        state
            .leases
            .insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut state = self.state.lock().unwrap();
        state.extend_calls += 1;
        state.log("extend");
        if let Some(error) = state.fail_extend.take() {
            return Err(error);
        }
        state.purge_expired(key);
        match state.leases.get_mut(key) {
            Some((owner, expires_at)) if owner == token => {
                *expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut state = self.state.lock().unwrap();
        state.release_calls += 1;
        state.log("release");
        if let Some(error) = state.fail_release.take() {
            return Err(error);
        }
        state.purge_expired(key);
        let owned = matches!(state.leases.get(key), Some((owner, _)) if owner == token);
        if owned {
            state.leases.remove(key);
        }
        Ok(owned)
    }
}
