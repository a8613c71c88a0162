//! Distributed lease abstractions.
//!
//! Two layers:
//!
//! - [`LeaseBackend`]: the store with a server-side expiry clock (Redis in
//!   production). Stateless; every call names the key and owner token.
//! - [`Lockable`]: one outstanding lease as seen by its holder
//!   (`DistributedLock` in `lockstep-runtime`). Stateful; remembers whether it
//!   was acquired.
//!
//! Expected contention is an error variant ([`LockError::AlreadyAcquired`])
//! that callers branch on, not a failure of the process.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors from lease operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another owner holds the lease
    #[error("Lock '{key}' is already acquired")]
    AlreadyAcquired {
        /// The contended key
        key: String,
    },

    /// This handle already holds the lease
    #[error("Lock '{key}' is already held by this handle")]
    AlreadyHeld {
        /// The key
        key: String,
    },

    /// Operation requires a held lease (caller error)
    #[error("Lock '{key}' has not been acquired")]
    NotAcquired {
        /// The key
        key: String,
    },

    /// The lease expired or changed owner before it could be extended
    #[error("Lease for '{key}' was lost")]
    LeaseLost {
        /// The key
        key: String,
    },

    /// The lease store failed
    #[error("Lease backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Whether this error means "someone else has it, try later".
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyAcquired { .. })
    }
}

/// Store providing atomic, owner-checked, expiring leases.
///
/// All three operations must be atomic on the store side; the expiry clock is
/// the store's, not the caller's.
///
/// Clones must share the same store: a dropped lock releases its lease in the
/// background through a clone.
pub trait LeaseBackend: Clone + Send + Sync + 'static {
    /// Set `key` to `token` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `true` if the lease was taken.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the store is unreachable.
    fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Reset the expiry of `key` to `ttl` from now if it is still owned by `token`.
    ///
    /// Returns `false` if the lease is gone or owned by someone else.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the store is unreachable.
    fn extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;

    /// Delete `key` if it is still owned by `token`.
    ///
    /// Returns `false` if the lease was already gone or owned by someone else.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the store is unreachable.
    fn release(
        &self,
        key: &str,
        token: &str,
    ) -> impl Future<Output = Result<bool, LockError>> + Send;
}

/// A named mutual-exclusion lease from the holder's point of view.
pub trait Lockable: Send {
    /// The lease key.
    fn key(&self) -> &str;

    /// Take the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::AlreadyAcquired`] on contention.
    fn acquire(&mut self) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Renew the lease for its full duration.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotAcquired`] if called before `acquire`, or
    /// [`LockError::LeaseLost`] if the lease is no longer ours.
    fn extend(&mut self) -> impl Future<Output = Result<(), LockError>> + Send;

    /// Give the lease back.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotAcquired`] if called before `acquire`, or
    /// [`LockError::Backend`] if the store fails.
    fn release(&mut self) -> impl Future<Output = Result<(), LockError>> + Send;
}
