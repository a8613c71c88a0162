//! Exclusive, lease-protected consumption of one partition.
//!
//! [`LockedConsumerSession`] couples a [`DistributedLock`]-style lease to a
//! [`BatchConsumer`] so that "own this partition, and leave nothing dangling"
//! is one failable unit:
//!
//! ```text
//! enter:  acquire ─▶ start ──(start failed)──▶ release ─▶ ConsumerStart
//! batch:  yield ─▶ next requested ─▶ confirm ─▶ extend ─▶ commit
//! exit:   commit ─▶ stop ─▶ release       (every step attempted)
//! ```
//!
//! [`DistributedLock`]: crate::lock::DistributedLock

use crate::consumer::{BatchConsumer, BatchPass, ConsumerError};
use crate::metrics::SessionMetrics;
use async_stream::try_stream;
use futures::Stream;
use lockstep_core::{
    Batch, CleanupErrors, Clock, Deserializer, LockError, Lockable, PartitionAssignment,
    PartitionTransport,
};
use std::time::Instant;
use thiserror::Error;

/// Errors from locked sessions.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The lease could not be taken or renewed
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The consumer failed to start; the lease was released first
    #[error("Consumer failed to start: {source}")]
    ConsumerStart {
        /// Why the consumer did not start
        #[source]
        source: ConsumerError,
        /// Set if releasing the lease afterwards also failed
        release_error: Option<LockError>,
    },

    /// Polling, decoding or committing failed
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    /// One or more exit steps failed
    #[error("Session cleanup failed: {0}")]
    Cleanup(CleanupErrors),
}

impl SessionError {
    /// Whether the partition is owned by someone else ("try again later").
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::Lock(error) if error.is_contention())
    }
}

/// A started consumer plus the lease that makes it exclusive.
pub struct LockedConsumerSession<T, D, C, L>
where
    T: PartitionTransport,
    D: Deserializer,
    C: Clock,
    L: Lockable,
{
    consumer: BatchConsumer<T, D, C>,
    lock: L,
    closed: bool,
}

impl<T, D, C, L> LockedConsumerSession<T, D, C, L>
where
    T: PartitionTransport,
    D: Deserializer,
    C: Clock,
    L: Lockable,
{
    /// Acquire `lock`, then start `consumer`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Lock`] if the lease is contended (nothing started)
    /// - [`SessionError::ConsumerStart`] if the consumer fails to start; the
    ///   lease has been released by the time this is returned
    pub async fn enter(
        mut consumer: BatchConsumer<T, D, C>,
        mut lock: L,
    ) -> Result<Self, SessionError> {
        lock.acquire().await?;

        if let Err(source) = consumer.start().await {
            let release_error = lock.release().await.err();
            if let Some(error) = &release_error {
                tracing::error!(key = %lock.key(), error = %error, "Failed to release lock after consumer start failure");
            }
            tracing::warn!(key = %lock.key(), error = %source, "Consumer failed to start, lease released");
            return Err(SessionError::ConsumerStart {
                source,
                release_error,
            });
        }

        tracing::info!(
            key = %lock.key(),
            assignment = %consumer.assignment(),
            "Locked session entered"
        );
        Ok(Self {
            consumer,
            lock,
            closed: false,
        })
    }

    /// Like [`enter`](Self::enter), building the lock from the consumer's
    /// partition lease key.
    ///
    /// # Errors
    ///
    /// Same as [`enter`](Self::enter).
    pub async fn open(
        consumer: BatchConsumer<T, D, C>,
        make_lock: impl FnOnce(String) -> L,
    ) -> Result<Self, SessionError> {
        let lock = make_lock(consumer.lock_key());
        Self::enter(consumer, lock).await
    }

    /// Enter, run `body`, then exit on every path.
    ///
    /// If both `body` and the exit fail, the exit error is logged and the
    /// body's error returned.
    ///
    /// # Errors
    ///
    /// Returns the enter error, the body's error or the exit error.
    pub async fn scoped<R, E>(
        consumer: BatchConsumer<T, D, C>,
        lock: L,
        body: impl AsyncFnOnce(&mut Self) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<SessionError>,
    {
        let mut session = Self::enter(consumer, lock).await?;
        let outcome = body(&mut session).await;
        let key = session.lock.key().to_string();
        let exited = session.exit().await;

        match (outcome, exited) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(exit_error)) => Err(exit_error.into()),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(exit_error)) => {
                tracing::error!(key = %key, error = %exit_error, "Session exit failed after body failed");
                Err(error)
            }
        }
    }

    /// Partition owned by this session.
    #[must_use]
    pub const fn assignment(&self) -> &PartitionAssignment {
        self.consumer.assignment()
    }

    /// The wrapped consumer.
    #[must_use]
    pub const fn consumer(&self) -> &BatchConsumer<T, D, C> {
        &self.consumer
    }

    /// The held lease.
    #[must_use]
    pub const fn lock(&self) -> &L {
        &self.lock
    }

    /// Batches of one pass, checkpointing after each.
    ///
    /// When the caller asks for the next item after receiving a batch, that
    /// batch counts as processed: the lease is extended and its offsets
    /// committed before polling again. A batch whose processing failed (the
    /// caller stopped asking) is never committed, not even by
    /// [`exit`](Self::exit). A lost lease ends the stream with
    /// [`SessionError::Lock`].
    pub fn get_batches(
        &mut self,
        threshold_minutes: Option<u32>,
    ) -> impl Stream<Item = Result<Batch<D::Output>, SessionError>> + '_ {
        try_stream! {
            let mut pass = BatchPass::new(threshold_minutes);
            while let Some(batch) = self.consumer.next_batch(&mut pass).await? {
                yield batch;
                self.consumer.confirm(&mut pass);
                self.checkpoint().await?;
            }
        }
    }

    /// Extend the lease, then commit consumed offsets.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Lock`] if the lease was lost (nothing is
    /// committed), or [`SessionError::Consumer`] if the commit fails.
    pub async fn checkpoint(&mut self) -> Result<(), SessionError> {
        let started = Instant::now();
        self.lock.extend().await?;
        self.consumer.commit().await?;
        SessionMetrics::record_checkpoint(started.elapsed());
        Ok(())
    }

    /// Commit confirmed offsets, stop the consumer and release the lease.
    ///
    /// Every step is attempted even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Cleanup`] listing each failed step.
    pub async fn exit(mut self) -> Result<(), SessionError> {
        self.closed = true;
        let mut errors = CleanupErrors::new();

        errors.record("commit", self.consumer.commit().await);
        errors.record("stop", self.consumer.stop().await);
        errors.record("release", self.lock.release().await);

        if errors.is_empty() {
            tracing::info!(key = %self.lock.key(), "Locked session exited");
            Ok(())
        } else {
            tracing::error!(key = %self.lock.key(), errors = %errors, "Locked session exited with errors");
            Err(SessionError::Cleanup(errors))
        }
    }
}

impl<T, D, C, L> Drop for LockedConsumerSession<T, D, C, L>
where
    T: PartitionTransport,
    D: Deserializer,
    C: Clock,
    L: Lockable,
{
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                key = %self.lock.key(),
                "Locked session dropped without exit; uncommitted offsets will be redelivered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_recognised() {
        let contended = SessionError::Lock(LockError::AlreadyAcquired { key: "k".into() });
        let lost = SessionError::Lock(LockError::LeaseLost { key: "k".into() });
        assert!(contended.is_contention());
        assert!(!lost.is_contention());
        assert!(!SessionError::Cleanup(CleanupErrors::new()).is_contention());
    }
}
