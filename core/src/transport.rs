//! Partitioned log transport abstraction.
//!
//! A [`PartitionTransport`] is the client side of a partitioned log (Kafka,
//! Redpanda, or an in-memory script in tests). The batch consumer drives it;
//! it never interprets payloads.
//!
//! # Implementations
//!
//! - `KafkaPartitionTransport` in `lockstep-redpanda` - production (rdkafka)
//! - `ScriptedTransport` in `lockstep-testing` - deterministic tests

use crate::partition::{OffsetCursor, PartitionAssignment};
use crate::record::Record;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connecting or assigning the partition failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Fetching records failed
    #[error("Poll failed: {0}")]
    PollFailed(String),

    /// Resolving a timestamp to an offset failed
    #[error("Offset lookup failed: {0}")]
    OffsetLookupFailed(String),

    /// Persisting offsets failed
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Operation requires a started transport
    #[error("Transport not started")]
    NotStarted,

    /// Any other transport failure
    #[error("Transport error: {0}")]
    Other(String),
}

/// Client for one assigned partition of a partitioned log.
///
/// Callers invoke [`start`](Self::start) once, then any number of
/// [`poll`](Self::poll) / [`offset_for_time`](Self::offset_for_time) /
/// [`commit`](Self::commit) calls, then [`stop`](Self::stop).
pub trait PartitionTransport: Send {
    /// Connect and assign exactly one partition.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the client cannot be
    /// created or the partition cannot be assigned.
    fn start(
        &mut self,
        assignment: &PartitionAssignment,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Fetch up to `max_records` records, waiting at most `timeout`.
    ///
    /// An empty vector means nothing is currently available.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PollFailed`] on fetch failure.
    fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Record>, TransportError>> + Send;

    /// Earliest offset whose timestamp is at or after `timestamp`.
    ///
    /// `None` when no such record exists.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::OffsetLookupFailed`] on lookup failure.
    fn offset_for_time(
        &mut self,
        timestamp: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<i64>, TransportError>> + Send;

    /// Durably store the read positions in `offsets`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommitFailed`] if the broker rejects the commit.
    fn commit(
        &mut self,
        offsets: &OffsetCursor,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if shutdown fails.
    fn stop(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
