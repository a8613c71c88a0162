//! Batched consumer bound to one partition.
//!
//! [`BatchConsumer`] pulls bounded batches from a [`PartitionTransport`],
//! decodes them with a [`Deserializer`] and remembers how far it got. Offsets
//! only become durable on [`BatchConsumer::commit`]; anything yielded but not
//! committed is read again by the next consumer (at-least-once).
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start──▶ Started ──stop──▶ Stopped
//!                      │  ▲
//!            next_batch / commit
//! ```
//!
//! ## One pass
//!
//! A pass ([`BatchPass`]) is one run through the currently available records:
//!
//! 1. An optional age threshold is resolved once to an offset limit.
//! 2. Each step polls up to `batch_size` records.
//! 3. An empty poll ends the pass.
//! 4. Records at or past the offset limit are dropped; if none survive, the
//!    pass ends without yielding.
//! 5. A poll that returned fewer than `batch_size * min_batch_fill_ratio`
//!    records (counted before filtering) is the last one of the pass.
//! 6. The offset after the last yielded record becomes the commit cursor
//!    once the caller comes back for the next batch (or calls
//!    [`BatchConsumer::confirm`]). A batch the caller abandons is never
//!    committed and is read again by the next owner.

use crate::metrics::ConsumerMetrics;
use async_stream::try_stream;
use chrono::TimeDelta;
use futures::Stream;
use lockstep_core::{
    Batch, Clock, ConfigError, ConsumerSettings, DeserializeError, Deserializer, OffsetCursor,
    PartitionAssignment, PartitionTransport, Record, SystemClock, TransportError,
};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a [`BatchConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Built, transport not connected
    Created,
    /// Transport connected and assigned
    Started,
    /// Transport closed
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors from batch consumers.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Settings failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Operation not allowed in the current lifecycle state
    #[error("Consumer for {assignment} is {state}; {operation} requires a started consumer")]
    InvalidState {
        /// Partition the consumer is bound to
        assignment: PartitionAssignment,
        /// Actual state
        state: ConsumerState,
        /// Rejected operation
        operation: &'static str,
    },

    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A record could not be decoded
    #[error("Failed to deserialize record at offset {offset}: {source}")]
    Deserialize {
        /// Offset of the offending record
        offset: i64,
        /// Decoder error
        #[source]
        source: DeserializeError,
    },
}

/// Progress of one pass through the partition.
///
/// Created fresh for every pass; see [`BatchConsumer::next_batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchPass {
    threshold_minutes: Option<u32>,
    offset_limit: Option<i64>,
    resolved: bool,
    finished: bool,
    unconfirmed: Option<i64>,
}

impl BatchPass {
    /// Start a pass, optionally limited to records older than
    /// `threshold_minutes`.
    #[must_use]
    pub const fn new(threshold_minutes: Option<u32>) -> Self {
        Self {
            threshold_minutes,
            offset_limit: None,
            resolved: false,
            finished: false,
            unconfirmed: None,
        }
    }

    /// Whether the pass has ended.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// First excluded offset, once the threshold has been resolved.
    #[must_use]
    pub const fn offset_limit(&self) -> Option<i64> {
        self.offset_limit
    }

    /// Offset after the last yielded batch, until that batch is confirmed.
    #[must_use]
    pub const fn unconfirmed(&self) -> Option<i64> {
        self.unconfirmed
    }
}

/// Consumer of one partition, generic over transport, decoder and clock.
///
/// # Example
///
/// ```
/// use futures::TryStreamExt;
/// use lockstep_core::{ConsumerSettings, JsonDeserializer};
/// use lockstep_runtime::BatchConsumer;
/// use lockstep_testing::{ScriptedTransport, json_records};
///
/// # async fn example() -> Result<(), lockstep_runtime::ConsumerError> {
/// let transport = ScriptedTransport::new().then_poll(json_records(0, 0..3, |i| i));
/// let settings = ConsumerSettings::new("numbers", "summer").with_batch_size(10);
/// let mut consumer = BatchConsumer::new(settings, 0, transport, JsonDeserializer::<i64>::new())?;
///
/// consumer.start().await?;
/// let batches: Vec<_> = consumer.get_batches(None).try_collect().await?;
/// assert_eq!(batches[0].records(), &[0, 1, 2]);
/// consumer.commit().await?;
/// consumer.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct BatchConsumer<T, D, C = SystemClock> {
    settings: ConsumerSettings,
    assignment: PartitionAssignment,
    transport: T,
    deserializer: D,
    clock: C,
    state: ConsumerState,
    cursor: OffsetCursor,
}

impl<T, D> BatchConsumer<T, D>
where
    T: PartitionTransport,
    D: Deserializer,
{
    /// Create a consumer for `partition` of `settings.topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Config`] if `settings` are invalid.
    pub fn new(
        settings: ConsumerSettings,
        partition: i32,
        transport: T,
        deserializer: D,
    ) -> Result<Self, ConsumerError> {
        settings.validate()?;
        let assignment = PartitionAssignment::new(&settings.topic, partition, &settings.group_id);
        tracing::debug!(
            topic = %assignment.topic(),
            partition,
            group_id = %assignment.group_id(),
            batch_size = settings.batch_size,
            "Batch consumer created"
        );
        Ok(Self {
            settings,
            assignment,
            transport,
            deserializer,
            clock: SystemClock,
            state: ConsumerState::Created,
            cursor: OffsetCursor::new(),
        })
    }
}

impl<T, D, C> BatchConsumer<T, D, C>
where
    T: PartitionTransport,
    D: Deserializer,
    C: Clock,
{
    /// Replace the clock used to resolve age thresholds.
    #[must_use]
    pub fn with_clock<C2: Clock>(self, clock: C2) -> BatchConsumer<T, D, C2> {
        BatchConsumer {
            settings: self.settings,
            assignment: self.assignment,
            transport: self.transport,
            deserializer: self.deserializer,
            clock,
            state: self.state,
            cursor: self.cursor,
        }
    }

    /// Partition this consumer is bound to.
    #[must_use]
    pub const fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConsumerState {
        self.state
    }

    /// Offsets of confirmed batches not yet committed.
    #[must_use]
    pub const fn pending_offsets(&self) -> &OffsetCursor {
        &self.cursor
    }

    /// Lease key guarding this consumer's partition.
    #[must_use]
    pub fn lock_key(&self) -> String {
        self.assignment.lock_key()
    }

    fn ensure_started(&self, operation: &'static str) -> Result<(), ConsumerError> {
        if self.state == ConsumerState::Started {
            Ok(())
        } else {
            Err(ConsumerError::InvalidState {
                assignment: self.assignment.clone(),
                state: self.state,
                operation,
            })
        }
    }

    /// Connect the transport and assign the partition.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::InvalidState`] unless the consumer is newly
    /// created, or [`ConsumerError::Transport`] if the connection fails.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        if self.state != ConsumerState::Created {
            return Err(ConsumerError::InvalidState {
                assignment: self.assignment.clone(),
                state: self.state,
                operation: "start",
            });
        }

        self.transport.start(&self.assignment).await?;
        self.state = ConsumerState::Started;
        tracing::info!(
            topic = %self.assignment.topic(),
            partition = self.assignment.partition(),
            group_id = %self.assignment.group_id(),
            "Batch consumer started"
        );
        Ok(())
    }

    /// Produce the next batch of `pass`, or `None` once it has ended.
    ///
    /// Calling this again confirms the batch returned by the previous call:
    /// its offsets are then tracked for the next [`commit`]. The last batch of
    /// a pass is confirmed by the call that returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::InvalidState`] if not started, or the
    /// transport or decoder error. A decode failure does not advance the
    /// commit cursor.
    ///
    /// [`commit`]: Self::commit
    pub async fn next_batch(
        &mut self,
        pass: &mut BatchPass,
    ) -> Result<Option<Batch<D::Output>>, ConsumerError> {
        self.ensure_started("get_batches")?;
        self.confirm(pass);
        if pass.finished {
            return Ok(None);
        }

        if !pass.resolved {
            if let Some(minutes) = pass.threshold_minutes {
                let threshold = self.clock.now() - TimeDelta::minutes(i64::from(minutes));
                pass.offset_limit = self.transport.offset_for_time(threshold).await?;
                tracing::debug!(
                    topic = %self.assignment.topic(),
                    partition = self.assignment.partition(),
                    %threshold,
                    offset_limit = ?pass.offset_limit,
                    "Resolved time threshold"
                );
            }
            pass.resolved = true;
        }

        let polled = self
            .transport
            .poll(self.settings.batch_size, self.settings.poll_timeout)
            .await?;
        if polled.is_empty() {
            pass.finished = true;
            tracing::debug!(
                topic = %self.assignment.topic(),
                partition = self.assignment.partition(),
                "No records available"
            );
            return Ok(None);
        }

        let polled_count = polled.len();
        let tail_reached = self.settings.is_below_fill_ratio(polled_count);

        let kept: Vec<Record> = match pass.offset_limit {
            Some(limit) => polled.into_iter().filter(|record| record.offset < limit).collect(),
            None => polled,
        };
        let (Some(first), Some(last)) = (kept.first(), kept.last()) else {
            pass.finished = true;
            tracing::info!(
                topic = %self.assignment.topic(),
                partition = self.assignment.partition(),
                polled_count,
                "All polled records are newer than the time threshold"
            );
            return Ok(None);
        };
        let (first_offset, last_offset) = (first.offset, last.offset);

        let records = kept
            .iter()
            .map(|record| self.decode(record))
            .collect::<Result<Vec<_>, _>>()?;

        pass.unconfirmed = Some(last_offset + 1);
        if tail_reached {
            pass.finished = true;
        }

        ConsumerMetrics::record_batch(&self.assignment, records.len());
        tracing::info!(
            topic = %self.assignment.topic(),
            partition = self.assignment.partition(),
            records_count = records.len(),
            polled_count,
            first_offset,
            last_offset,
            last_batch = tail_reached,
            "Retrieved batch"
        );

        Ok(Some(Batch::new(
            self.assignment.partition(),
            first_offset,
            last_offset,
            records,
        )))
    }

    /// Mark the last batch of `pass` as processed, so the next [`commit`]
    /// covers it.
    ///
    /// Does nothing if that batch was already confirmed.
    ///
    /// [`commit`]: Self::commit
    pub fn confirm(&mut self, pass: &mut BatchPass) {
        if let Some(next_offset) = pass.unconfirmed.take() {
            self.cursor.track(&self.assignment, next_offset);
        }
    }

    fn decode(&self, record: &Record) -> Result<D::Output, ConsumerError> {
        let offset = record.offset;
        let payload = record.payload.as_deref().ok_or(ConsumerError::Deserialize {
            offset,
            source: DeserializeError::EmptyPayload { offset },
        })?;
        self.deserializer
            .deserialize(payload)
            .map_err(|source| ConsumerError::Deserialize { offset, source })
    }

    /// Lazily yield batches for one pass.
    ///
    /// The stream ends on an empty poll, when every polled record is past the
    /// threshold, or after a batch from an under-filled poll. A batch is
    /// confirmed when the next item is requested, so dropping the stream
    /// mid-batch leaves that batch uncommitted. It borrows the consumer; drop
    /// it before calling [`commit`](Self::commit).
    pub fn get_batches(
        &mut self,
        threshold_minutes: Option<u32>,
    ) -> impl Stream<Item = Result<Batch<D::Output>, ConsumerError>> + '_ {
        try_stream! {
            let mut pass = BatchPass::new(threshold_minutes);
            while let Some(batch) = self.next_batch(&mut pass).await? {
                yield batch;
            }
        }
    }

    /// Make the tracked offsets durable, then forget them.
    ///
    /// With nothing tracked this only logs.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::InvalidState`] if not started, or
    /// [`ConsumerError::Transport`] if the commit fails (offsets stay tracked).
    pub async fn commit(&mut self) -> Result<(), ConsumerError> {
        self.ensure_started("commit")?;

        if self.cursor.is_empty() {
            tracing::info!(
                topic = %self.assignment.topic(),
                partition = self.assignment.partition(),
                "No offsets to commit"
            );
            return Ok(());
        }

        self.transport.commit(&self.cursor).await?;
        ConsumerMetrics::record_commit(&self.assignment);
        tracing::info!(
            group_id = %self.assignment.group_id(),
            offsets = %self.cursor,
            "Committed offsets"
        );
        self.cursor.clear();
        Ok(())
    }

    /// Close the transport.
    ///
    /// Stopping a consumer that never started, or stopping twice, does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Transport`] if closing fails. The consumer is
    /// considered stopped either way.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        if self.state != ConsumerState::Started {
            tracing::debug!(
                topic = %self.assignment.topic(),
                partition = self.assignment.partition(),
                state = %self.state,
                "Stop ignored"
            );
            return Ok(());
        }

        self.state = ConsumerState::Stopped;
        self.transport.stop().await?;
        tracing::info!(
            topic = %self.assignment.topic(),
            partition = self.assignment.partition(),
            "Batch consumer stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lockstep_core::JsonDeserializer;

    #[derive(Default)]
    struct IdleTransport;

    impl PartitionTransport for IdleTransport {
        async fn start(&mut self, _: &PartitionAssignment) -> Result<(), TransportError> {
            Ok(())
        }

        async fn poll(
            &mut self,
            _: usize,
            _: std::time::Duration,
        ) -> Result<Vec<Record>, TransportError> {
            Ok(Vec::new())
        }

        async fn offset_for_time(
            &mut self,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Option<i64>, TransportError> {
            Ok(None)
        }

        async fn commit(&mut self, _: &OffsetCursor) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn consumer() -> BatchConsumer<IdleTransport, JsonDeserializer<u32>> {
        BatchConsumer::new(
            ConsumerSettings::new("events", "workers"),
            4,
            IdleTransport,
            JsonDeserializer::new(),
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_invalid_settings() {
        let settings = ConsumerSettings::new("", "workers").with_batch_size(0);
        let result = BatchConsumer::new(settings, 0, IdleTransport, JsonDeserializer::<u32>::new());
        assert!(matches!(result, Err(ConsumerError::Config(_))));
    }

    #[test]
    fn binds_one_partition() {
        let consumer = consumer();
        assert_eq!(consumer.assignment(), &PartitionAssignment::new("events", 4, "workers"));
        assert_eq!(consumer.lock_key(), "events_partition_4");
        assert_eq!(consumer.state(), ConsumerState::Created);
    }

    #[tokio::test]
    async fn next_batch_requires_start() {
        let mut consumer = consumer();
        let err = consumer.next_batch(&mut BatchPass::new(None)).await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::InvalidState { state: ConsumerState::Created, operation: "get_batches", .. }
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut consumer = consumer();
        consumer.start().await.unwrap();
        assert!(matches!(
            consumer.start().await,
            Err(ConsumerError::InvalidState { state: ConsumerState::Started, .. })
        ));
    }

    #[tokio::test]
    async fn stopped_consumer_rejects_commit() {
        let mut consumer = consumer();
        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(matches!(
            consumer.commit().await,
            Err(ConsumerError::InvalidState { state: ConsumerState::Stopped, .. })
        ));
        // A second stop is harmless
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn finished_pass_does_not_poll_again() {
        let mut consumer = consumer();
        consumer.start().await.unwrap();
        let mut pass = BatchPass::new(None);
        assert!(consumer.next_batch(&mut pass).await.unwrap().is_none());
        assert!(pass.is_finished());
        assert!(consumer.next_batch(&mut pass).await.unwrap().is_none());
    }
}
