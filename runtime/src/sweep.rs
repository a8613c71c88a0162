//! One drain pass over a set of partitions.
//!
//! A worker that owns no fixed partition runs a [`PartitionSweep`] on a
//! schedule: for each partition it tries to open a locked session and drain
//! it through the handler. Partitions owned by another worker are reported
//! as [`SweepOutcome::Contended`] and simply skipped until the next run.

use crate::consumer::BatchConsumer;
use crate::session::{LockedConsumerSession, SessionError};
use futures::TryStreamExt;
use lockstep_core::{
    Batch, ConfigError, ConsumerSettings, Deserializer, Lockable, PartitionTransport, SystemClock,
};
use std::pin::pin;
use thiserror::Error;

/// Why one partition could not be drained.
#[derive(Error, Debug)]
pub enum SweepError<E>
where
    E: std::error::Error + 'static,
{
    /// Session setup, consumption or cleanup failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The batch handler failed
    #[error("Batch handler failed: {0}")]
    Handler(#[source] E),
}

/// Result of sweeping one partition.
#[derive(Debug)]
pub enum SweepOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// Everything available was handled and committed
    Drained {
        /// Batches handled
        batches: usize,
        /// Records handled
        records: usize,
    },
    /// Another owner holds the partition; try again later
    Contended,
    /// The pass stopped early
    Failed(SweepError<E>),
}

impl<E> SweepOutcome<E>
where
    E: std::error::Error + 'static,
{
    /// Whether the partition was fully drained.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        matches!(self, Self::Drained { .. })
    }
}

/// Drains a fixed list of partitions, one locked session at a time.
///
/// Transports and locks are built per partition by the supplied closures, so
/// each session owns fresh instances.
pub struct PartitionSweep<D, MT, ML> {
    settings: ConsumerSettings,
    partitions: Vec<i32>,
    threshold_minutes: Option<u32>,
    deserializer: D,
    make_transport: MT,
    make_lock: ML,
}

impl<D, MT, ML, T, L> PartitionSweep<D, MT, ML>
where
    D: Deserializer + Clone,
    MT: Fn(i32) -> T,
    ML: Fn(String) -> L,
    T: PartitionTransport,
    L: Lockable,
{
    /// Create a sweep over `partitions`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `settings` are invalid.
    pub fn new(
        settings: ConsumerSettings,
        partitions: impl IntoIterator<Item = i32>,
        deserializer: D,
        make_transport: MT,
        make_lock: ML,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            settings,
            partitions: partitions.into_iter().collect(),
            threshold_minutes: None,
            deserializer,
            make_transport,
            make_lock,
        })
    }

    /// Only handle records older than `minutes`.
    #[must_use]
    pub const fn with_threshold_minutes(mut self, minutes: u32) -> Self {
        self.threshold_minutes = Some(minutes);
        self
    }

    /// Partitions visited, in order.
    #[must_use]
    pub fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    /// Visit every partition once, feeding its batches to `handler`.
    ///
    /// Each batch is checkpointed once the handler accepts it, before the
    /// next one is polled. A batch the handler rejects is left uncommitted
    /// and redelivered on a later run. A failing partition does not stop the
    /// sweep.
    pub async fn run<E>(
        &self,
        mut handler: impl AsyncFnMut(Batch<D::Output>) -> Result<(), E>,
    ) -> Vec<(i32, SweepOutcome<E>)>
    where
        E: std::error::Error + 'static,
    {
        let mut outcomes = Vec::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            let outcome = self.sweep_partition(partition, &mut handler).await;
            match &outcome {
                SweepOutcome::Drained { batches, records } => {
                    tracing::info!(partition, batches, records, "Partition drained");
                }
                SweepOutcome::Contended => {
                    tracing::info!(partition, "Partition owned elsewhere, skipped");
                }
                SweepOutcome::Failed(error) => {
                    tracing::error!(partition, error = %error, "Partition sweep failed");
                }
            }
            outcomes.push((partition, outcome));
        }
        outcomes
    }

    async fn sweep_partition<E>(
        &self,
        partition: i32,
        handler: &mut impl AsyncFnMut(Batch<D::Output>) -> Result<(), E>,
    ) -> SweepOutcome<E>
    where
        E: std::error::Error + 'static,
    {
        let consumer = match BatchConsumer::new(
            self.settings.clone(),
            partition,
            (self.make_transport)(partition),
            self.deserializer.clone(),
        ) {
            Ok(consumer) => consumer,
            Err(error) => return SweepOutcome::Failed(SweepError::Session(error.into())),
        };
        let lock = (self.make_lock)(consumer.lock_key());
        let threshold_minutes = self.threshold_minutes;

        let drained = LockedConsumerSession::scoped(
            consumer,
            lock,
            async |session: &mut LockedConsumerSession<T, D, SystemClock, L>| {
                let (mut batches, mut records) = (0, 0);
                let mut stream = pin!(session.get_batches(threshold_minutes));
                while let Some(batch) = stream.try_next().await? {
                    batches += 1;
                    records += batch.len();
                    handler(batch).await.map_err(SweepError::Handler)?;
                }
                Ok::<_, SweepError<E>>((batches, records))
            },
        )
        .await;

        match drained {
            Ok((batches, records)) => SweepOutcome::Drained { batches, records },
            Err(SweepError::Session(error)) if error.is_contention() => SweepOutcome::Contended,
            Err(error) => SweepOutcome::Failed(error),
        }
    }
}
