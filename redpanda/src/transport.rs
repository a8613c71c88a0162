//! [`PartitionTransport`] over an rdkafka [`StreamConsumer`].
//!
//! The consumer is assigned a single partition directly instead of joining
//! the group's rebalance protocol: ownership is decided by the distributed
//! lock, not by the broker. The group id is still set so that committed
//! offsets are stored against it.

use crate::config::KafkaConsumerConfig;
use chrono::{DateTime, Utc};
use lockstep_core::{OffsetCursor, PartitionAssignment, PartitionTransport, Record, TransportError};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

/// Kafka/Redpanda client bound to one partition.
///
/// # Example
///
/// ```no_run
/// use lockstep_core::{ConsumerSettings, JsonDeserializer};
/// use lockstep_redpanda::{KafkaConsumerConfig, KafkaPartitionTransport};
/// use lockstep_runtime::BatchConsumer;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = KafkaPartitionTransport::new(KafkaConsumerConfig::new(["localhost:9092"]));
/// let consumer = BatchConsumer::new(
///     ConsumerSettings::new("orders", "billing"),
///     0,
///     transport,
///     JsonDeserializer::<serde_json::Value>::new(),
/// )?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaPartitionTransport {
    config: KafkaConsumerConfig,
    consumer: Option<Arc<StreamConsumer>>,
    assignment: Option<PartitionAssignment>,
}

impl KafkaPartitionTransport {
    /// Create an unconnected transport.
    #[must_use]
    pub const fn new(config: KafkaConsumerConfig) -> Self {
        Self {
            config,
            consumer: None,
            assignment: None,
        }
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &KafkaConsumerConfig {
        &self.config
    }

    /// Whether [`start`](PartitionTransport::start) has connected the client.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.consumer.is_some()
    }

    fn connected(&self) -> Result<(Arc<StreamConsumer>, &PartitionAssignment), TransportError> {
        match (&self.consumer, &self.assignment) {
            (Some(consumer), Some(assignment)) => Ok((Arc::clone(consumer), assignment)),
            _ => Err(TransportError::NotStarted),
        }
    }
}

impl PartitionTransport for KafkaPartitionTransport {
    async fn start(&mut self, assignment: &PartitionAssignment) -> Result<(), TransportError> {
        if self.consumer.is_some() {
            return Err(TransportError::ConnectionFailed(format!(
                "transport already started for {assignment}"
            )));
        }

        let consumer: StreamConsumer = self
            .config
            .client_config(assignment.group_id())
            .create()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        // Resume from the group's committed offset, falling back to auto.offset.reset
        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(assignment.topic(), assignment.partition(), Offset::Stored)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        consumer.assign(&partitions).map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to assign {assignment}: {e}"))
        })?;

        tracing::debug!(
            topic = assignment.topic(),
            partition = assignment.partition(),
            group_id = assignment.group_id(),
            brokers = %self.config.bootstrap_servers.join(","),
            "Kafka consumer assigned"
        );

        self.consumer = Some(Arc::new(consumer));
        self.assignment = Some(assignment.clone());
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, TransportError> {
        let (consumer, _) = self.connected()?;
        let deadline = Instant::now() + timeout;
        let mut records = Vec::with_capacity(max_records.min(1_024));

        while records.len() < max_records {
            // Wait the full timeout for the first record, then only briefly for each next one
            let wait_until = if records.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + self.config.poll_linger)
            };
            match timeout_at(wait_until, consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(message)) => records.push(to_record(&message)),
                Ok(Err(e)) => return Err(TransportError::PollFailed(e.to_string())),
            }
        }

        Ok(records)
    }

    async fn offset_for_time(
        &mut self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<i64>, TransportError> {
        let (consumer, assignment) = self.connected()?;
        let topic = assignment.topic().to_string();
        let partition = assignment.partition();
        let request_timeout = self.config.request_timeout;

        let mut query = TopicPartitionList::new();
        query
            .add_partition_offset(&topic, partition, Offset::Offset(timestamp.timestamp_millis()))
            .map_err(|e| TransportError::OffsetLookupFailed(e.to_string()))?;

        // librdkafka blocks the calling thread for this request
        let found = tokio::task::spawn_blocking(move || {
            consumer.offsets_for_times(query, request_timeout)
        })
        .await
        .map_err(|e| TransportError::OffsetLookupFailed(e.to_string()))?
        .map_err(|e| TransportError::OffsetLookupFailed(e.to_string()))?;

        let offset = found
            .find_partition(&topic, partition)
            .and_then(|element| match element.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            });

        tracing::debug!(
            topic = %topic,
            partition = partition,
            timestamp = %timestamp,
            offset = ?offset,
            "Resolved offset for timestamp"
        );
        Ok(offset)
    }

    async fn commit(&mut self, offsets: &OffsetCursor) -> Result<(), TransportError> {
        let (consumer, _) = self.connected()?;

        let mut list = TopicPartitionList::new();
        for (assignment, offset) in offsets.iter() {
            list.add_partition_offset(assignment.topic(), assignment.partition(), Offset::Offset(offset))
                .map_err(|e| TransportError::CommitFailed(e.to_string()))?;
        }

        tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
            .await
            .map_err(|e| TransportError::CommitFailed(e.to_string()))?
            .map_err(|e| TransportError::CommitFailed(e.to_string()))
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };
        self.assignment = None;

        consumer
            .unassign()
            .map_err(|e| TransportError::Other(format!("Failed to unassign: {e}")))
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<KafkaPartitionTransport>();
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let mut transport =
            KafkaPartitionTransport::new(KafkaConsumerConfig::new(["localhost:9092"]));

        assert!(!transport.is_started());
        assert_eq!(
            transport.poll(10, Duration::from_millis(1)).await,
            Err(TransportError::NotStarted)
        );
        assert_eq!(transport.offset_for_time(Utc::now()).await, Err(TransportError::NotStarted));
        assert_eq!(
            transport.commit(&OffsetCursor::new()).await,
            Err(TransportError::NotStarted)
        );
        assert_eq!(transport.stop().await, Ok(()));
    }
}
