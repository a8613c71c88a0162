//! Fire-and-forget JSON event producer.

use crate::config::KafkaProducerConfig;
use lockstep_core::ConfigError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// How long to back off when the client's local queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(50);

/// Errors raised while handing events to the producer.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Producer configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client could not be created
    #[error("Failed to create producer: {0}")]
    ConnectionFailed(String),

    /// The event could not be encoded
    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The event could not be queued for delivery
    #[error("Failed to publish to topic '{topic}': {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Client error
        reason: String,
    },
}

/// An event that can be sent to a topic.
///
/// The idempotency key becomes the message key, so every event sharing a key
/// lands on the same partition in order.
pub trait Producible: Serialize {
    /// Message key, if the event has a natural identity.
    fn idempotency_key(&self) -> Option<String> {
        None
    }
}

/// Sends JSON-encoded events without waiting for broker acknowledgement.
///
/// [`send`](Self::send) returns once the event is queued in the client;
/// delivery happens in the background and failures are logged. Call
/// [`flush`](Self::flush) before shutdown to drain the queue.
///
/// # Example
///
/// ```no_run
/// use lockstep_redpanda::{KafkaProducer, KafkaProducerConfig, Producible};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct PageView {
///     id: String,
///     path: String,
/// }
///
/// impl Producible for PageView {
///     fn idempotency_key(&self) -> Option<String> {
///         Some(self.id.clone())
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let producer = KafkaProducer::new(KafkaProducerConfig::new(["localhost:9092"]))?;
/// producer
///     .send("page-views", &PageView { id: "v-1".into(), path: "/".into() })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaProducer {
    producer: FutureProducer,
    config: KafkaProducerConfig,
}

impl KafkaProducer {
    /// Validate `config` and create the client.
    ///
    /// Brokers are contacted lazily, so this succeeds even if none is reachable yet.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Config`] for invalid settings or
    /// [`PublishError::ConnectionFailed`] if librdkafka rejects them.
    pub fn new(config: KafkaProducerConfig) -> Result<Self, PublishError> {
        config.validate()?;
        let producer: FutureProducer = config
            .client_config()
            .create()
            .map_err(|e| PublishError::ConnectionFailed(e.to_string()))?;

        tracing::info!(
            brokers = %config.bootstrap_servers.join(","),
            acks = config.acks,
            linger_ms = config.linger.as_millis(),
            "Kafka producer created"
        );

        Ok(Self { producer, config })
    }

    /// Create a producer from `KAFKA_*` environment variables.
    ///
    /// # Errors
    ///
    /// See [`KafkaProducerConfig::from_env`] and [`KafkaProducer::new`].
    pub fn from_env() -> Result<Self, PublishError> {
        Self::new(KafkaProducerConfig::from_env()?)
    }

    /// Producer configuration.
    #[must_use]
    pub const fn config(&self) -> &KafkaProducerConfig {
        &self.config
    }

    /// Queue one event for `topic`.
    ///
    /// Waits only while the local queue is full, up to the configured request
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialization`] if the event cannot be encoded,
    /// or [`PublishError::PublishFailed`] if it cannot be queued.
    pub async fn send<E: Producible>(&self, topic: &str, event: &E) -> Result<(), PublishError> {
        let (key, payload) = encode(event)?;
        let give_up_at = Instant::now() + self.config.request_timeout;

        loop {
            let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic).payload(payload.as_slice());
            if let Some(key) = key.as_deref() {
                record = record.key(key);
            }

            let error = match self.producer.send_result(record) {
                Ok(delivery) => {
                    let topic = topic.to_string();
                    tokio::spawn(async move {
                        match delivery.await {
                            Ok(Ok((partition, offset))) => tracing::trace!(
                                topic = %topic,
                                partition = partition,
                                offset = offset,
                                "Event delivered"
                            ),
                            Ok(Err((error, _))) => tracing::warn!(
                                topic = %topic,
                                error = %error,
                                "Event delivery failed"
                            ),
                            Err(_canceled) => {}
                        }
                    });
                    return Ok(());
                }
                Err((error, _record)) => error,
            };

            let queue_full = matches!(
                error,
                KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)
            );
            if queue_full && Instant::now() < give_up_at {
                tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                continue;
            }

            tracing::error!(topic = %topic, error = %error, "Failed to queue event");
            return Err(PublishError::PublishFailed {
                topic: topic.to_string(),
                reason: error.to_string(),
            });
        }
    }

    /// Queue every event in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`send`](Self::send).
    pub async fn send_all<'a, E, I>(&self, topic: &str, events: I) -> Result<usize, PublishError>
    where
        E: Producible + 'a,
        I: IntoIterator<Item = &'a E>,
    {
        let mut sent = 0;
        for event in events {
            self.send(topic, event).await?;
            sent += 1;
        }
        tracing::debug!(topic = %topic, events_count = sent, "Events queued");
        Ok(sent)
    }

    /// Wait until every queued event has been delivered or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::PublishFailed`] if the queue did not drain in time.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::PublishFailed {
                topic: "*".to_string(),
                reason: e.to_string(),
            })?
            .map_err(|e| PublishError::PublishFailed {
                topic: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

/// Message key and JSON payload for `event`.
fn encode<E: Producible>(event: &E) -> Result<(Option<String>, Vec<u8>), PublishError> {
    Ok((event.idempotency_key(), serde_json::to_vec(event)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Keyed {
        id: u32,
    }

    impl Producible for Keyed {
        fn idempotency_key(&self) -> Option<String> {
            Some(format!("keyed-{}", self.id))
        }
    }

    #[derive(Serialize)]
    struct Unkeyed(&'static str);

    impl Producible for Unkeyed {}

    #[test]
    fn producer_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaProducer>();
        assert_sync::<KafkaProducer>();
    }

    #[test]
    fn idempotency_key_becomes_message_key() {
        let (key, payload) = encode(&Keyed { id: 7 }).unwrap();
        assert_eq!(key.as_deref(), Some("keyed-7"));
        assert_eq!(payload, br#"{"id":7}"#);
    }

    #[test]
    fn events_without_identity_are_unkeyed() {
        let (key, payload) = encode(&Unkeyed("hello")).unwrap();
        assert_eq!(key, None);
        assert_eq!(payload, br#""hello""#);
    }

    #[test]
    fn invalid_config_is_rejected_before_connecting() {
        let result = KafkaProducer::new(KafkaProducerConfig::new(Vec::<String>::new()));
        assert!(matches!(result, Err(PublishError::Config(_))));
    }

    #[tokio::test]
    async fn send_queues_without_a_reachable_broker() {
        let producer = KafkaProducer::new(
            KafkaProducerConfig::new(["127.0.0.1:1"]).with_request_timeout(Duration::from_millis(200)),
        )
        .unwrap();

        let sent = producer
            .send_all("events", &[Keyed { id: 1 }, Keyed { id: 2 }])
            .await
            .unwrap();
        assert_eq!(sent, 2);
    }
}
