//! # Lockstep Redpanda
//!
//! Kafka-compatible adapters for Lockstep, built on `rdkafka`.
//!
//! - [`KafkaPartitionTransport`]: a [`PartitionTransport`] that reads exactly
//!   one partition and commits offsets for the consumer's group
//! - [`KafkaProducer`]: a fire-and-forget JSON producer keyed by each event's
//!   idempotency key
//!
//! Works against Kafka and Redpanda alike.
//!
//! # Example
//!
//! ```no_run
//! use lockstep_core::{ConsumerSettings, JsonDeserializer};
//! use lockstep_redpanda::{KafkaConsumerConfig, KafkaPartitionTransport};
//! use lockstep_runtime::{BatchConsumer, DistributedLock, LockOptions, LockedConsumerSession};
//! # use lockstep_core::LeaseBackend;
//!
//! # async fn example<B: LeaseBackend + Clone>(backend: B) -> Result<(), Box<dyn std::error::Error>> {
//! let config = KafkaConsumerConfig::from_env()?;
//! let consumer = BatchConsumer::new(
//!     ConsumerSettings::from_env()?,
//!     0,
//!     KafkaPartitionTransport::new(config),
//!     JsonDeserializer::<serde_json::Value>::new(),
//! )?;
//! let session = LockedConsumerSession::open(consumer, |key| {
//!     DistributedLock::new(backend.clone(), key, LockOptions::new())
//! })
//! .await?;
//! session.exit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`PartitionTransport`]: lockstep_core::PartitionTransport

pub mod config;
pub mod producer;
pub mod transport;

pub use config::{KafkaConsumerConfig, KafkaProducerConfig, OffsetReset};
pub use producer::{KafkaProducer, Producible, PublishError};
pub use transport::KafkaPartitionTransport;
