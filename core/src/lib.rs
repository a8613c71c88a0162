//! # Lockstep Core
//!
//! Core traits and types for consuming a partitioned log with exclusive,
//! lease-protected ownership of each partition.
//!
//! This crate only describes the seams. Concrete behaviour lives in:
//!
//! - `lockstep-runtime`: the batch consumer, distributed lock, locked session
//!   and scoped registry built on top of these traits
//! - `lockstep-redpanda`: a Kafka-compatible [`PartitionTransport`]
//! - `lockstep-redis`: a Redis [`LeaseBackend`]
//! - `lockstep-postgres`: a Postgres [`ResourceFactory`]
//! - `lockstep-testing`: in-memory doubles for all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │          LockedConsumerSession           │
//! │  acquire → start → batches → stop → release
//! └──────┬────────────────────────┬──────────┘
//!        │                        │
//!        ▼                        ▼
//! ┌──────────────┐        ┌───────────────┐
//! │ BatchConsumer│        │DistributedLock│
//! └──────┬───────┘        └───────┬───────┘
//!        │                        │
//!        ▼                        ▼
//! ┌──────────────────┐    ┌──────────────┐
//! │PartitionTransport│    │ LeaseBackend │
//! │  + Deserializer  │    └──────────────┘
//! └──────────────────┘
//! ```
//!
//! [`PartitionTransport`]: transport::PartitionTransport
//! [`LeaseBackend`]: lease::LeaseBackend
//! [`ResourceFactory`]: resource::ResourceFactory

pub mod cleanup;
pub mod deserializer;
pub mod environment;
pub mod lease;
pub mod partition;
pub mod record;
pub mod resource;
pub mod settings;
pub mod transport;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use cleanup::{CleanupErrors, CleanupFailure};
pub use deserializer::{BincodeDeserializer, DeserializeError, Deserializer, JsonDeserializer};
pub use environment::{Clock, SystemClock};
pub use lease::{LeaseBackend, LockError, Lockable};
pub use partition::{OffsetCursor, PartitionAssignment};
pub use record::{Batch, Record};
pub use resource::{ResourceError, ResourceFactory};
pub use settings::{ConfigError, ConsumerSettings};
pub use transport::{PartitionTransport, TransportError};
