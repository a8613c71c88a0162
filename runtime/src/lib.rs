//! # Lockstep Runtime
//!
//! Runtime pieces for consuming a partitioned log with exclusive ownership of
//! each partition, built on the traits in `lockstep-core`.
//!
//! ## Core Components
//!
//! - **[`BatchConsumer`]**: pulls bounded, decoded batches from one partition
//!   and commits offsets only when told to
//! - **[`DistributedLock`]**: named lease with acquire, extend and release,
//!   blocking or non-blocking
//! - **[`LockedConsumerSession`]**: lock plus consumer as one unit of work,
//!   checkpointing after every batch
//! - **[`ScopedRegistry`]**: one lazily-built resource per unit of work, torn
//!   down when the scope is cleared
//! - **[`PartitionSweep`]**: one drain pass over many partitions, skipping
//!   those owned elsewhere
//!
//! ## Example
//!
//! ```
//! use futures::TryStreamExt;
//! use lockstep_core::{ConsumerSettings, JsonDeserializer};
//! use lockstep_runtime::{BatchConsumer, DistributedLock, LockOptions, LockedConsumerSession};
//! use lockstep_testing::{InMemoryLeaseBackend, ScriptedTransport, json_records};
//!
//! # async fn example() -> Result<(), lockstep_runtime::SessionError> {
//! let transport = ScriptedTransport::new().then_poll(json_records(0, 0..5, |i| i));
//! let consumer = BatchConsumer::new(
//!     ConsumerSettings::new("orders", "billing").with_batch_size(100),
//!     0,
//!     transport,
//!     JsonDeserializer::<i64>::new(),
//! )?;
//! let backend = InMemoryLeaseBackend::new();
//!
//! let mut session = LockedConsumerSession::open(consumer, |key| {
//!     DistributedLock::new(backend.clone(), key, LockOptions::new())
//! })
//! .await?;
//!
//! {
//!     let mut batches = std::pin::pin!(session.get_batches(None));
//!     while let Some(batch) = batches.try_next().await? {
//!         println!("{} records", batch.len());
//!     }
//! }
//! session.exit().await?;
//! # Ok(())
//! # }
//! ```

/// Batched single-partition consumer
pub mod consumer;

/// Distributed lease handle
pub mod lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Scoped resource registry
pub mod registry;

/// Bounded waiting with exponential backoff
pub mod retry;

/// Scope keys and scope closing
pub mod scope;

/// Lock-protected consumer sessions
pub mod session;

/// Multi-partition drain passes
pub mod sweep;

pub use consumer::{BatchConsumer, BatchPass, ConsumerError, ConsumerState};
pub use lock::{DEFAULT_LOCK_TIMEOUT, DistributedLock, LockOptions};
pub use registry::{RegistryError, ScopedRegistry};
pub use retry::RetryPolicy;
pub use scope::{ScopeCloser, ScopeKey, ScopedResources, run_in_scope, with_scope};
pub use session::{LockedConsumerSession, SessionError};
pub use sweep::{PartitionSweep, SweepError, SweepOutcome};
