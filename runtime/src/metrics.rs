//! Prometheus metrics for consumers, locks, registries and sessions.
//!
//! Recording goes through the `metrics` facade, so it is free when no
//! recorder is installed. Call [`MetricsServer::start`] once per process to
//! install the Prometheus exporter.
//!
//! # Example
//!
//! ```rust,no_run
//! use lockstep_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Scrape output
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use lockstep_core::PartitionAssignment;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Holds the exporter handle used to render the scrape body.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the scrape endpoint is meant to be served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "lockstep_consumer_batches_total",
        "Batches yielded by batch consumers"
    );
    describe_counter!(
        "lockstep_consumer_records_total",
        "Records yielded by batch consumers"
    );
    describe_counter!(
        "lockstep_consumer_commits_total",
        "Offset commits performed by batch consumers"
    );
    describe_counter!(
        "lockstep_lock_acquired_total",
        "Leases acquired"
    );
    describe_counter!(
        "lockstep_lock_contended_total",
        "Lease acquisitions refused because another owner held the lease"
    );
    describe_counter!(
        "lockstep_registry_instances_created_total",
        "Scoped resources constructed"
    );
    describe_histogram!(
        "lockstep_session_checkpoint_duration_seconds",
        "Time taken to extend the lease and commit offsets after a batch"
    );
}

/// Batch consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a yielded batch.
    pub fn record_batch(assignment: &PartitionAssignment, records: usize) {
        let topic = assignment.topic().to_string();
        counter!("lockstep_consumer_batches_total", "topic" => topic.clone()).increment(1);
        counter!("lockstep_consumer_records_total", "topic" => topic).increment(records as u64);
    }

    /// Record a successful commit.
    pub fn record_commit(assignment: &PartitionAssignment) {
        counter!("lockstep_consumer_commits_total", "topic" => assignment.topic().to_string())
            .increment(1);
    }
}

/// Distributed lock metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record an acquired lease.
    pub fn record_acquired() {
        counter!("lockstep_lock_acquired_total").increment(1);
    }

    /// Record a refused acquisition.
    pub fn record_contended() {
        counter!("lockstep_lock_contended_total").increment(1);
    }
}

/// Scoped registry metrics recorder.
pub struct RegistryMetrics;

impl RegistryMetrics {
    /// Record a constructed resource.
    pub fn record_created(registry: &str) {
        counter!("lockstep_registry_instances_created_total", "registry" => registry.to_string())
            .increment(1);
    }
}

/// Locked session metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a checkpoint.
    pub fn record_checkpoint(duration: Duration) {
        histogram!("lockstep_session_checkpoint_duration_seconds").record(duration.as_secs_f64());
    }
}
