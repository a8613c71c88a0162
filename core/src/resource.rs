//! Factories for per-scope async resources (database sessions, clients).

use std::future::Future;
use thiserror::Error;

/// Errors from creating or disposing a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Construction failed (e.g. the connection was refused)
    #[error("Resource creation failed: {0}")]
    CreateFailed(String),

    /// Disposal failed
    #[error("Resource disposal failed: {0}")]
    DisposeFailed(String),
}

/// Async constructor plus matching async disposer for one resource type.
///
/// Used by `ScopedRegistry` to build at most one resource per scope key and
/// to tear it down when the scope is cleared.
pub trait ResourceFactory: Send + Sync + 'static {
    /// The resource handed to callers (shared by everyone in a scope).
    type Resource: Send + Sync + 'static;

    /// Build a new resource. May perform network I/O.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::CreateFailed`] if construction fails.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, ResourceError>> + Send;

    /// Close `resource`.
    ///
    /// Other holders may still reference the resource afterwards; they will
    /// observe it as closed.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::DisposeFailed`] if closing fails.
    fn dispose(
        &self,
        resource: &Self::Resource,
    ) -> impl Future<Output = Result<(), ResourceError>> + Send;
}
