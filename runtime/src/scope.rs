//! Scope keys: identity of the current logical unit of work.
//!
//! A scope is entered with [`with_scope`] (or [`run_in_scope`], which also
//! closes it). Code running inside reads the key with [`current`]; scoped
//! registries use it to hand every task its own resource instance.
//!
//! The key is stored in a tokio task-local, so it is visible to everything
//! awaited inside the scope but not to tasks spawned from it.

use crate::registry::RegistryError;
use lockstep_core::CleanupErrors;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static CURRENT_SCOPE: ScopeKey;
}

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// Allocate a key that is unique within this process.
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Key of the scope the current task is running in, if any.
#[must_use]
pub fn current() -> Option<ScopeKey> {
    CURRENT_SCOPE.try_with(|key| *key).ok()
}

/// Run `future` with `key` as the current scope.
///
/// Nothing is cleared afterwards; see [`run_in_scope`] for that.
pub async fn with_scope<F: Future>(key: ScopeKey, future: F) -> F::Output {
    CURRENT_SCOPE.scope(key, future).await
}

/// Anything holding per-scope resources that can be torn down by key.
///
/// Object safe, so a [`ScopeCloser`] can hold registries of different
/// resource types.
pub trait ScopedResources: Send + Sync {
    /// Name used in logs and cleanup error reports.
    fn name(&self) -> &str;

    /// Dispose the resources of one scope.
    fn clear_scope(
        &self,
        key: ScopeKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>>;

    /// Dispose the resources of every scope.
    fn clear_all_scopes(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>>;
}

/// Closes a scope in several registries at once.
///
/// Built once at process assembly and shared by whatever marks unit-of-work
/// boundaries (task wrappers, request middleware).
///
/// # Example
///
/// ```
/// use lockstep_runtime::{ScopeCloser, ScopeKey, ScopedRegistry, run_in_scope};
/// use lockstep_testing::CountingFactory;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), lockstep_runtime::RegistryError> {
/// let factory = CountingFactory::new();
/// let clients = Arc::new(ScopedRegistry::new("clients", factory.clone()));
/// let closer = ScopeCloser::new().with(clients.clone());
///
/// let id = run_in_scope(ScopeKey::new(), &closer, async {
///     let client = clients.get_current().await?;
///     Ok::<_, lockstep_runtime::RegistryError>(client.id())
/// })
/// .await?;
///
/// assert_eq!(id, 1);
/// assert_eq!(factory.disposed(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ScopeCloser {
    registries: Vec<Arc<dyn ScopedResources>>,
}

impl ScopeCloser {
    /// Closer with no registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registry.
    #[must_use]
    pub fn with(mut self, registry: Arc<dyn ScopedResources>) -> Self {
        self.registries.push(registry);
        self
    }

    /// Add a registry in place.
    pub fn register(&mut self, registry: Arc<dyn ScopedResources>) {
        self.registries.push(registry);
    }

    /// Number of registries closed together.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registries.len()
    }

    /// Whether no registry is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }

    /// Clear `key` in every registry.
    ///
    /// Every registry is cleared even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Dispose`] with every failure collected.
    pub async fn close(&self, key: ScopeKey) -> Result<(), RegistryError> {
        let mut errors = CleanupErrors::new();
        for registry in &self.registries {
            collect(&mut errors, registry.name(), registry.clear_scope(key).await);
        }
        tracing::debug!(scope = %key, registries = self.registries.len(), "Scope closed");
        errors.into_result().map_err(RegistryError::Dispose)
    }

    /// Clear every scope in every registry (process shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Dispose`] with every failure collected.
    pub async fn close_all(&self) -> Result<(), RegistryError> {
        let mut errors = CleanupErrors::new();
        for registry in &self.registries {
            collect(&mut errors, registry.name(), registry.clear_all_scopes().await);
        }
        errors.into_result().map_err(RegistryError::Dispose)
    }
}

fn collect(errors: &mut CleanupErrors, registry: &str, result: Result<(), RegistryError>) {
    match result {
        Ok(()) => {}
        Err(RegistryError::Dispose(failures)) => errors.extend(failures),
        Err(other) => errors.push(registry, &other),
    }
}

/// Run `future` as the unit of work `key`, then close the scope.
///
/// The scope is closed on success and on failure. If both the future and the
/// close fail, the close failure is logged and the future's error returned.
///
/// # Errors
///
/// Returns the future's error, or the close error converted into `E`.
pub async fn run_in_scope<F, T, E>(key: ScopeKey, closer: &ScopeCloser, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<RegistryError>,
{
    let outcome = with_scope(key, future).await;
    let closed = closer.close(key).await;

    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_error)) => Err(close_error.into()),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(close_error)) => {
            tracing::error!(scope = %key, error = %close_error, "Failed to close scope after unit of work failed");
            Err(error)
        }
    }
}
