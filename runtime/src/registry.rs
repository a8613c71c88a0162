//! One lazily-built resource per scope key.
//!
//! [`ScopedRegistry`] hands every unit of work its own instance of a resource
//! (a database session, an analytics client) and tears the instances down
//! when the unit of work is cleared.
//!
//! # Single flight
//!
//! Each key maps to a shared `OnceCell`. Concurrent `get`s for the same key
//! wait on the same cell, so the factory runs once per key. A failed
//! construction leaves the cell empty; the next `get` tries again.
//!
//! # Clearing
//!
//! Entries are removed from the map before they are disposed, so a `get`
//! issued after `clear` starts always builds a fresh instance. A `get` that
//! is still constructing while its key is cleared disposes what it built and
//! fails with [`RegistryError::Cleared`]; every instance is disposed exactly
//! once, by whichever side sees it last.

use crate::metrics::RegistryMetrics;
use crate::scope::{self, ScopeKey, ScopedResources};
use lockstep_core::{CleanupErrors, ResourceError, ResourceFactory};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::OnceCell;

/// Errors from scoped registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `get_current` was called outside of any scope
    #[error("No scope is active for the current task")]
    NoScope,

    /// The factory failed; nothing was registered
    #[error("Failed to create scoped resource: {0}")]
    Create(#[from] ResourceError),

    /// One or more instances failed to dispose; all were removed
    #[error("Failed to dispose scoped resources: {0}")]
    Dispose(CleanupErrors),

    /// The scope was cleared while its instance was being built; that
    /// instance has been disposed
    #[error("Scope was cleared while its resource was being created")]
    Cleared,
}

struct Entry<R> {
    cell: OnceCell<Arc<R>>,
    disposed: AtomicBool,
}

impl<R> Default for Entry<R> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
            disposed: AtomicBool::new(false),
        }
    }
}

impl<R> Entry<R> {
    /// True for exactly one caller: the one that must dispose the instance.
    fn claim_disposal(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }
}

type Slot<R> = Arc<Entry<R>>;

/// Registry of per-scope resource instances.
///
/// # Example
///
/// ```
/// use lockstep_runtime::{ScopeKey, ScopedRegistry};
/// use lockstep_testing::CountingFactory;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), lockstep_runtime::RegistryError> {
/// let registry = ScopedRegistry::new("db", CountingFactory::new());
/// let key = ScopeKey::new();
///
/// let first = registry.get(key).await?;
/// let second = registry.get(key).await?;
/// assert!(Arc::ptr_eq(&first, &second));
///
/// registry.clear(&[key]).await?;
/// assert!(first.is_closed());
/// # Ok(())
/// # }
/// ```
pub struct ScopedRegistry<F: ResourceFactory> {
    name: String,
    factory: F,
    instances: Mutex<HashMap<ScopeKey, Slot<F::Resource>>>,
}

impl<F: ResourceFactory> ScopedRegistry<F> {
    /// Create an empty registry building instances with `factory`.
    pub fn new(name: impl Into<String>, factory: F) -> Self {
        Self {
            name: name.into(),
            factory,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry name (for logs).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The factory instances are built with.
    #[must_use]
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<ScopeKey, Slot<F::Resource>>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Instance for `key`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Create`] if the factory fails. No entry is
    /// left behind, so the next call builds afresh. Returns
    /// [`RegistryError::Cleared`] if `key` was cleared while the instance was
    /// being built.
    pub async fn get(&self, key: ScopeKey) -> Result<Arc<F::Resource>, RegistryError> {
        let slot = Arc::clone(self.instances().entry(key).or_default());

        let built = slot
            .cell
            .get_or_try_init(|| async {
                let resource = self.factory.create().await?;
                tracing::debug!(registry = %self.name, scope = %key, "Scoped resource created");
                RegistryMetrics::record_created(&self.name);
                Ok::<_, ResourceError>(Arc::new(resource))
            })
            .await;

        match built {
            Ok(resource) if self.is_mapped(key, &slot) => Ok(Arc::clone(resource)),
            Ok(resource) => {
                tracing::warn!(registry = %self.name, scope = %key, "Scope cleared while its resource was being created");
                if slot.claim_disposal() {
                    if let Err(error) = self.factory.dispose(resource).await {
                        tracing::warn!(registry = %self.name, scope = %key, error = %error, "Scoped resource disposal failed");
                    }
                }
                Err(RegistryError::Cleared)
            }
            Err(error) => {
                tracing::warn!(registry = %self.name, scope = %key, error = %error, "Scoped resource creation failed");
                self.forget_empty(key, &slot);
                Err(RegistryError::Create(error))
            }
        }
    }

    fn is_mapped(&self, key: ScopeKey, slot: &Slot<F::Resource>) -> bool {
        self.instances()
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Drop the map entry for `key` if it is still `slot`, still empty, and
    /// nobody else is waiting on it.
    fn forget_empty(&self, key: ScopeKey, slot: &Slot<F::Resource>) {
        let mut instances = self.instances();
        let unused = instances.get(&key).is_some_and(|current| {
            Arc::ptr_eq(current, slot)
                && !current.cell.initialized()
                && Arc::strong_count(current) == 2
        });
        if unused {
            instances.remove(&key);
        }
    }

    /// Instance for the scope the current task runs in.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoScope`] outside of a scope, or
    /// [`RegistryError::Create`] if the factory fails.
    pub async fn get_current(&self) -> Result<Arc<F::Resource>, RegistryError> {
        let key = scope::current().ok_or(RegistryError::NoScope)?;
        self.get(key).await
    }

    /// Dispose and forget the instances of `keys`.
    ///
    /// Keys without an instance are ignored; an empty slice clears nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Dispose`] listing every instance that failed
    /// to close. All entries are removed regardless.
    pub async fn clear(&self, keys: &[ScopeKey]) -> Result<(), RegistryError> {
        let removed: Vec<_> = {
            let mut instances = self.instances();
            keys.iter()
                .filter_map(|key| instances.remove(key).map(|slot| (*key, slot)))
                .collect()
        };
        self.dispose(removed).await
    }

    /// Dispose and forget every instance.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Dispose`] listing every instance that failed
    /// to close. All entries are removed regardless.
    pub async fn clear_all(&self) -> Result<(), RegistryError> {
        let removed: Vec<_> = self.instances().drain().collect();
        tracing::info!(registry = %self.name, count = removed.len(), "Clearing all scoped resources");
        self.dispose(removed).await
    }

    async fn dispose(&self, removed: Vec<(ScopeKey, Slot<F::Resource>)>) -> Result<(), RegistryError> {
        let mut errors = CleanupErrors::new();
        for (key, slot) in removed {
            // Unbuilt, or already disposed by a `get` that lost the race
            let Some(resource) = slot.cell.get() else {
                continue;
            };
            if !slot.claim_disposal() {
                continue;
            }
            match self.factory.dispose(resource).await {
                Ok(()) => {
                    tracing::debug!(registry = %self.name, scope = %key, "Scoped resource disposed");
                }
                Err(error) => {
                    tracing::warn!(registry = %self.name, scope = %key, error = %error, "Scoped resource disposal failed");
                    errors.push(format!("{}[{key}]", self.name), &error);
                }
            }
        }
        errors.into_result().map_err(RegistryError::Dispose)
    }

    /// Whether a built instance exists for `key`.
    #[must_use]
    pub fn contains(&self, key: ScopeKey) -> bool {
        self.instances()
            .get(&key)
            .is_some_and(|slot| slot.cell.initialized())
    }

    /// Number of built instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances()
            .values()
            .filter(|slot| slot.cell.initialized())
            .count()
    }

    /// Whether no instance is built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ResourceFactory> ScopedResources for ScopedRegistry<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_scope(
        &self,
        key: ScopeKey,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>> {
        Box::pin(async move { self.clear(&[key]).await })
    }

    fn clear_all_scopes(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<(), RegistryError>> + Send + '_>> {
        Box::pin(self.clear_all())
    }
}
