//! Resource factory that counts what it builds and tears down.

use lockstep_core::{ResourceError, ResourceFactory};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Resource handed out by [`CountingFactory`].
#[derive(Debug)]
pub struct CountedResource {
    id: usize,
    closed: AtomicBool,
}

impl CountedResource {
    /// Construction sequence number, starting at 1.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Whether the factory disposed this resource.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    disposed: AtomicUsize,
    create_failures: AtomicUsize,
    failing_dispose: Mutex<HashSet<usize>>,
}

/// Factory producing [`CountedResource`]s.
///
/// Clones share counters. Construction can be slowed down (to widen races)
/// and made to fail a number of times.
#[derive(Clone, Default)]
pub struct CountingFactory {
    counters: Arc<Counters>,
    create_delay: Option<Duration>,
}

impl CountingFactory {
    /// Create a factory with no delay and no injected failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep `delay` inside every `create`.
    #[must_use]
    pub const fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Fail the next `count` constructions.
    #[must_use]
    pub fn failing_creates(self, count: usize) -> Self {
        self.counters.create_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail disposal of the resource with construction number `id`.
    #[must_use]
    pub fn failing_dispose_of(self, id: usize) -> Self {
        self.counters.failing_dispose.lock().unwrap().insert(id);
        self
    }

    /// Successful constructions so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Disposal attempts so far (successful or not).
    #[must_use]
    pub fn disposed(&self) -> usize {
        self.counters.disposed.load(Ordering::SeqCst)
    }
}

impl ResourceFactory for CountingFactory {
    type Resource = CountedResource;

    async fn create(&self) -> Result<CountedResource, ResourceError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .counters
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ResourceError::CreateFailed("connection refused".to_string()));
        }
        let id = self.counters.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CountedResource {
            id,
            closed: AtomicBool::new(false),
        })
    }

    async fn dispose(&self, resource: &CountedResource) -> Result<(), ResourceError> {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        if self.counters.failing_dispose.lock().unwrap().contains(&resource.id) {
            return Err(ResourceError::DisposeFailed(format!(
                "resource {} refused to close",
                resource.id
            )));
        }
        resource.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
