//! `DynamicConfig` handles for live-updatable configuration.
//!
//! Reads are lock-free (`ArcSwap`); every reader sees either the old or the new value in
//! full. The limiter shares one handle for the [`TierTable`](crate::config::TierTable)
//! between its cache policy provider and its degradation handler, so a reload takes
//! effect for both at once.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure. Concurrent updates are retried, never lost.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }

    /// Replace the value only if `candidate` passes `check`; the old value stays otherwise.
    pub fn try_set<E, F>(&self, candidate: T, check: F) -> Result<(), E>
    where
        F: FnOnce(&T) -> Result<(), E>,
    {
        check(&candidate)?;
        self.set(candidate);
        Ok(())
    }
}
