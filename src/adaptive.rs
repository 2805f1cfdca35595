//! `DynamicConfig` handles for knobs that can be retuned while a route is running.
//!
//! Default uses `ArcSwap` for lock-free reads; feature `adaptive-rwlock` switches to a
//! `parking_lot::RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use parking_lot::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, live-updatable value. Clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write() = Arc::new(value);
        }
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.rcu(|current| f(current));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write();
            let next = f(&guard);
            *guard = Arc::new(next);
        }
    }
}

impl<T: Copy> DynamicConfig<T> {
    /// Copy out the current value.
    pub fn value(&self) -> T {
        *self.get()
    }
}
