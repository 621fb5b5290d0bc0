// src/resource.rs

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static PROCESS_CACHE: Lazy<ResourceCache> = Lazy::new(ResourceCache::new);

/// The cache shared by everything in this worker process. Dies with the
/// process; a restarted worker starts from an empty cache and rebuilds from
/// factories.
pub fn process_cache() -> &'static ResourceCache {
    &PROCESS_CACHE
}

/// Per-process cache of resources that must not travel inside messages:
/// broker producers, algorithm engines with loaded model state, filesystem
/// handles. Only zero-argument factories cross process boundaries; the
/// instance itself is built lazily on first access and lives until the
/// process dies. After a restart nothing carries over, so every resource
/// must be cheaply reconstructible from its factory alone.
///
/// At most one instance per resource type per process. The cache does not
/// make the instance itself thread-safe; concurrent local callers
/// synchronize on their own.
pub struct ResourceCache {
    entries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fetch the process-wide instance of `T`, building it with `factory` on
    /// first access. Concurrent first-access calls run the factory once and
    /// all receive the same instance.
    pub fn get_or_create<T, F>(&self, factory: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(factory()) as Arc<dyn Any + Send + Sync>)
            .clone();
        match entry.downcast::<T>() {
            Ok(instance) => instance,
            Err(_) => unreachable!("cache entries are keyed by their TypeId"),
        }
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}
