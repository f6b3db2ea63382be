use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::errors::ContainerError;
use crate::types::Component;

/// Cache usage counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub singleton_hits: u64,
    pub singleton_creations: u64,
    pub prototype_creations: u64,
    pub replacements: u64,
}

#[derive(Default)]
struct Counters {
    singleton_hits: AtomicU64,
    singleton_creations: AtomicU64,
    prototype_creations: AtomicU64,
    replacements: AtomicU64,
}

/// Shared-instance cache of a context.
///
/// Lookups take the read lock only. Creation goes through a double-checked
/// guard per name so that concurrent first requests for a name run its
/// factory once while other names are built in parallel. Guards are
/// reentrant: a factory may request further components on the same thread.
pub struct LifetimeManager {
    singletons: RwLock<HashMap<String, Component>>,
    /// Raw instances whose creation is still running (wiring, init)
    early: Mutex<HashMap<String, Component>>,
    /// Per-name creation guards; an entry lives until its name is cached
    guards: Mutex<HashMap<String, Arc<ReentrantMutex<()>>>>,
    /// Names in the order their instance entered the cache
    creation_order: Mutex<Vec<String>>,
    counters: Counters,
}

impl LifetimeManager {
    pub fn new() -> Self {
        Self {
            singletons: RwLock::new(HashMap::new()),
            early: Mutex::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            creation_order: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn cached(&self, name: &str) -> Option<Component> {
        let found = self.singletons.read().get(name).cloned();
        if found.is_some() {
            self.counters.singleton_hits.fetch_add(1, Ordering::Relaxed);
            debug!(component = name, "Singleton cache hit");
        }
        found
    }

    fn guard(&self, name: &str) -> Arc<ReentrantMutex<()>> {
        let mut guards = self.guards.lock();
        Arc::clone(
            guards
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ReentrantMutex::new(()))),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.singletons.read().contains_key(name)
    }

    /// Cached instance, or the result of `create` stored under `name`.
    /// `create` runs at most once per name even under concurrent requests.
    pub fn get_or_create<F>(&self, name: &str, create: F) -> Result<Component, ContainerError>
    where
        F: FnOnce() -> Result<Component, ContainerError>,
    {
        if let Some(component) = self.cached(name) {
            return Ok(component);
        }

        let guard = self.guard(name);
        let _creating = guard.lock();
        if let Some(component) = self.cached(name) {
            return Ok(component);
        }

        let component = create()?;
        self.singletons
            .write()
            .insert(name.to_string(), component.clone());
        self.creation_order.lock().push(name.to_string());
        // late waiters hold their own clone and find the cached instance
        self.guards.lock().remove(name);
        self.counters
            .singleton_creations
            .fetch_add(1, Ordering::Relaxed);
        debug!(component = name, "Singleton created");
        Ok(component)
    }

    pub fn record_prototype(&self) {
        self.counters
            .prototype_creations
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Swap the cached instance, returning the previous one
    pub fn replace(&self, name: &str, component: Component) -> Option<Component> {
        let guard = self.guard(name);
        let _replacing = guard.lock();
        let previous = self
            .singletons
            .write()
            .insert(name.to_string(), component);
        if previous.is_none() {
            self.creation_order.lock().push(name.to_string());
        }
        self.counters.replacements.fetch_add(1, Ordering::Relaxed);
        previous
    }

    pub fn remove(&self, name: &str) -> Option<Component> {
        let guard = self.guard(name);
        let _removing = guard.lock();
        let removed = self.singletons.write().remove(name);
        if removed.is_some() {
            self.creation_order.lock().retain(|n| n != name);
        }
        removed
    }

    pub(crate) fn publish_early(&self, component: &Component) {
        self.early
            .lock()
            .insert(component.name().to_string(), component.clone());
    }

    pub(crate) fn early(&self, name: &str) -> Option<Component> {
        self.early.lock().get(name).cloned()
    }

    pub(crate) fn retract_early(&self, name: &str) {
        self.early.lock().remove(name);
    }

    /// Cached names in creation order
    pub fn creation_order(&self) -> Vec<String> {
        self.creation_order.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.singletons.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            singleton_hits: self.counters.singleton_hits.load(Ordering::Relaxed),
            singleton_creations: self.counters.singleton_creations.load(Ordering::Relaxed),
            prototype_creations: self.counters.prototype_creations.load(Ordering::Relaxed),
            replacements: self.counters.replacements.load(Ordering::Relaxed),
        }
    }
}

impl Default for LifetimeManager {
    fn default() -> Self {
        Self::new()
    }
}
