use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::definition::ComponentDefinition;
use crate::errors::ContainerError;
use crate::types::TypeKey;

#[derive(Clone, Default)]
struct RegistryState {
    definitions: HashMap<String, Arc<ComponentDefinition>>,
    /// Registration sequence per name; replacements keep their slot
    sequence: HashMap<String, u64>,
    next_sequence: u64,
    /// Bumped on every write
    generation: u64,
}

impl RegistryState {
    fn ordered(&self) -> Vec<(&String, &Arc<ComponentDefinition>)> {
        let mut entries = self.definitions.iter().collect::<Vec<_>>();
        entries.sort_by_key(|(name, _)| self.sequence.get(*name).copied().unwrap_or(u64::MAX));
        entries
    }

    fn find_by_type(&self, key: &TypeKey) -> Vec<String> {
        let mut matches = self
            .definitions
            .iter()
            .filter(|(_, def)| def.provides(key))
            .map(|(name, def)| {
                let sequence = self.sequence.get(name).copied().unwrap_or(u64::MAX);
                (def.order(), sequence, name.clone())
            })
            .collect::<Vec<_>>();
        matches.sort();
        matches.into_iter().map(|(_, _, name)| name).collect()
    }
}

/// Immutable view of the registry at one point in time
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    state: Arc<RegistryState>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<Arc<ComponentDefinition>> {
        self.state.definitions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.definitions.contains_key(name)
    }

    /// Names providing `key`, by precedence weight then registration order
    pub fn find_by_type(&self, key: &TypeKey) -> Vec<String> {
        self.state.find_by_type(key)
    }

    pub fn has_type(&self, key: &TypeKey) -> bool {
        self.state.definitions.values().any(|def| def.provides(key))
    }

    pub fn find_by_marker(&self, kind: &str) -> Vec<String> {
        self.state
            .ordered()
            .into_iter()
            .filter(|(_, def)| def.has_marker(kind))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// All definitions in registration order
    pub fn definitions(&self) -> Vec<Arc<ComponentDefinition>> {
        self.state
            .ordered()
            .into_iter()
            .map(|(_, def)| Arc::clone(def))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.state
            .ordered()
            .into_iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.definitions.len()
    }

    /// Changes whenever a definition is registered, replaced or removed
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn is_empty(&self) -> bool {
        self.state.definitions.is_empty()
    }
}

/// Name-keyed store of component definitions.
///
/// Writes are copy-on-write: readers take a [`RegistrySnapshot`] and never
/// observe a half-applied registration.
pub struct DefinitionRegistry {
    state: RwLock<Arc<RegistryState>>,
    allow_overriding: bool,
}

impl DefinitionRegistry {
    pub fn new(allow_overriding: bool) -> Self {
        Self {
            state: RwLock::new(Arc::new(RegistryState::default())),
            allow_overriding,
        }
    }

    /// Register `definition`, replacing any definition with the same name
    /// when overriding is allowed. Returns the replaced definition.
    pub fn register(
        &self,
        definition: ComponentDefinition,
    ) -> Result<Option<Arc<ComponentDefinition>>, ContainerError> {
        if definition.name().is_empty() {
            return Err(ContainerError::InvalidDefinition {
                name: String::new(),
                reason: "definition name must not be empty".into(),
            });
        }

        let name = definition.name().to_string();
        let mut guard = self.state.write();

        if guard.definitions.contains_key(&name) && !self.allow_overriding {
            warn!("Refusing to override definition '{}'", name);
            return Err(ContainerError::DuplicateDefinition { name });
        }

        let state = Arc::make_mut(&mut *guard);
        if !state.sequence.contains_key(&name) {
            let sequence = state.next_sequence;
            state.sequence.insert(name.clone(), sequence);
            state.next_sequence += 1;
        }
        let replaced = state.definitions.insert(name.clone(), Arc::new(definition));
        state.generation += 1;

        match &replaced {
            Some(_) => info!("Definition '{}' replaced", name),
            None => debug!("Definition '{}' registered", name),
        }
        Ok(replaced)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ComponentDefinition>, ContainerError> {
        self.state
            .read()
            .definitions
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().definitions.contains_key(name)
    }

    pub fn find_by_type(&self, key: &TypeKey) -> Vec<String> {
        self.state.read().find_by_type(key)
    }

    pub fn find_by_marker(&self, kind: &str) -> Vec<String> {
        self.snapshot().find_by_marker(kind)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ComponentDefinition>> {
        let mut guard = self.state.write();
        if !guard.definitions.contains_key(name) {
            return None;
        }
        let state = Arc::make_mut(&mut *guard);
        state.sequence.remove(name);
        state.generation += 1;
        let removed = state.definitions.remove(name);
        debug!("Definition '{}' removed", name);
        removed
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            state: Arc::clone(&*self.state.read()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    pub fn len(&self) -> usize {
        self.state.read().definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allows_overriding(&self) -> bool {
        self.allow_overriding
    }
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::markers;

    trait Store: Send + Sync {}

    struct Memory;
    impl Store for Memory {}

    struct Disk;
    impl Store for Disk {}

    fn memory(name: &str, order: i32) -> ComponentDefinition {
        ComponentDefinition::builder::<Memory>(name)
            .factory(|_| Ok(Memory))
            .provides::<dyn Store>(|m| m as Arc<dyn Store>)
            .order(order)
            .build()
    }

    fn disk(name: &str, order: i32) -> ComponentDefinition {
        ComponentDefinition::builder::<Disk>(name)
            .factory(|_| Ok(Disk))
            .provides::<dyn Store>(|d| d as Arc<dyn Store>)
            .order(order)
            .build()
    }

    #[test]
    fn test_register_and_get() {
        let registry = DefinitionRegistry::default();
        assert!(registry.register(memory("memory", 0)).unwrap().is_none());

        assert!(registry.contains("memory"));
        assert_eq!(registry.get("memory").unwrap().name(), "memory");
        assert!(matches!(
            registry.get("missing"),
            Err(ContainerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_replace_is_atomic_and_keeps_slot() {
        let registry = DefinitionRegistry::default();
        registry.register(memory("a", 0)).unwrap();
        registry.register(disk("b", 0)).unwrap();

        let before = registry.snapshot();
        let replaced = registry.register(disk("a", 0)).unwrap();
        assert!(replaced.is_some());

        // The old snapshot still sees the previous definition
        assert!(before
            .get("a")
            .unwrap()
            .provides(&TypeKey::of::<Memory>()));
        assert!(registry.get("a").unwrap().provides(&TypeKey::of::<Disk>()));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_overriding_disabled() {
        let registry = DefinitionRegistry::new(false);
        registry.register(memory("a", 0)).unwrap();
        let result = registry.register(disk("a", 0));
        assert!(matches!(
            result,
            Err(ContainerError::DuplicateDefinition { .. })
        ));
        assert!(registry.get("a").unwrap().provides(&TypeKey::of::<Memory>()));
    }

    #[test]
    fn test_find_by_type_orders_by_weight_then_registration() {
        let registry = DefinitionRegistry::default();
        registry.register(memory("first", 10)).unwrap();
        registry.register(disk("second", 0)).unwrap();
        registry.register(memory("third", 10)).unwrap();

        assert_eq!(
            registry.find_by_type(&TypeKey::of::<dyn Store>()),
            vec!["second", "first", "third"]
        );
        assert_eq!(registry.find_by_type(&TypeKey::of::<Disk>()), vec!["second"]);
        assert!(registry.find_by_type(&TypeKey::of::<String>()).is_empty());
    }

    #[test]
    fn test_find_by_marker_and_remove() {
        let registry = DefinitionRegistry::default();
        registry.register(memory("plain", 0)).unwrap();
        registry
            .register(memory("config", 0).with_marker(crate::definition::Marker::new(
                markers::CONFIGURATION,
            )))
            .unwrap();

        assert_eq!(registry.find_by_marker(markers::CONFIGURATION), vec!["config"]);
        assert!(registry.remove("config").is_some());
        assert!(registry.remove("config").is_none());
        assert!(registry.find_by_marker(markers::CONFIGURATION).is_empty());
    }

    #[test]
    fn test_generation_tracks_writes() {
        let registry = DefinitionRegistry::default();
        let empty = registry.snapshot().generation();
        registry.register(memory("a", 0)).unwrap();
        let registered = registry.snapshot().generation();
        assert_ne!(empty, registered);

        registry.register(memory("a", 1)).unwrap();
        assert_ne!(registry.snapshot().generation(), registered);
        assert!(registry.remove("missing").is_none());
        let replaced = registry.snapshot().generation();
        registry.remove("a");
        assert_ne!(registry.snapshot().generation(), replaced);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = DefinitionRegistry::default();
        assert!(matches!(
            registry.register(memory("", 0)),
            Err(ContainerError::InvalidDefinition { .. })
        ));
    }
}
