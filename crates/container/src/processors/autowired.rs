use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::definition::ComponentDefinition;
use crate::errors::ContainerError;
use crate::hooks::{PostProcessor, WiringHook};
use crate::registry::RegistrySnapshot;
use crate::types::Component;
use crate::wiring::{DependencyDescriptor, Resolver};

/// Applies a definition's wiring plan to each new instance.
///
/// Fields satisfied by a product of the instance's own factory methods are
/// wired in a second pass, once every other field is in place, so the
/// product can be built from the partially wired owner. The split is
/// computed once per definition and recomputed only when the registry
/// changes.
#[derive(Default)]
pub struct AutowiredProcessor {
    /// Per definition: registry generation and, per plan entry, whether it
    /// is satisfied by the owner's own product
    partitions: RwLock<HashMap<String, (u64, Arc<[bool]>)>>,
}

impl AutowiredProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(
        &self,
        registry: &RegistrySnapshot,
        definition: &ComponentDefinition,
    ) -> Arc<[bool]> {
        let owner = definition.name();
        let generation = registry.generation();
        if let Some((cached, forward)) = self.partitions.read().get(owner) {
            if *cached == generation {
                return Arc::clone(forward);
            }
        }

        let forward: Arc<[bool]> = definition
            .wiring_plan()
            .map(|plan| {
                plan.entries()
                    .iter()
                    .map(|entry| Self::is_own_product(registry, owner, entry.descriptor()))
                    .collect()
            })
            .unwrap_or_else(|| Arc::from(Vec::new()));
        self.partitions
            .write()
            .insert(owner.to_string(), (generation, Arc::clone(&forward)));
        forward
    }

    #[cfg(test)]
    fn cached_partitions(&self) -> usize {
        self.partitions.read().len()
    }

    fn is_own_product(
        registry: &RegistrySnapshot,
        owner: &str,
        descriptor: &DependencyDescriptor,
    ) -> bool {
        registry
            .definitions()
            .iter()
            .filter(|def| def.declaring() == Some(owner))
            .any(|def| match &descriptor.qualifier {
                Some(name) => def.name() == name,
                None => def.provides(&descriptor.target),
            })
    }
}

impl PostProcessor for AutowiredProcessor {
    fn name(&self) -> &str {
        "autowired"
    }

    fn order(&self) -> i32 {
        i32::MIN
    }

    fn as_wiring(&self) -> Option<&dyn WiringHook> {
        Some(self)
    }
}

impl WiringHook for AutowiredProcessor {
    fn wire(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        resolver: &Resolver<'_>,
    ) -> Result<(), ContainerError> {
        let Some(plan) = definition.wiring_plan() else {
            return Ok(());
        };
        let registry = resolver.context().registry_snapshot();
        let owner = definition.name();
        let own_product = self.partition(&registry, definition);

        let (forward, eager): (Vec<_>, Vec<_>) = plan
            .entries()
            .iter()
            .zip(own_product.iter())
            .partition(|(_, own)| **own);

        for (entry, _) in eager {
            entry.inject(component.raw(), resolver)?;
        }
        for (entry, _) in forward {
            debug!(
                component = owner,
                "Wiring '{}' from the component's own product",
                entry.descriptor().field
            );
            entry.inject(component.raw(), resolver)?;
        }
        Ok(())
    }
}
