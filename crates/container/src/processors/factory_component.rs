use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::context::ApplicationContext;
use crate::definition::ComponentDefinition;
use crate::errors::ContainerError;
use crate::events::{ContextRefreshed, Delivery};
use crate::hooks::{DefinitionRewriter, PostProcessor};
use crate::registry::DefinitionRegistry;

type Processed = Arc<RwLock<Option<HashSet<String>>>>;

/// Registers the product definition of every factory-of-components.
///
/// Each factory is processed once; the processed set is created on first
/// use and dropped when the context reports it has refreshed.
#[derive(Default)]
pub struct FactoryComponentProcessor {
    processed: Processed,
}

impl FactoryComponentProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `name` was already processed
    fn mark(&self, name: &str) -> bool {
        if let Some(processed) = self.processed.read().as_ref() {
            if processed.contains(name) {
                return false;
            }
        }
        let mut guard = self.processed.write();
        guard
            .get_or_insert_with(HashSet::new)
            .insert(name.to_string())
    }

    pub fn processed_count(&self) -> usize {
        self.processed.read().as_ref().map_or(0, HashSet::len)
    }
}

impl PostProcessor for FactoryComponentProcessor {
    fn name(&self) -> &str {
        "factory-component"
    }

    fn order(&self) -> i32 {
        i32::MIN + 1
    }

    fn on_registered(&self, context: &ApplicationContext) -> Result<(), ContainerError> {
        let processed = Arc::clone(&self.processed);
        context.subscribe::<ContextRefreshed, _>(
            "factory-component-reset",
            Delivery::Sync,
            move |_| {
                processed.write().take();
                Ok(())
            },
        );
        Ok(())
    }

    fn as_definition_rewriter(&self) -> Option<&dyn DefinitionRewriter> {
        Some(self)
    }
}

impl DefinitionRewriter for FactoryComponentProcessor {
    fn rewrite(
        &self,
        registry: &DefinitionRegistry,
        _context: &ApplicationContext,
    ) -> Result<(), ContainerError> {
        for factory in registry.snapshot().definitions() {
            if !factory.is_factory_of_components() {
                continue;
            }
            if !factory.is_autowire_candidate() {
                debug!(
                    component = factory.name(),
                    "Factory is not an autowire candidate; product not registered"
                );
                continue;
            }
            if !self.mark(factory.name()) {
                continue;
            }
            let Some(product) = ComponentDefinition::product_of(&factory) else {
                continue;
            };
            if registry.contains(product.name()) {
                warn!(
                    component = factory.name(),
                    "Product '{}' is already defined; keeping the existing definition",
                    product.name()
                );
                continue;
            }
            debug!(
                component = factory.name(),
                "Registering product '{}'",
                product.name()
            );
            registry.register(product)?;
        }
        Ok(())
    }
}
