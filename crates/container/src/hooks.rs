//! Post-processing hooks.
//!
//! A hook is any [`PostProcessor`]; what it does is discovered by capability
//! queries rather than by downcasting. The context runs hooks of each
//! capability in ascending order weight (most negative first), ties in
//! registration order.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::context::ApplicationContext;
use crate::definition::ComponentDefinition;
use crate::errors::ContainerError;
use crate::registry::DefinitionRegistry;
use crate::types::Component;
use crate::wiring::Resolver;

pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn order(&self) -> i32 {
        0
    }

    /// Called once when the hook is added to a context
    fn on_registered(&self, _context: &ApplicationContext) -> Result<(), ContainerError> {
        Ok(())
    }

    fn as_definition_rewriter(&self) -> Option<&dyn DefinitionRewriter> {
        None
    }

    fn as_instantiation_aware(&self) -> Option<&dyn InstantiationAware> {
        None
    }

    fn as_wiring(&self) -> Option<&dyn WiringHook> {
        None
    }

    fn as_decorator(&self) -> Option<&dyn Decorator> {
        None
    }
}

/// Edits the registry after loading, before any ordinary instantiation
pub trait DefinitionRewriter {
    fn rewrite(
        &self,
        registry: &DefinitionRegistry,
        context: &ApplicationContext,
    ) -> Result<(), ContainerError>;
}

/// May supply the instance for a definition instead of its factory.
/// Wiring and init are skipped for a substituted instance.
pub trait InstantiationAware {
    fn before_instantiation(
        &self,
        definition: &ComponentDefinition,
        context: &ApplicationContext,
    ) -> Result<Option<Component>, ContainerError>;
}

/// Injects dependencies into a freshly constructed instance
pub trait WiringHook {
    fn wire(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        resolver: &Resolver<'_>,
    ) -> Result<(), ContainerError>;
}

/// Runs after init; may return a replacement (a proxy) for the component
pub trait Decorator {
    fn decorate(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        context: &ApplicationContext,
    ) -> Result<Option<Component>, ContainerError>;
}

/// Receives the owning context after wiring, before init
pub trait ContextAware: Send + Sync {
    fn set_context(&self, context: &ApplicationContext) -> anyhow::Result<()>;
}

/// Called once every eager singleton is ready, before the refreshed event
pub trait AfterRefresh: Send + Sync {
    fn after_refresh(&self, context: &ApplicationContext) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct RegisteredHook {
    /// Component name when the hook is itself a component
    source: Option<String>,
    hook: Arc<dyn PostProcessor>,
}

/// Ordered set of hooks of one context
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping order-weight order, after existing hooks of equal
    /// weight. Returns false when a component-backed hook of that name is
    /// already present.
    pub fn register(&self, hook: Arc<dyn PostProcessor>, source: Option<&str>) -> bool {
        let mut hooks = self.hooks.write();
        if let Some(name) = source {
            if hooks.iter().any(|h| h.source.as_deref() == Some(name)) {
                return false;
            }
        }
        let order = hook.order();
        let position = hooks
            .iter()
            .position(|h| h.hook.order() > order)
            .unwrap_or(hooks.len());
        debug!("Hook '{}' registered (order {})", hook.name(), order);
        hooks.insert(
            position,
            RegisteredHook {
                source: source.map(str::to_string),
                hook,
            },
        );
        true
    }

    pub fn contains_source(&self, name: &str) -> bool {
        self.hooks
            .read()
            .iter()
            .any(|h| h.source.as_deref() == Some(name))
    }

    /// Current hooks in execution order
    pub fn snapshot(&self) -> Vec<Arc<dyn PostProcessor>> {
        self.hooks.read().iter().map(|h| Arc::clone(&h.hook)).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks
            .read()
            .iter()
            .map(|h| h.hook.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    impl PostProcessor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn order(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn test_hooks_sorted_by_order_then_registration() {
        let registry = HookRegistry::new();
        registry.register(Arc::new(Named("user-a", 0)), None);
        registry.register(Arc::new(Named("wiring", i32::MIN)), None);
        registry.register(Arc::new(Named("late", 100)), None);
        registry.register(Arc::new(Named("user-b", 0)), None);

        assert_eq!(registry.names(), vec!["wiring", "user-a", "user-b", "late"]);
    }

    #[test]
    fn test_component_hooks_registered_once() {
        let registry = HookRegistry::new();
        assert!(registry.register(Arc::new(Named("x", 0)), Some("x")));
        assert!(!registry.register(Arc::new(Named("x", 0)), Some("x")));
        assert!(registry.contains_source("x"));
        assert_eq!(registry.len(), 1);
    }
}
