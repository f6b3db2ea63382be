use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::ApplicationContext;
use crate::definition::ComponentDefinition;
use crate::errors::ContainerError;
use crate::hooks::{Decorator, PostProcessor};
use crate::interception::{Interceptor, MethodTarget};
use crate::types::Component;

type Predicate = Arc<dyn Fn(&ComponentDefinition, &dyn MethodTarget) -> bool + Send + Sync>;

/// Interceptor applied to every method target matching a predicate
#[derive(Clone)]
pub struct InterceptorBinding {
    interceptor: Arc<dyn Interceptor>,
    applies: Predicate,
}

impl InterceptorBinding {
    pub fn new<F>(interceptor: Arc<dyn Interceptor>, applies: F) -> Self
    where
        F: Fn(&ComponentDefinition, &dyn MethodTarget) -> bool + Send + Sync + 'static,
    {
        Self {
            interceptor,
            applies: Arc::new(applies),
        }
    }

    /// Every method target
    pub fn all(interceptor: Arc<dyn Interceptor>) -> Self {
        Self::new(interceptor, |_, _| true)
    }

    /// Components carrying marker `kind`
    pub fn marked(interceptor: Arc<dyn Interceptor>, kind: &str) -> Self {
        let kind = kind.to_string();
        Self::new(interceptor, move |definition, _| definition.has_marker(&kind))
    }

    /// Targets exposing method `method`
    pub fn method(interceptor: Arc<dyn Interceptor>, method: &str) -> Self {
        let method = method.to_string();
        Self::new(interceptor, move |_, target| {
            target.methods().iter().any(|m| m.name() == method)
        })
    }

    pub fn interceptor_name(&self) -> &str {
        self.interceptor.name()
    }
}

impl fmt::Debug for InterceptorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterceptorBinding({})", self.interceptor.name())
    }
}

/// Applies collaborator interceptor bindings in registration order, so a
/// later binding wraps an earlier one
#[derive(Default)]
pub struct InterceptionProcessor {
    bindings: RwLock<Vec<InterceptorBinding>>,
}

impl InterceptionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, binding: InterceptorBinding) {
        tracing::debug!("Interceptor '{}' bound", binding.interceptor_name());
        self.bindings.write().push(binding);
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PostProcessor for InterceptionProcessor {
    fn name(&self) -> &str {
        "interception"
    }

    fn order(&self) -> i32 {
        300
    }

    fn as_decorator(&self) -> Option<&dyn Decorator> {
        Some(self)
    }
}

impl Decorator for InterceptionProcessor {
    fn decorate(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        _context: &ApplicationContext,
    ) -> Result<Option<Component>, ContainerError> {
        let Some(target) = component.view::<dyn MethodTarget>() else {
            return Ok(None);
        };
        let bindings = self.bindings.read().clone();

        let mut current: Option<Component> = None;
        for binding in bindings {
            if !(binding.applies)(definition, target.as_ref()) {
                continue;
            }
            let base = current.as_ref().unwrap_or(component);
            if let Some(wrapped) = base.intercept(Arc::clone(&binding.interceptor)) {
                current = Some(wrapped);
            }
        }
        Ok(current)
    }
}
