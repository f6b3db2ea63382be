use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::ApplicationContext;
use crate::definition::{markers, ComponentDefinition};
use crate::errors::ContainerError;
use crate::hooks::{Decorator, PostProcessor};
use crate::interception::{ExceptionAdvice, ExceptionAdviceInterceptor, MethodTarget};
use crate::types::{Component, TypeKey};

/// Routes failures of advised method targets through the handlers of every
/// exception-advice component covering them, in advice registration order
#[derive(Debug, Default)]
pub struct ExceptionAdviceProcessor;

impl ExceptionAdviceProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl PostProcessor for ExceptionAdviceProcessor {
    fn name(&self) -> &str {
        "exception-advice"
    }

    fn order(&self) -> i32 {
        200
    }

    fn as_decorator(&self) -> Option<&dyn Decorator> {
        Some(self)
    }
}

impl Decorator for ExceptionAdviceProcessor {
    fn decorate(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        context: &ApplicationContext,
    ) -> Result<Option<Component>, ContainerError> {
        if definition.has_marker(markers::EXCEPTION_ADVICE)
            || !component.provides(&TypeKey::of::<dyn MethodTarget>())
        {
            return Ok(None);
        }

        let mut handlers = Vec::new();
        for name in context.find_definitions_by_marker(markers::EXCEPTION_ADVICE) {
            if context.is_in_creation(&name) {
                continue;
            }
            let advice_component = context
                .get_component(&name)
                .map_err(|e| ContainerError::Hook {
                    hook: self.name().to_string(),
                    component: definition.name().to_string(),
                    reason: format!("advice '{}' unavailable: {}", name, e),
                })?;
            let Some(advice) = advice_component.view::<dyn ExceptionAdvice>() else {
                warn!(
                    component = %name,
                    "Marked as exception advice but does not provide ExceptionAdvice"
                );
                continue;
            };
            if advice.covers(definition) {
                handlers.extend(advice.handlers());
            }
        }

        if handlers.is_empty() {
            return Ok(None);
        }
        debug!(
            component = definition.name(),
            "Installing {} exception handler(s)",
            handlers.len()
        );
        Ok(component.intercept(Arc::new(ExceptionAdviceInterceptor::new(handlers))))
    }
}
