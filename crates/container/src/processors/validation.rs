use std::sync::Arc;

use crate::context::ApplicationContext;
use crate::definition::{markers, ComponentDefinition};
use crate::errors::ContainerError;
use crate::hooks::{Decorator, PostProcessor};
use crate::interception::{MethodTarget, ValidationInterceptor};
use crate::types::Component;

/// Wraps method targets that declare constraints (or carry the validated
/// marker) with a [`ValidationInterceptor`]
#[derive(Debug, Default)]
pub struct MethodValidationProcessor;

impl MethodValidationProcessor {
    pub fn new() -> Self {
        Self
    }
}

impl PostProcessor for MethodValidationProcessor {
    fn name(&self) -> &str {
        "method-validation"
    }

    fn order(&self) -> i32 {
        100
    }

    fn as_decorator(&self) -> Option<&dyn Decorator> {
        Some(self)
    }
}

impl Decorator for MethodValidationProcessor {
    fn decorate(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
        context: &ApplicationContext,
    ) -> Result<Option<Component>, ContainerError> {
        if !context.config().validation_enabled {
            return Ok(None);
        }
        let Some(target) = component.view::<dyn MethodTarget>() else {
            return Ok(None);
        };
        let constrained = definition.has_marker(markers::VALIDATED)
            || target.methods().iter().any(|m| m.has_constraints());
        if !constrained {
            return Ok(None);
        }
        Ok(component.intercept(Arc::new(ValidationInterceptor)))
    }
}
