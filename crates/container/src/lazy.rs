//! Deferred references.
//!
//! A [`LazyRef`] stands in for a dependency that must not be resolved while
//! its owner is being built, typically to break a construction cycle. The
//! first call to [`LazyRef::get`] resolves it, exactly once even under
//! concurrent first use; resolution failures surface there and are retried
//! on the next call.
//!
//! The context is held weakly. Shared targets are cached as `Weak` so a
//! deferred reference never keeps a destroyed singleton alive; prototype
//! targets are owned; refresh-scoped targets are looked up on every call so
//! a scope refresh is observed.

use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::debug;

use crate::context::WeakContext;
use crate::definition::Scope;
use crate::errors::ContainerError;
use crate::interception::{Failure, MethodDescriptor, MethodTarget, ILLEGAL_STATE};
use crate::wiring::DependencyDescriptor;

enum Resolved<D: ?Sized> {
    Shared(Weak<D>),
    Owned(Arc<D>),
    Refreshable,
}

pub struct LazyRef<D: ?Sized> {
    context: WeakContext,
    descriptor: DependencyDescriptor,
    requester: Option<String>,
    resolved: OnceCell<Resolved<D>>,
}

impl<D: ?Sized + Send + Sync + 'static> LazyRef<D> {
    pub(crate) fn new(
        context: WeakContext,
        descriptor: DependencyDescriptor,
        requester: Option<String>,
    ) -> Self {
        Self {
            context,
            descriptor,
            requester,
            resolved: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Result<Arc<D>, ContainerError> {
        match self.resolved.get_or_try_init(|| self.resolve_first())? {
            Resolved::Owned(value) => Ok(Arc::clone(value)),
            Resolved::Shared(weak) => weak
                .upgrade()
                .ok_or_else(|| self.failure("target instance has been destroyed")),
            Resolved::Refreshable => self.lookup().map(|(value, _)| value),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    pub fn descriptor(&self) -> &DependencyDescriptor {
        &self.descriptor
    }

    fn resolve_first(&self) -> Result<Resolved<D>, ContainerError> {
        let (value, scope) = self.lookup()?;
        debug!(
            requester = self.requester.as_deref().unwrap_or("<none>"),
            "Deferred reference to {} resolved ({})",
            self.descriptor.target,
            scope
        );
        Ok(match scope {
            Scope::Singleton => Resolved::Shared(Arc::downgrade(&value)),
            Scope::Prototype => Resolved::Owned(value),
            Scope::Refresh => Resolved::Refreshable,
        })
    }

    fn lookup(&self) -> Result<(Arc<D>, Scope), ContainerError> {
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| self.failure("context has been dropped"))?;
        let component = context
            .resolve_descriptor(&self.descriptor, self.requester.as_deref())
            .map_err(|e| self.failure(e))?
            .ok_or_else(|| self.failure("no matching component"))?;
        let scope = context.definition(component.name())?.scope();
        let value = component
            .view::<D>()
            .ok_or_else(|| ContainerError::TypeMismatch {
                name: component.name().to_string(),
                type_name: std::any::type_name::<D>().to_string(),
            })?;
        Ok((value, scope))
    }

    fn failure(&self, reason: impl fmt::Display) -> ContainerError {
        ContainerError::LazyResolution {
            type_name: self.descriptor.target.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl<D: ?Sized> fmt::Debug for LazyRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("target", &self.descriptor.target)
            .field("qualifier", &self.descriptor.qualifier)
            .field("resolved", &self.resolved.get().is_some())
            .finish()
    }
}

/// A deferred method target forwards calls once resolved
impl MethodTarget for LazyRef<dyn MethodTarget> {
    fn methods(&self) -> Vec<MethodDescriptor> {
        self.get().map(|target| target.methods()).unwrap_or_default()
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
        let target = self
            .get()
            .map_err(|e| Failure::new(&ILLEGAL_STATE, e.to_string()))?;
        target.invoke(method, args)
    }
}
