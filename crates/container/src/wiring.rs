//! Dependency wiring.
//!
//! A component type declares its injection points once, as a
//! [`WiringPlan`]: one entry per field, each naming the slot accessor and how
//! the dependency is looked up (by type or by name, eager or deferred,
//! required or optional). The plan is stored in the definition and applied to
//! every instance the definition produces.
//!
//! Fields are [`Autowired`] / [`AutowiredAll`] slots written exactly once,
//! which keeps instances `Send + Sync` without interior locking on reads.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::context::ApplicationContext;
use crate::environment::Environment;
use crate::errors::ContainerError;
use crate::lazy::LazyRef;
use crate::registry::RegistrySnapshot;
use crate::types::{Component, Instance, TypeKey};

/// Single dependency or every candidate of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Single,
    Collection,
}

/// One injection point
#[derive(Debug, Clone)]
pub struct DependencyDescriptor {
    pub field: &'static str,
    pub target: TypeKey,
    pub qualifier: Option<String>,
    pub shape: Shape,
    pub lazy: bool,
    pub required: bool,
}

impl DependencyDescriptor {
    pub fn by_type<D: ?Sized + 'static>(field: &'static str) -> Self {
        Self {
            field,
            target: TypeKey::of::<D>(),
            qualifier: None,
            shape: Shape::Single,
            lazy: false,
            required: true,
        }
    }
}

/// Lookup options of a field
#[derive(Debug, Clone, Default)]
pub struct Dependency {
    qualifier: Option<String>,
    lazy: bool,
    optional: bool,
}

impl Dependency {
    pub fn by_type() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(name.into()),
            ..Self::default()
        }
    }

    /// Inject a deferred reference resolved on first use
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Leave the slot empty when no candidate exists
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

enum Slot<D: ?Sized> {
    Ready(Arc<D>),
    Deferred(LazyRef<D>),
}

/// Field slot for a single dependency
pub struct Autowired<D: ?Sized> {
    slot: OnceCell<Slot<D>>,
}

impl<D: ?Sized + Send + Sync + 'static> Autowired<D> {
    pub fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// The dependency; resolves a deferred reference on first call
    pub fn get(&self) -> Result<Arc<D>, ContainerError> {
        match self.slot.get() {
            Some(Slot::Ready(value)) => Ok(Arc::clone(value)),
            Some(Slot::Deferred(lazy)) => lazy.get(),
            None => Err(ContainerError::Unwired {
                type_name: std::any::type_name::<D>().to_string(),
            }),
        }
    }

    /// `None` when unwired or when a deferred reference cannot resolve
    pub fn try_get(&self) -> Option<Arc<D>> {
        self.get().ok()
    }

    pub fn is_wired(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.slot.get(), Some(Slot::Deferred(_)))
    }

    pub fn lazy_ref(&self) -> Option<&LazyRef<D>> {
        match self.slot.get() {
            Some(Slot::Deferred(lazy)) => Some(lazy),
            _ => None,
        }
    }

    pub(crate) fn fill(&self, value: Arc<D>) -> bool {
        self.slot.set(Slot::Ready(value)).is_ok()
    }

    pub(crate) fn defer(&self, lazy: LazyRef<D>) -> bool {
        self.slot.set(Slot::Deferred(lazy)).is_ok()
    }
}

impl<D: ?Sized> Default for Autowired<D> {
    fn default() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }
}

impl<D: ?Sized> fmt::Debug for Autowired<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.slot.get() {
            Some(Slot::Ready(_)) => "ready",
            Some(Slot::Deferred(_)) => "deferred",
            None => "unwired",
        };
        write!(f, "Autowired<{}>({})", std::any::type_name::<D>(), state)
    }
}

/// Field slot receiving every candidate of a type, in precedence order
pub struct AutowiredAll<D: ?Sized> {
    slot: OnceCell<Vec<Arc<D>>>,
}

impl<D: ?Sized> AutowiredAll<D> {
    pub fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// Empty until wired
    pub fn get(&self) -> &[Arc<D>] {
        self.slot.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_empty()
    }

    pub fn is_wired(&self) -> bool {
        self.slot.get().is_some()
    }

    pub(crate) fn fill(&self, values: Vec<Arc<D>>) -> bool {
        self.slot.set(values).is_ok()
    }
}

impl<D: ?Sized> Default for AutowiredAll<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ?Sized> fmt::Debug for AutowiredAll<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AutowiredAll<{}>({})",
            std::any::type_name::<D>(),
            self.len()
        )
    }
}

/// Types that describe their own injection points
pub trait Autowire: Sized + Send + Sync + 'static {
    fn wiring_plan() -> WiringPlan<Self>;
}

type InjectFn = Arc<
    dyn Fn(&Instance, &Resolver<'_>, &DependencyDescriptor) -> Result<(), ContainerError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub(crate) struct PlanEntry {
    descriptor: DependencyDescriptor,
    inject: InjectFn,
}

impl PlanEntry {
    pub(crate) fn descriptor(&self) -> &DependencyDescriptor {
        &self.descriptor
    }

    pub(crate) fn inject(
        &self,
        raw: &Instance,
        resolver: &Resolver<'_>,
    ) -> Result<(), ContainerError> {
        (self.inject)(raw, resolver, &self.descriptor)
    }
}

/// Injection points of `T`
pub struct WiringPlan<T> {
    entries: Vec<PlanEntry>,
    _owner: PhantomData<fn(&T)>,
}

impl<T: Send + Sync + 'static> WiringPlan<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            _owner: PhantomData,
        }
    }

    /// Required, eager, by-type field
    pub fn field<D>(self, field: &'static str, slot: fn(&T) -> &Autowired<D>) -> Self
    where
        D: ?Sized + Send + Sync + 'static,
    {
        self.field_with(field, Dependency::by_type(), slot)
    }

    pub fn field_with<D>(
        mut self,
        field: &'static str,
        dependency: Dependency,
        slot: fn(&T) -> &Autowired<D>,
    ) -> Self
    where
        D: ?Sized + Send + Sync + 'static,
    {
        let descriptor = DependencyDescriptor {
            field,
            target: TypeKey::of::<D>(),
            qualifier: dependency.qualifier,
            shape: Shape::Single,
            lazy: dependency.lazy,
            required: !dependency.optional,
        };

        let inject = inject_fn(move |raw, resolver, descriptor| {
            let owner = owner_of::<T>(raw, resolver)?;
            let target = slot(&owner);
            if target.is_wired() {
                return Ok(());
            }
            if descriptor.lazy {
                target.defer(resolver.lazy_for::<D>(descriptor));
            } else if let Some(value) = resolver.resolve::<D>(descriptor)? {
                target.fill(value);
            }
            Ok(())
        });

        self.entries.push(PlanEntry { descriptor, inject });
        self
    }

    /// Every candidate of `D`; empty when there is none
    pub fn collection<D>(mut self, field: &'static str, slot: fn(&T) -> &AutowiredAll<D>) -> Self
    where
        D: ?Sized + Send + Sync + 'static,
    {
        let descriptor = DependencyDescriptor {
            field,
            target: TypeKey::of::<D>(),
            qualifier: None,
            shape: Shape::Collection,
            lazy: false,
            required: false,
        };

        let inject = inject_fn(move |raw, resolver, descriptor| {
            let owner = owner_of::<T>(raw, resolver)?;
            let target = slot(&owner);
            if !target.is_wired() {
                target.fill(resolver.resolve_all::<D>(descriptor)?);
            }
            Ok(())
        });

        self.entries.push(PlanEntry { descriptor, inject });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn erase(self) -> ErasedPlan {
        ErasedPlan {
            owner: TypeKey::of::<T>(),
            entries: self.entries.into(),
        }
    }
}

impl<T: Send + Sync + 'static> Default for WiringPlan<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn inject_fn<F>(inject: F) -> InjectFn
where
    F: Fn(&Instance, &Resolver<'_>, &DependencyDescriptor) -> Result<(), ContainerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(inject)
}

fn owner_of<T: Send + Sync + 'static>(
    raw: &Instance,
    resolver: &Resolver<'_>,
) -> Result<Arc<T>, ContainerError> {
    raw.clone()
        .downcast::<T>()
        .map_err(|_| ContainerError::TypeMismatch {
            name: resolver.requester().unwrap_or("<anonymous>").to_string(),
            type_name: std::any::type_name::<T>().to_string(),
        })
}

/// Wiring plan with its owner type erased, as stored in a definition
#[derive(Clone)]
pub struct ErasedPlan {
    owner: TypeKey,
    entries: Arc<[PlanEntry]>,
}

impl ErasedPlan {
    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DependencyDescriptor> {
        self.entries.iter().map(PlanEntry::descriptor)
    }

    pub(crate) fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ErasedPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedPlan")
            .field("owner", &self.owner)
            .field("fields", &self.descriptors().map(|d| d.field).collect::<Vec<_>>())
            .finish()
    }
}

/// Pick the definition satisfying `descriptor`:
/// the qualifier when given; else the candidate named like the field; else
/// the only candidate; else the lowest weight, then a single primary.
/// `Ok(None)` when nothing matches.
pub fn select_candidate(
    registry: &RegistrySnapshot,
    descriptor: &DependencyDescriptor,
    requester: Option<&str>,
) -> Result<Option<String>, ContainerError> {
    if let Some(name) = &descriptor.qualifier {
        return match registry.get(name) {
            Some(def) if def.provides(&descriptor.target) => Ok(Some(name.clone())),
            Some(_) => Err(ContainerError::TypeMismatch {
                name: name.clone(),
                type_name: descriptor.target.name().to_string(),
            }),
            None => Ok(None),
        };
    }

    let candidates = candidates_for(registry, &descriptor.target, requester);
    match candidates.len() {
        0 => Ok(None),
        1 => Ok(Some(candidates[0].0.clone())),
        _ => {
            let by_field = candidates.iter().find(|(name, ..)| name == descriptor.field);
            if let Some((name, ..)) = by_field {
                return Ok(Some(name.clone()));
            }

            let best = candidates[0].1;
            let top = candidates
                .iter()
                .filter(|(_, order, _)| *order == best)
                .collect::<Vec<_>>();
            if top.len() == 1 {
                return Ok(Some(top[0].0.clone()));
            }

            let primaries = top.iter().filter(|(_, _, primary)| *primary).collect::<Vec<_>>();
            if primaries.len() == 1 {
                return Ok(Some(primaries[0].0.clone()));
            }

            Err(ContainerError::Ambiguous {
                type_name: descriptor.target.name().to_string(),
                candidates: top.iter().map(|(name, ..)| name.clone()).collect(),
            })
        }
    }
}

/// Autowire candidates for `target` as (name, weight, primary), in
/// precedence order, excluding the requester itself
pub(crate) fn candidates_for(
    registry: &RegistrySnapshot,
    target: &TypeKey,
    requester: Option<&str>,
) -> Vec<(String, i32, bool)> {
    registry
        .find_by_type(target)
        .into_iter()
        .filter(|name| Some(name.as_str()) != requester)
        .filter_map(|name| registry.get(&name).map(|def| (name, def)))
        .filter(|(_, def)| def.is_autowire_candidate())
        .map(|(name, def)| (name, def.order(), def.is_primary()))
        .collect()
}

fn view_of<T: ?Sized + Send + Sync + 'static>(
    component: &Component,
) -> Result<Arc<T>, ContainerError> {
    component
        .view::<T>()
        .ok_or_else(|| ContainerError::TypeMismatch {
            name: component.name().to_string(),
            type_name: std::any::type_name::<T>().to_string(),
        })
}

/// Lookup handle given to factories and wiring: resolves dependencies on
/// behalf of the component being built
pub struct Resolver<'a> {
    context: &'a ApplicationContext,
    requester: Option<&'a str>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(context: &'a ApplicationContext, requester: Option<&'a str>) -> Self {
        Self { context, requester }
    }

    pub fn context(&self) -> &ApplicationContext {
        self.context
    }

    /// Name of the component being built
    pub fn requester(&self) -> Option<&str> {
        self.requester
    }

    pub fn environment(&self) -> &Environment {
        self.context.environment()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.context.environment().property(key)
    }

    /// Unique (or preferred) component providing `T`
    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        let descriptor = DependencyDescriptor::by_type::<T>("");
        self.resolve::<T>(&descriptor)?
            .ok_or_else(|| ContainerError::NoCandidate {
                type_name: std::any::type_name::<T>().to_string(),
            })
    }

    pub fn get_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, ContainerError> {
        let component = self.context.resolve_component(name, self.requester)?;
        view_of::<T>(&component)
    }

    pub fn try_get<T: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Option<Arc<T>>, ContainerError> {
        let mut descriptor = DependencyDescriptor::by_type::<T>("");
        descriptor.required = false;
        self.resolve::<T>(&descriptor)
    }

    pub fn get_all<T: ?Sized + Send + Sync + 'static>(
        &self,
    ) -> Result<Vec<Arc<T>>, ContainerError> {
        let mut descriptor = DependencyDescriptor::by_type::<T>("");
        descriptor.shape = Shape::Collection;
        self.resolve_all::<T>(&descriptor)
    }

    /// Deferred reference to the component providing `T`
    pub fn lazy<T: ?Sized + Send + Sync + 'static>(&self) -> LazyRef<T> {
        let mut descriptor = DependencyDescriptor::by_type::<T>("");
        descriptor.lazy = true;
        self.lazy_for::<T>(&descriptor)
    }

    /// The declaring configuration component of a factory-method product.
    /// While the configuration itself is being built on this thread, its
    /// partially wired instance is returned.
    pub fn declaring_component(&self, name: &str) -> Result<Component, ContainerError> {
        if let Some(early) = self.context.early_reference(name) {
            return Ok(early);
        }
        self.context.resolve_component(name, self.requester)
    }

    pub(crate) fn resolve<D: ?Sized + Send + Sync + 'static>(
        &self,
        descriptor: &DependencyDescriptor,
    ) -> Result<Option<Arc<D>>, ContainerError> {
        match self.context.resolve_descriptor(descriptor, self.requester)? {
            Some(component) => view_of::<D>(&component).map(Some),
            None if descriptor.required => Err(ContainerError::UnresolvedDependency {
                component: self.requester.unwrap_or("<anonymous>").to_string(),
                field: descriptor.field.to_string(),
                type_name: descriptor.target.name().to_string(),
            }),
            None => Ok(None),
        }
    }

    pub(crate) fn resolve_all<D: ?Sized + Send + Sync + 'static>(
        &self,
        descriptor: &DependencyDescriptor,
    ) -> Result<Vec<Arc<D>>, ContainerError> {
        let registry = self.context.registry_snapshot();
        let mut values = Vec::new();
        for (name, ..) in candidates_for(&registry, &descriptor.target, self.requester) {
            let component = self.context.resolve_component(&name, self.requester)?;
            values.push(view_of::<D>(&component)?);
        }
        Ok(values)
    }

    pub(crate) fn lazy_for<D: ?Sized + Send + Sync + 'static>(
        &self,
        descriptor: &DependencyDescriptor,
    ) -> LazyRef<D> {
        LazyRef::new(
            self.context.downgrade(),
            descriptor.clone(),
            self.requester.map(str::to_string),
        )
    }
}
