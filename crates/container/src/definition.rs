//! Component definitions: the static description of how to build a component.
//!
//! A definition is immutable once registered. It carries the factory, the
//! scope, the set of types the instance provides, the precedence weight,
//! annotations (markers), registration conditions, the wiring plan and the
//! lifecycle callbacks. Hooks that need to change a definition register a
//! replacement under the same name.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::types::{Component, Instance, TypeKey};
use crate::wiring::{Autowire, ErasedPlan, Resolver, WiringPlan};

/// Lifetime of instances produced from a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One shared instance per context
    Singleton,
    /// A new instance on every request
    Prototype,
    /// Shared, but re-created by `refresh_scope()`
    Refresh,
}

impl Scope {
    /// Whether instances are cached by the context
    pub fn is_shared(&self) -> bool {
        matches!(self, Scope::Singleton | Scope::Refresh)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Singleton => write!(f, "singleton"),
            Scope::Prototype => write!(f, "prototype"),
            Scope::Refresh => write!(f, "refresh"),
        }
    }
}

/// Where a definition comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Declared directly by a module or the builder
    Direct,
    /// Produced by a factory method (or factory component) of `declaring`
    FactoryMethod { declaring: String },
}

/// Well-known marker kinds
pub mod markers {
    /// Component declaring factory-method products
    pub const CONFIGURATION: &str = "configuration";
    /// Configuration imported from the bootstrap context
    pub const BOOTSTRAP_CONFIGURATION: &str = "bootstrap-configuration";
    /// Provider of exception handlers for advised components
    pub const EXCEPTION_ADVICE: &str = "exception-advice";
    /// Component whose failures are routed through exception advice
    pub const ADVISED: &str = "advised";
    /// Component whose methods are validated even without declared constraints
    pub const VALIDATED: &str = "validated";
}

/// Annotation attached to a definition, with free-form attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    kind: String,
    attributes: BTreeMap<String, String>,
}

impl Marker {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

type ViewCast = Arc<dyn Fn(&Instance) -> Option<Instance> + Send + Sync>;

/// One type an instance is available as, with the cast producing that view
#[derive(Clone)]
pub struct Provision {
    key: TypeKey,
    cast: ViewCast,
}

impl Provision {
    /// The concrete type itself
    pub fn of_self<T: Send + Sync + 'static>() -> Self {
        Self {
            key: TypeKey::of::<T>(),
            cast: Arc::new(|raw: &Instance| {
                raw.clone()
                    .downcast::<T>()
                    .ok()
                    .map(|value| Arc::new(value) as Instance)
            }),
        }
    }

    /// `T` viewed as `V`, typically a trait object
    pub fn view<T, V>(cast: impl Fn(Arc<T>) -> Arc<V> + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        V: ?Sized + Send + Sync + 'static,
    {
        Self {
            key: TypeKey::of::<V>(),
            cast: Arc::new(move |raw: &Instance| {
                raw.clone()
                    .downcast::<T>()
                    .ok()
                    .map(|value| Arc::new(cast(value)) as Instance)
            }),
        }
    }

    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub(crate) fn apply(&self, raw: &Instance) -> Option<Instance> {
        (self.cast)(raw)
    }
}

impl fmt::Debug for Provision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provision({})", self.key)
    }
}

pub(crate) type InstanceFactory =
    Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync>;
pub(crate) type Callback = Arc<dyn Fn(&Component) -> anyhow::Result<()> + Send + Sync>;
type ProduceFn = Arc<dyn Fn(&Component) -> anyhow::Result<Instance> + Send + Sync>;

/// Description of the component a factory component produces
pub struct ProductSpec<P> {
    name: String,
    provisions: Vec<Provision>,
    scope: Scope,
    produce: ProduceFn,
    _product: PhantomData<fn() -> P>,
}

impl<P: Send + Sync + 'static> ProductSpec<P> {
    /// `produce` is called with the factory component whenever a product
    /// instance is needed
    pub fn new<F, G>(name: impl Into<String>, produce: G) -> Self
    where
        F: Send + Sync + 'static,
        G: Fn(&F) -> anyhow::Result<P> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            provisions: vec![Provision::of_self::<P>()],
            scope: Scope::Singleton,
            produce: Arc::new(move |factory: &Component| {
                let owner = factory.downcast_raw::<F>().ok_or_else(|| {
                    anyhow!(
                        "component '{}' is not a {}",
                        factory.name(),
                        std::any::type_name::<F>()
                    )
                })?;
                Ok(Arc::new(produce(&owner)?) as Instance)
            }),
            _product: PhantomData,
        }
    }

    pub fn provides<V: ?Sized + Send + Sync + 'static>(
        mut self,
        cast: impl Fn(Arc<P>) -> Arc<V> + Send + Sync + 'static,
    ) -> Self {
        self.provisions.push(Provision::view::<P, V>(cast));
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    fn erase(self) -> ProductInfo {
        ProductInfo {
            name: self.name,
            type_key: TypeKey::of::<P>(),
            provisions: self.provisions,
            scope: self.scope,
            produce: self.produce,
        }
    }
}

/// Type-erased [`ProductSpec`] held by the factory component's definition
#[derive(Clone)]
pub struct ProductInfo {
    name: String,
    type_key: TypeKey,
    provisions: Vec<Provision>,
    scope: Scope,
    produce: ProduceFn,
}

impl ProductInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// Static description of a component
#[derive(Clone)]
pub struct ComponentDefinition {
    name: String,
    type_key: TypeKey,
    provisions: Vec<Provision>,
    scope: Scope,
    origin: Origin,
    factory: InstanceFactory,
    product: Option<ProductInfo>,
    order: i32,
    primary: bool,
    lazy_init: Option<bool>,
    autowire_candidate: bool,
    markers: Vec<Marker>,
    conditions: Vec<Condition>,
    wiring: Option<ErasedPlan>,
    init: Option<Callback>,
    destroy: Option<Callback>,
}

impl ComponentDefinition {
    pub fn builder<T: Send + Sync + 'static>(name: impl Into<String>) -> DefinitionBuilder<T> {
        DefinitionBuilder::new(name.into())
    }

    /// Definition for an instance built elsewhere; every request returns it
    pub fn of_instance<T: Send + Sync + 'static>(
        name: impl Into<String>,
        value: Arc<T>,
    ) -> DefinitionBuilder<T> {
        DefinitionBuilder::new(name.into()).instance(value)
    }

    /// Factory-method product of the configuration component `declaring`.
    /// `produce` receives the configuration instance, which may still be
    /// wiring its own fields when the product is requested from there.
    pub fn produced_by<C, T, F>(
        name: impl Into<String>,
        declaring: impl Into<String>,
        produce: F,
    ) -> DefinitionBuilder<T>
    where
        C: Send + Sync + 'static,
        T: Send + Sync + 'static,
        F: Fn(&C, &Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let declaring = declaring.into();
        let owner_name = declaring.clone();
        let mut builder = DefinitionBuilder::new(name.into());
        builder.def.origin = Origin::FactoryMethod { declaring };
        builder.def.factory = instance_factory(move |resolver| {
            let owner = resolver.declaring_component(&owner_name)?;
            let config = owner.downcast_raw::<C>().ok_or_else(|| {
                anyhow!(
                    "declaring component '{}' is not a {}",
                    owner_name,
                    std::any::type_name::<C>()
                )
            })?;
            Ok(Arc::new(produce(&config, resolver)?) as Instance)
        });
        builder.has_factory = true;
        builder
    }

    /// Definition of the product of a factory component
    pub fn product_of(factory: &ComponentDefinition) -> Option<ComponentDefinition> {
        let product = factory.product.clone()?;
        let factory_name = factory.name.clone();
        let produce = Arc::clone(&product.produce);

        Some(ComponentDefinition {
            name: product.name.clone(),
            type_key: product.type_key,
            provisions: product.provisions.clone(),
            scope: product.scope,
            origin: Origin::FactoryMethod {
                declaring: factory_name.clone(),
            },
            factory: instance_factory(move |resolver| {
                let owner = resolver.declaring_component(&factory_name)?;
                produce(&owner)
            }),
            product: None,
            order: factory.order,
            primary: false,
            lazy_init: factory.lazy_init,
            autowire_candidate: true,
            markers: Vec::new(),
            conditions: Vec::new(),
            wiring: None,
            init: None,
            destroy: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Name of the configuration component that produces this one
    pub fn declaring(&self) -> Option<&str> {
        match &self.origin {
            Origin::FactoryMethod { declaring } => Some(declaring),
            Origin::Direct => None,
        }
    }

    pub fn provisions(&self) -> &[Provision] {
        &self.provisions
    }

    pub fn provides(&self, key: &TypeKey) -> bool {
        self.provisions.iter().any(|p| p.key() == *key)
    }

    /// Precedence weight: lower wins
    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Explicit lazy flag; `None` follows the context default
    pub fn lazy_init(&self) -> Option<bool> {
        self.lazy_init
    }

    pub fn is_autowire_candidate(&self) -> bool {
        self.autowire_candidate
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn marker(&self, kind: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.kind() == kind)
    }

    pub fn has_marker(&self, kind: &str) -> bool {
        self.marker(kind).is_some()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_factory_of_components(&self) -> bool {
        self.product.is_some()
    }

    pub fn product(&self) -> Option<&ProductInfo> {
        self.product.as_ref()
    }

    pub fn wiring_plan(&self) -> Option<&ErasedPlan> {
        self.wiring.as_ref()
    }

    pub(crate) fn factory(&self) -> &InstanceFactory {
        &self.factory
    }

    pub(crate) fn init_callback(&self) -> Option<&Callback> {
        self.init.as_ref()
    }

    pub(crate) fn destroy_callback(&self) -> Option<&Callback> {
        self.destroy.as_ref()
    }

    pub fn has_destroy_callback(&self) -> bool {
        self.destroy.is_some()
    }

    /// Copy with an additional marker
    pub fn with_marker(&self, marker: Marker) -> Self {
        let mut copy = self.clone();
        copy.markers.push(marker);
        copy
    }

    /// Copy with another scope
    pub fn with_scope(&self, scope: Scope) -> Self {
        let mut copy = self.clone();
        copy.scope = scope;
        copy
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("type", &self.type_key)
            .field("scope", &self.scope)
            .field("origin", &self.origin)
            .field("order", &self.order)
            .field("primary", &self.primary)
            .field("markers", &self.markers)
            .field("conditions", &self.conditions.len())
            .field("wired", &self.wiring.is_some())
            .finish()
    }
}

/// Typed builder for [`ComponentDefinition`]
pub struct DefinitionBuilder<T> {
    def: ComponentDefinition,
    has_factory: bool,
    _type: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> DefinitionBuilder<T> {
    fn new(name: String) -> Self {
        let missing = name.clone();
        Self {
            def: ComponentDefinition {
                name,
                type_key: TypeKey::of::<T>(),
                provisions: vec![Provision::of_self::<T>()],
                scope: Scope::Singleton,
                origin: Origin::Direct,
                factory: instance_factory(move |_| {
                    Err(anyhow!("definition '{}' has no factory", missing))
                }),
                product: None,
                order: 0,
                primary: false,
                lazy_init: None,
                autowire_candidate: true,
                markers: Vec::new(),
                conditions: Vec::new(),
                wiring: None,
                init: None,
                destroy: None,
            },
            has_factory: false,
            _type: PhantomData,
        }
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.def.factory =
            instance_factory(move |resolver| Ok(Arc::new(factory(resolver)?) as Instance));
        self.has_factory = true;
        self
    }

    /// Every request returns `value`
    pub fn instance(mut self, value: Arc<T>) -> Self {
        self.def.factory =
            instance_factory(move |_| Ok(Arc::clone(&value) as Instance));
        self.has_factory = true;
        self
    }

    /// Also provide the instance as `V`
    pub fn provides<V: ?Sized + Send + Sync + 'static>(
        mut self,
        cast: impl Fn(Arc<T>) -> Arc<V> + Send + Sync + 'static,
    ) -> Self {
        self.def.provisions.push(Provision::view::<T, V>(cast));
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.def.scope = scope;
        self
    }

    pub fn prototype(self) -> Self {
        self.scope(Scope::Prototype)
    }

    pub fn refresh_scoped(self) -> Self {
        self.scope(Scope::Refresh)
    }

    pub fn order(mut self, order: i32) -> Self {
        self.def.order = order;
        self
    }

    pub fn primary(mut self) -> Self {
        self.def.primary = true;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.def.lazy_init = Some(lazy);
        self
    }

    /// Exclude from by-type candidate selection; by-name lookups still work
    pub fn not_autowire_candidate(mut self) -> Self {
        self.def.autowire_candidate = false;
        self
    }

    pub fn marker(mut self, marker: Marker) -> Self {
        self.def.markers.push(marker);
        self
    }

    pub fn marked(self, kind: &str) -> Self {
        self.marker(Marker::new(kind))
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.def.conditions.push(condition);
        self
    }

    pub fn wired(mut self, plan: WiringPlan<T>) -> Self {
        self.def.wiring = Some(plan.erase());
        self
    }

    pub fn on_init<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.def.init = Some(typed_callback(callback));
        self
    }

    pub fn on_destroy<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.def.destroy = Some(typed_callback(callback));
        self
    }

    /// Makes this a factory of components producing `product`
    pub fn produces<P: Send + Sync + 'static>(mut self, product: ProductSpec<P>) -> Self {
        self.def.product = Some(product.erase());
        self
    }

    pub fn build(self) -> ComponentDefinition {
        if !self.has_factory {
            tracing::warn!("Definition '{}' was built without a factory", self.def.name);
        }
        self.def
    }
}

impl<T: Autowire> DefinitionBuilder<T> {
    /// Use the wiring plan `T` declares for itself
    pub fn autowired(self) -> Self {
        self.wired(T::wiring_plan())
    }
}

fn instance_factory<F>(factory: F) -> InstanceFactory
where
    F: Fn(&Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync + 'static,
{
    Arc::new(factory)
}

fn typed_callback<T, F>(callback: F) -> Callback
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |component: &Component| {
        let value = component.downcast_raw::<T>().ok_or_else(|| {
            anyhow!(
                "component '{}' is not a {}",
                component.name(),
                std::any::type_name::<T>()
            )
        })?;
        callback(&value)
    })
}
