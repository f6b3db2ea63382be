//! Type keys and materialized component instances.
//!
//! A component is stored once as its raw value plus a table of *views*: for
//! every type the definition declares it provides (the concrete type, trait
//! objects, capability traits) the view table holds the `Arc<V>` to hand out.
//! Views are computed when the instance is materialized, so lookups by type
//! never downcast through the definition again.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::definition::Provision;
use crate::interception::Advised;

/// Type-erased shared value
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Runtime identity of a Rust type, concrete or `dyn Trait`
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Placeholder left in a context whose instance was moved elsewhere
#[derive(Debug)]
pub struct Sentinel;

/// Materialized component: raw value plus its provided views
#[derive(Clone)]
pub struct Component {
    name: Arc<str>,
    raw: Instance,
    views: Arc<HashMap<TypeKey, Instance>>,
    sentinel: bool,
    pub(crate) advised: Option<Arc<Advised>>,
}

impl Component {
    /// Build the view table for `raw` from the definition's provisions.
    /// Provisions whose cast does not apply to `raw` are skipped.
    pub fn materialize(name: &str, raw: Instance, provisions: &[Provision]) -> Self {
        let views = provisions
            .iter()
            .filter_map(|provision| provision.apply(&raw).map(|view| (provision.key(), view)))
            .collect::<HashMap<_, _>>();

        Self {
            name: Arc::from(name),
            raw,
            views: Arc::new(views),
            sentinel: false,
            advised: None,
        }
    }

    /// Empty placeholder: provides nothing and is skipped at teardown
    pub fn sentinel(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            raw: Arc::new(Sentinel),
            views: Arc::new(HashMap::new()),
            sentinel: true,
            advised: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &Instance {
        &self.raw
    }

    pub fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    pub fn provides(&self, key: &TypeKey) -> bool {
        self.views.contains_key(key)
    }

    pub fn provided_types(&self) -> Vec<TypeKey> {
        self.views.keys().copied().collect()
    }

    /// The view of this component as `T`, if it provides one
    pub fn view<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.views
            .get(&TypeKey::of::<T>())?
            .clone()
            .downcast::<Arc<T>>()
            .ok()
            .map(|view| Arc::clone(&*view))
    }

    /// Concrete value, bypassing views. Decorators never change it.
    pub fn downcast_raw<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.raw.clone().downcast::<T>().ok()
    }

    /// Copy of this component with the `T` view replaced
    pub fn with_view<T: ?Sized + Send + Sync + 'static>(&self, view: Arc<T>) -> Self {
        let mut views = (*self.views).clone();
        views.insert(TypeKey::of::<T>(), Arc::new(view) as Instance);
        Self {
            name: Arc::clone(&self.name),
            raw: Arc::clone(&self.raw),
            views: Arc::new(views),
            sentinel: self.sentinel,
            advised: self.advised.clone(),
        }
    }

    /// Same instance registered under another name
    pub fn renamed(&self, name: &str) -> Self {
        let mut copy = self.clone();
        copy.name = Arc::from(name);
        copy
    }

    /// Identity comparison of the underlying instance
    pub fn same_instance(&self, other: &Component) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("views", &self.views.keys().collect::<Vec<_>>())
            .field("sentinel", &self.sentinel)
            .field("advised", &self.advised.is_some())
            .finish()
    }
}
