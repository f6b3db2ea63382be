//! Application context: owns the registry, the instance cache, hooks and
//! events, and drives the refresh sequence
//!
//! `Created -> Loading -> PostProcessed -> Instantiating -> Wired -> Ready ->
//! Closing -> Closed`, strictly forward. `refresh()` runs once; a failed
//! refresh closes the context and reports the first cause.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use common::OperationTimer;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::Bootstrap;
use crate::condition::ConditionEvaluator;
use crate::config::ContainerConfig;
use crate::definition::{ComponentDefinition, Scope};
use crate::dependency_graph::DependencyGraph;
use crate::environment::Environment;
use crate::errors::{ContainerError, ContainerResult, TeardownFailure};
use crate::events::{
    ApplicationEvent, ApplicationListener, ContextClosed, ContextRefreshed, Delivery,
    EventMulticaster, ListenerId, RefreshScopeRefreshed,
};
use crate::hooks::{AfterRefresh, ContextAware, HookRegistry, PostProcessor};
use crate::lifetime_manager::LifetimeManager;
use crate::processors::{
    AutowiredProcessor, ExceptionAdviceProcessor, FactoryComponentProcessor,
    InterceptionProcessor, InterceptorBinding, MethodValidationProcessor,
};
use crate::registry::{DefinitionRegistry, RegistrySnapshot};
use crate::types::{Component, TypeKey};
use crate::wiring::{select_candidate, DependencyDescriptor, Resolver, Shape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContextState {
    Created,
    Loading,
    PostProcessed,
    Instantiating,
    Wired,
    Ready,
    Closing,
    Closed,
}

impl ContextState {
    fn rank(self) -> u8 {
        self as u8
    }

    /// Components may be requested in this state
    pub fn is_active(self) -> bool {
        !matches!(
            self,
            ContextState::Created | ContextState::Closing | ContextState::Closed
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Created => "CREATED",
            ContextState::Loading => "LOADING",
            ContextState::PostProcessed => "POST_PROCESSED",
            ContextState::Instantiating => "INSTANTIATING",
            ContextState::Wired => "WIRED",
            ContextState::Ready => "READY",
            ContextState::Closing => "CLOSING",
            ContextState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Source of definitions, evaluated against the environment at load time
pub trait ComponentModule: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates in declaration order
    fn definitions(&self, environment: &Environment) -> Vec<ComponentDefinition>;
}

enum Candidates {
    Definition(ComponentDefinition),
    Module(Arc<dyn ComponentModule>),
}

/// Counters of one context
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStats {
    pub name: String,
    pub state: ContextState,
    pub definitions: usize,
    pub cached_singletons: usize,
    pub singleton_creations: u64,
    pub prototype_creations: u64,
    pub cache_hits: u64,
    pub replacements: u64,
    pub hooks: usize,
    pub listeners: usize,
    pub dependency_edges: usize,
}

thread_local! {
    /// Components under construction on this thread, outermost first
    static CREATION_STACK: RefCell<Vec<(Uuid, String)>> = RefCell::new(Vec::new());
}

/// Marks `name` as under construction on the current thread until dropped
struct CreationFrame;

impl CreationFrame {
    fn enter(context: Uuid, name: &str) -> ContainerResult<Self> {
        CREATION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(start) = stack
                .iter()
                .position(|(id, entry)| *id == context && entry == name)
            {
                let mut chain = stack[start..]
                    .iter()
                    .filter(|(id, _)| *id == context)
                    .map(|(_, entry)| entry.clone())
                    .collect::<Vec<_>>();
                chain.push(name.to_string());
                return Err(ContainerError::Circular { chain });
            }
            stack.push((context, name.to_string()));
            Ok(CreationFrame)
        })
    }

    fn contains(context: Uuid, name: &str) -> bool {
        CREATION_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|(id, entry)| *id == context && entry == name)
        })
    }
}

impl Drop for CreationFrame {
    fn drop(&mut self) {
        CREATION_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct ContextInner {
    id: Uuid,
    name: String,
    primary_source: Option<String>,
    config: ContainerConfig,
    environment: Environment,
    registry: DefinitionRegistry,
    lifetimes: LifetimeManager,
    graph: DependencyGraph,
    hooks: HookRegistry,
    events: EventMulticaster,
    interception: Arc<InterceptionProcessor>,
    state: RwLock<ContextState>,
    refreshed: AtomicBool,
    candidates: Mutex<Vec<Candidates>>,
    bootstraps: Vec<Arc<dyn Bootstrap>>,
    /// Listener components already subscribed
    subscribed: Mutex<HashSet<String>>,
}

/// Handle to a context; clones share it
#[derive(Clone)]
pub struct ApplicationContext {
    inner: Arc<ContextInner>,
}

/// Non-owning handle, held by deferred references
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<ApplicationContext> {
        self.inner.upgrade().map(|inner| ApplicationContext { inner })
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakContext")
    }
}

impl ApplicationContext {
    pub fn builder() -> ApplicationContextBuilder {
        ApplicationContextBuilder::new()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity of the entry point this context was built for
    pub fn primary_source(&self) -> Option<&str> {
        self.inner.primary_source.as_deref()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    pub fn state(&self) -> ContextState {
        *self.inner.state.read()
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Load, post-process, instantiate and wire, then publish
    /// [`ContextRefreshed`]. Runs once per context.
    pub fn refresh(&self) -> ContainerResult<()> {
        if self.inner.refreshed.swap(true, Ordering::SeqCst) {
            return Err(ContainerError::illegal_state(
                ContextState::Created,
                self.state(),
            ));
        }

        let mut timer = OperationTimer::new("context_refresh");
        timer.add_field("context", &self.inner.name);
        let result = self.run_refresh();
        match &result {
            Ok(()) => {
                timer.add_field("definitions", self.inner.registry.len());
                timer.finish();
            }
            Err(e) => {
                error!(context = %self.inner.name, "Refresh failed: {}", e);
                timer.finish_with_result(Err::<(), _>(e));
                if let Err(close_error) = self.close() {
                    warn!(
                        context = %self.inner.name,
                        "Teardown after failed refresh reported: {}", close_error
                    );
                }
            }
        }
        result
    }

    fn run_refresh(&self) -> ContainerResult<()> {
        self.transition(ContextState::Loading)?;
        for bootstrap in &self.inner.bootstraps {
            let imported = bootstrap.import(self)?;
            if !imported.is_empty() {
                info!(
                    context = %self.inner.name,
                    "Imported {:?} from bootstrap '{}'",
                    imported,
                    bootstrap.name()
                );
            }
        }
        self.load_candidates()?;

        self.register_hook_components()?;
        for hook in self.inner.hooks.snapshot() {
            if let Some(rewriter) = hook.as_definition_rewriter() {
                debug!("Running definition rewriter '{}'", hook.name());
                rewriter.rewrite(&self.inner.registry, self)?;
            }
        }
        self.transition(ContextState::PostProcessed)?;

        self.transition(ContextState::Instantiating)?;
        for definition in self.inner.registry.snapshot().definitions() {
            if definition.scope().is_shared() && !self.is_lazy(&definition) {
                self.component(definition.name())?;
            }
        }
        self.transition(ContextState::Wired)?;

        self.subscribe_listener_components()?;
        for name in self.inner.registry.find_by_type(&TypeKey::of::<dyn AfterRefresh>()) {
            let component = self.component(&name)?;
            if let Some(callback) = component.view::<dyn AfterRefresh>() {
                callback
                    .after_refresh(self)
                    .map_err(|e| ContainerError::creation(name.as_str(), &e))?;
            }
        }

        self.transition(ContextState::Ready)?;
        self.publish(ContextRefreshed::event(&self.inner.name))
    }

    fn load_candidates(&self) -> ContainerResult<()> {
        let sources = std::mem::take(&mut *self.inner.candidates.lock());
        let evaluator = ConditionEvaluator::new(&self.inner.environment);
        let mut admitted = 0usize;
        let mut rejected = 0usize;

        for source in sources {
            let definitions = match source {
                Candidates::Definition(definition) => vec![definition],
                Candidates::Module(module) => {
                    debug!("Loading module '{}'", module.name());
                    module.definitions(&self.inner.environment)
                }
            };
            for definition in definitions {
                // each candidate observes those admitted before it
                let snapshot = self.inner.registry.snapshot();
                if evaluator.admits(&definition, &snapshot) {
                    // an imported instance under the same name goes with its definition
                    self.register_definition(definition)?;
                    admitted += 1;
                } else {
                    rejected += 1;
                }
            }
        }
        info!(
            context = %self.inner.name,
            "Loaded {} definition(s), {} rejected by conditions", admitted, rejected
        );
        Ok(())
    }

    fn register_hook_components(&self) -> ContainerResult<()> {
        for name in self
            .inner
            .registry
            .find_by_type(&TypeKey::of::<dyn PostProcessor>())
        {
            let component = self.component(&name)?;
            if let Some(hook) = component.view::<dyn PostProcessor>() {
                self.register_hook_component(&name, hook)?;
            }
        }
        Ok(())
    }

    fn subscribe_listener_components(&self) -> ContainerResult<()> {
        for name in self
            .inner
            .registry
            .find_by_type(&TypeKey::of::<dyn ApplicationListener>())
        {
            if self.inner.subscribed.lock().contains(&name) {
                continue;
            }
            let definition = self.inner.registry.get(&name)?;
            if !definition.scope().is_shared() {
                warn!(component = %name, "Listener components must be shared; skipping");
                continue;
            }
            let component = self.component(&name)?;
            if let Some(listener) = component.view::<dyn ApplicationListener>() {
                self.inner.events.add_listener(listener);
                self.inner.subscribed.lock().insert(name);
            }
        }
        Ok(())
    }

    fn is_lazy(&self, definition: &ComponentDefinition) -> bool {
        definition
            .lazy_init()
            .unwrap_or(self.inner.config.lazy_init)
    }

    fn transition(&self, next: ContextState) -> ContainerResult<()> {
        let mut state = self.inner.state.write();
        if next.rank() <= state.rank() {
            return Err(ContainerError::illegal_state(
                format!("a state before {}", next),
                *state,
            ));
        }
        debug!(context = %self.inner.name, "{} -> {}", *state, next);
        *state = next;
        Ok(())
    }

    fn ensure_active(&self) -> ContainerResult<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(ContainerError::illegal_state("an active context", state))
        }
    }

    /// Instance for `name`: cached for shared scopes, new for prototypes
    fn component(&self, name: &str) -> ContainerResult<Component> {
        self.ensure_active()?;
        let definition = self.inner.registry.get(name)?;
        if definition.scope().is_shared() {
            self.inner
                .lifetimes
                .get_or_create(name, || self.create_component(&definition))
        } else {
            let component = self.create_component(&definition)?;
            self.inner.lifetimes.record_prototype();
            Ok(component)
        }
    }

    fn create_component(&self, definition: &ComponentDefinition) -> ContainerResult<Component> {
        let name = definition.name();
        let _frame = CreationFrame::enter(self.inner.id, name)?;
        let hooks = self.inner.hooks.snapshot();

        for hook in &hooks {
            if let Some(aware) = hook.as_instantiation_aware() {
                if let Some(substitute) = aware.before_instantiation(definition, self)? {
                    debug!(component = name, "Instance supplied by hook '{}'", hook.name());
                    return self.decorate(substitute.renamed(name), definition, &hooks);
                }
            }
        }

        let resolver = Resolver::new(self, Some(name));
        let raw = (definition.factory())(&resolver).map_err(|e| creation_failure(name, e))?;
        let component = Component::materialize(name, raw, definition.provisions());

        self.inner.lifetimes.publish_early(&component);
        let result = self.initialize(component, definition, &hooks);
        self.inner.lifetimes.retract_early(name);
        result
    }

    fn initialize(
        &self,
        component: Component,
        definition: &ComponentDefinition,
        hooks: &[Arc<dyn PostProcessor>],
    ) -> ContainerResult<Component> {
        let name = definition.name();
        let resolver = Resolver::new(self, Some(name));
        for hook in hooks {
            if let Some(wiring) = hook.as_wiring() {
                wiring.wire(&component, definition, &resolver)?;
            }
        }

        if let Some(aware) = component.view::<dyn ContextAware>() {
            aware
                .set_context(self)
                .map_err(|e| ContainerError::creation(name, &e))?;
        }
        if let Some(init) = definition.init_callback() {
            init(&component).map_err(|e| creation_failure(name, e))?;
        }

        self.decorate(component, definition, hooks)
    }

    fn decorate(
        &self,
        mut component: Component,
        definition: &ComponentDefinition,
        hooks: &[Arc<dyn PostProcessor>],
    ) -> ContainerResult<Component> {
        for hook in hooks {
            if let Some(decorator) = hook.as_decorator() {
                if let Some(replacement) = decorator.decorate(&component, definition, self)? {
                    debug!(
                        component = definition.name(),
                        "Decorated by '{}'",
                        hook.name()
                    );
                    component = replacement;
                }
            }
        }
        Ok(component)
    }

    /// Resolve `name` on behalf of `requester`, recording the edge
    pub(crate) fn resolve_component(
        &self,
        name: &str,
        requester: Option<&str>,
    ) -> ContainerResult<Component> {
        if let Some(requester) = requester {
            self.inner.graph.add_dependency(requester, name);
        }
        self.component(name)
    }

    pub(crate) fn resolve_descriptor(
        &self,
        descriptor: &DependencyDescriptor,
        requester: Option<&str>,
    ) -> ContainerResult<Option<Component>> {
        let snapshot = self.inner.registry.snapshot();
        match select_candidate(&snapshot, descriptor, requester)? {
            Some(name) => self.resolve_component(&name, requester).map(Some),
            None => Ok(None),
        }
    }

    /// Partially built instance of `name`, only while it is being built on
    /// the calling thread
    pub(crate) fn early_reference(&self, name: &str) -> Option<Component> {
        if CreationFrame::contains(self.inner.id, name) {
            self.inner.lifetimes.early(name)
        } else {
            None
        }
    }

    /// Whether `name` is under construction on the calling thread
    pub fn is_in_creation(&self, name: &str) -> bool {
        CreationFrame::contains(self.inner.id, name)
    }

    pub fn get<T: ?Sized + Send + Sync + 'static>(&self) -> ContainerResult<Arc<T>> {
        let descriptor = DependencyDescriptor::by_type::<T>("");
        let component = self
            .resolve_descriptor(&descriptor, None)?
            .ok_or_else(|| ContainerError::NoCandidate {
                type_name: std::any::type_name::<T>().to_string(),
            })?;
        view_as::<T>(&component)
    }

    pub fn try_get<T: ?Sized + Send + Sync + 'static>(&self) -> ContainerResult<Option<Arc<T>>> {
        let descriptor = DependencyDescriptor::by_type::<T>("");
        match self.resolve_descriptor(&descriptor, None)? {
            Some(component) => view_as::<T>(&component).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_named<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> ContainerResult<Arc<T>> {
        let component = self.component(name)?;
        view_as::<T>(&component)
    }

    /// Every autowire candidate of `T` in precedence order
    pub fn get_all<T: ?Sized + Send + Sync + 'static>(&self) -> ContainerResult<Vec<Arc<T>>> {
        let mut descriptor = DependencyDescriptor::by_type::<T>("");
        descriptor.shape = Shape::Collection;
        let resolver = Resolver::new(self, None);
        resolver.resolve_all::<T>(&descriptor)
    }

    pub fn get_component(&self, name: &str) -> ContainerResult<Component> {
        self.component(name)
    }

    pub fn definition(&self, name: &str) -> ContainerResult<Arc<ComponentDefinition>> {
        self.inner.registry.get(name)
    }

    pub fn contains_definition(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    pub fn find_definitions_by_marker(&self, kind: &str) -> Vec<String> {
        self.inner.registry.find_by_marker(kind)
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        self.inner.registry.snapshot()
    }

    /// Register (or replace) a definition. A replaced definition's cached
    /// instance is dropped from the cache without teardown.
    pub fn register_definition(&self, definition: ComponentDefinition) -> ContainerResult<()> {
        let state = self.state();
        if matches!(state, ContextState::Closing | ContextState::Closed) {
            return Err(ContainerError::illegal_state("an open context", state));
        }
        let name = definition.name().to_string();
        if self.inner.registry.register(definition)?.is_some()
            && self.inner.lifetimes.remove(&name).is_some()
        {
            debug!(component = %name, "Cached instance dropped with its replaced definition");
        }
        Ok(())
    }

    /// Install `component` as the shared instance of `name`
    pub fn replace_instance(&self, name: &str, component: Component) -> Option<Component> {
        debug!(component = name, context = %self.inner.name, "Instance replaced");
        self.inner.lifetimes.replace(name, component.renamed(name))
    }

    pub fn register_hook(&self, hook: Arc<dyn PostProcessor>) -> ContainerResult<()> {
        self.inner.hooks.register(Arc::clone(&hook), None);
        hook.on_registered(self)
    }

    /// Register the hook view of component `name`; once per name
    pub fn register_hook_component(
        &self,
        name: &str,
        hook: Arc<dyn PostProcessor>,
    ) -> ContainerResult<()> {
        if self.inner.hooks.register(Arc::clone(&hook), Some(name)) {
            hook.on_registered(self)?;
        }
        Ok(())
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.inner.hooks.names()
    }

    /// Applies to components created after this call
    pub fn register_interceptor(&self, binding: InterceptorBinding) {
        self.inner.interception.bind(binding);
    }

    pub fn publish(&self, event: ApplicationEvent) -> ContainerResult<()> {
        self.inner.events.publish(event)
    }

    pub fn subscribe<E, F>(&self, name: &str, delivery: Delivery, listener: F) -> ListenerId
    where
        E: ?Sized + Send + Sync + 'static,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe::<E, F>(name, delivery, listener)
    }

    pub fn add_listener(&self, listener: Arc<dyn ApplicationListener>) -> ListenerId {
        self.inner.events.add_listener(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Wait for in-flight asynchronous deliveries
    pub fn drain_events(&self, timeout: Duration) -> bool {
        self.inner.events.drain(timeout)
    }

    /// Re-create every refresh-scoped singleton; previous instances are
    /// destroyed. Returns the refreshed names.
    pub fn refresh_scope(&self) -> ContainerResult<Vec<String>> {
        let state = self.state();
        if state != ContextState::Ready {
            return Err(ContainerError::illegal_state(ContextState::Ready, state));
        }

        let mut refreshed = Vec::new();
        for definition in self.inner.registry.snapshot().definitions() {
            if definition.scope() != Scope::Refresh {
                continue;
            }
            let name = definition.name();
            if let Some(previous) = self.inner.lifetimes.remove(name) {
                self.destroy(&previous, &definition)?;
            }
            if !self.is_lazy(&definition) {
                self.component(name)?;
            }
            refreshed.push(name.to_string());
        }

        info!(context = %self.inner.name, "Refreshed scope: {:?}", refreshed);
        self.publish(RefreshScopeRefreshed::event(
            &self.inner.name,
            refreshed.clone(),
        ))?;
        Ok(refreshed)
    }

    fn destroy(
        &self,
        component: &Component,
        definition: &ComponentDefinition,
    ) -> ContainerResult<()> {
        if component.is_sentinel() {
            return Ok(());
        }
        if let Some(destroy) = definition.destroy_callback() {
            destroy(component).map_err(|e| ContainerError::creation(definition.name(), &e))?;
            debug!(component = definition.name(), "Destroyed");
        }
        Ok(())
    }

    /// Publish [`ContextClosed`], drain asynchronous listeners, then
    /// destroy singletons, dependents first. Teardown failures are collected
    /// and reported together. Closing twice is a no-op.
    pub fn close(&self) -> ContainerResult<()> {
        let previous = {
            let mut state = self.inner.state.write();
            if matches!(*state, ContextState::Closing | ContextState::Closed) {
                return Ok(());
            }
            std::mem::replace(&mut *state, ContextState::Closing)
        };
        info!(context = %self.inner.name, "Closing context (was {})", previous);

        if previous == ContextState::Ready {
            if let Err(e) = self.publish(ContextClosed::event(&self.inner.name)) {
                warn!(context = %self.inner.name, "Close listener failed: {}", e);
            }
        }
        self.inner
            .events
            .shutdown(self.inner.config.shutdown_drain_timeout());

        let live = self.inner.lifetimes.creation_order();
        let order = self.inner.graph.teardown_order(&live);
        let mut failures = Vec::new();
        for name in order {
            let Some(component) = self.inner.lifetimes.remove(&name) else {
                continue;
            };
            if component.is_sentinel() {
                debug!(component = %name, "Skipping sentinel");
                continue;
            }
            let Some(definition) = self.inner.registry.snapshot().get(&name) else {
                continue;
            };
            if let Some(destroy) = definition.destroy_callback() {
                match destroy(&component) {
                    Ok(()) => debug!(component = %name, "Destroyed"),
                    Err(e) => {
                        error!(component = %name, "Teardown failed: {:#}", e);
                        failures.push(TeardownFailure {
                            component: name.clone(),
                            reason: format!("{:#}", e),
                        });
                    }
                }
            }
        }
        self.inner.graph.clear();

        *self.inner.state.write() = ContextState::Closed;
        info!(context = %self.inner.name, "Context closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ContainerError::Teardown { failures })
        }
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.inner.graph.dependencies_of(name)
    }

    pub fn dependency_cycles(&self) -> Vec<Vec<String>> {
        self.inner.graph.find_cycles()
    }

    pub fn stats(&self) -> ContainerStats {
        let cache = self.inner.lifetimes.stats();
        ContainerStats {
            name: self.inner.name.clone(),
            state: self.state(),
            definitions: self.inner.registry.len(),
            cached_singletons: self.inner.lifetimes.len(),
            singleton_creations: cache.singleton_creations,
            prototype_creations: cache.prototype_creations,
            cache_hits: cache.singleton_hits,
            replacements: cache.replacements,
            hooks: self.inner.hooks.len(),
            listeners: self.inner.events.listener_count(),
            dependency_edges: self.inner.graph.dependency_count(),
        }
    }
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("definitions", &self.inner.registry.len())
            .finish()
    }
}

fn view_as<T: ?Sized + Send + Sync + 'static>(component: &Component) -> ContainerResult<Arc<T>> {
    component
        .view::<T>()
        .ok_or_else(|| ContainerError::TypeMismatch {
            name: component.name().to_string(),
            type_name: std::any::type_name::<T>().to_string(),
        })
}

/// Container errors raised inside a factory keep their kind
fn creation_failure(name: &str, error: anyhow::Error) -> ContainerError {
    match error.downcast::<ContainerError>() {
        Ok(inner) => inner,
        Err(other) => ContainerError::creation(name, &other),
    }
}

pub struct ApplicationContextBuilder {
    config: ContainerConfig,
    primary_source: Option<String>,
    candidates: Vec<Candidates>,
    hooks: Vec<Arc<dyn PostProcessor>>,
    listeners: Vec<Arc<dyn ApplicationListener>>,
    bindings: Vec<InterceptorBinding>,
    bootstraps: Vec<Arc<dyn Bootstrap>>,
}

impl ApplicationContextBuilder {
    pub fn new() -> Self {
        Self {
            config: ContainerConfig::default(),
            primary_source: None,
            candidates: Vec::new(),
            hooks: Vec::new(),
            listeners: Vec::new(),
            bindings: Vec::new(),
            bootstraps: Vec::new(),
        }
    }

    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    pub fn primary_source(mut self, source: impl Into<String>) -> Self {
        self.primary_source = Some(source.into());
        self
    }

    /// Candidate definition; conditions are evaluated in declaration order
    pub fn component(mut self, definition: ComponentDefinition) -> Self {
        self.candidates.push(Candidates::Definition(definition));
        self
    }

    pub fn module(mut self, module: impl ComponentModule + 'static) -> Self {
        self.candidates.push(Candidates::Module(Arc::new(module)));
        self
    }

    pub fn hook(mut self, hook: Arc<dyn PostProcessor>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ApplicationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn interceptor(mut self, binding: InterceptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstraps.push(bootstrap);
        self
    }

    pub fn build(self) -> ContainerResult<ApplicationContext> {
        self.config
            .validate()
            .map_err(|e| ContainerError::config(format!("{:#}", e)))?;

        let interception = Arc::new(InterceptionProcessor::new());
        for binding in self.bindings {
            interception.bind(binding);
        }

        let name = self.config.name.clone();
        let context = ApplicationContext {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                name: name.clone(),
                primary_source: self.primary_source,
                environment: Environment::from_config(&self.config),
                registry: DefinitionRegistry::new(self.config.allow_definition_overriding),
                lifetimes: LifetimeManager::new(),
                graph: DependencyGraph::new(),
                hooks: HookRegistry::new(),
                events: EventMulticaster::new(name.clone(), self.config.async_workers),
                interception: Arc::clone(&interception),
                state: RwLock::new(ContextState::Created),
                refreshed: AtomicBool::new(false),
                candidates: Mutex::new(self.candidates),
                bootstraps: self.bootstraps,
                subscribed: Mutex::new(HashSet::new()),
                config: self.config,
            }),
        };

        let built_in: Vec<Arc<dyn PostProcessor>> = vec![
            Arc::new(AutowiredProcessor::new()),
            Arc::new(FactoryComponentProcessor::new()),
            Arc::new(MethodValidationProcessor::new()),
            Arc::new(ExceptionAdviceProcessor::new()),
            interception as Arc<dyn PostProcessor>,
        ];
        for hook in built_in.into_iter().chain(self.hooks) {
            context.register_hook(hook)?;
        }
        for listener in self.listeners {
            context.add_listener(listener);
        }

        info!(context = %name, "Context created");
        Ok(context)
    }
}

impl Default for ApplicationContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wiring::{Autowired, WiringPlan};
    use std::sync::atomic::AtomicUsize;

    struct Repository;

    struct Service {
        repository: Autowired<Repository>,
    }

    fn service_definition() -> ComponentDefinition {
        ComponentDefinition::builder::<Service>("service")
            .factory(|_| {
                Ok(Service {
                    repository: Autowired::new(),
                })
            })
            .wired(WiringPlan::new().field("repository", |s: &Service| &s.repository))
            .build()
    }

    fn context(definitions: Vec<ComponentDefinition>) -> ApplicationContext {
        let mut builder = ApplicationContext::builder().config(ContainerConfig::test());
        for definition in definitions {
            builder = builder.component(definition);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_refresh_walks_states_forward() {
        let ctx = context(vec![
            ComponentDefinition::builder::<Repository>("repository")
                .factory(|_| Ok(Repository))
                .build(),
            service_definition(),
        ]);
        assert_eq!(ctx.state(), ContextState::Created);
        assert!(ctx.get::<Service>().is_err());

        ctx.refresh().unwrap();
        assert_eq!(ctx.state(), ContextState::Ready);
        let service = ctx.get::<Service>().unwrap();
        assert!(service.repository.is_wired());
        assert_eq!(ctx.dependencies_of("service"), vec!["repository".to_string()]);

        assert!(matches!(
            ctx.refresh(),
            Err(ContainerError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_fails_and_closes() {
        let ctx = context(vec![service_definition()]);
        let result = ctx.refresh();
        assert!(matches!(
            result,
            Err(ContainerError::UnresolvedDependency { ref field, .. }) if field == "repository"
        ));
        assert_eq!(ctx.state(), ContextState::Closed);
        assert!(ctx.get_component("service").is_err());
    }

    #[test]
    fn test_eager_cycle_is_reported() {
        struct A;
        struct B;
        let ctx = context(vec![
            ComponentDefinition::builder::<A>("a")
                .factory(|r| {
                    r.get::<B>()?;
                    Ok(A)
                })
                .build(),
            ComponentDefinition::builder::<B>("b")
                .factory(|r| {
                    r.get::<A>()?;
                    Ok(B)
                })
                .build(),
        ]);
        match ctx.refresh() {
            Err(ContainerError::Circular { chain }) => {
                assert_eq!(chain, vec!["a", "b", "a"]);
            }
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_prototypes_are_not_cached() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let ctx = context(vec![ComponentDefinition::builder::<Repository>("repository")
            .factory(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Repository)
            })
            .prototype()
            .build()]);
        ctx.refresh().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let first = ctx.get::<Repository>().unwrap();
        let second = ctx.get::<Repository>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.stats().prototype_creations, 2);
    }

    #[test]
    fn test_refresh_scope_recreates_instances() {
        struct Settings {
            generation: usize,
        }
        let generation = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&generation);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let destroy_counter = Arc::clone(&destroyed);

        let ctx = context(vec![ComponentDefinition::builder::<Settings>("settings")
            .factory(move |_| {
                Ok(Settings {
                    generation: counter.fetch_add(1, Ordering::SeqCst),
                })
            })
            .on_destroy(move |_| {
                destroy_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .refresh_scoped()
            .build()]);
        ctx.refresh().unwrap();
        assert_eq!(ctx.get::<Settings>().unwrap().generation, 0);

        assert_eq!(ctx.refresh_scope().unwrap(), vec!["settings".to_string()]);
        assert_eq!(ctx.get::<Settings>().unwrap().generation, 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.state(), ContextState::Ready);
    }

    #[test]
    fn test_close_is_idempotent() {
        let ctx = context(vec![]);
        ctx.refresh().unwrap();
        ctx.close().unwrap();
        ctx.close().unwrap();
        assert_eq!(ctx.state(), ContextState::Closed);
    }

    #[test]
    fn test_stats() {
        let ctx = context(vec![ComponentDefinition::builder::<Repository>("repository")
            .factory(|_| Ok(Repository))
            .build()]);
        ctx.refresh().unwrap();
        ctx.get::<Repository>().unwrap();
        let stats = ctx.stats();
        assert_eq!(stats.definitions, 1);
        assert_eq!(stats.cached_singletons, 1);
        assert_eq!(stats.singleton_creations, 1);
        assert!(stats.cache_hits >= 1);
        assert_eq!(stats.hooks, 5);
    }
}
