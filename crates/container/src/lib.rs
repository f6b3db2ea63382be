mod bootstrap;
pub mod condition;
pub mod config;
mod context;
pub mod definition;
mod dependency_graph;
mod environment;
pub mod errors;
pub mod events;
pub mod hooks;
pub mod interception;
mod lazy;
mod lifetime_manager;
pub mod processors;
mod registry;
mod types;
pub mod wiring;

// Context and lifecycle
pub use context::{
    ApplicationContext, ApplicationContextBuilder, ComponentModule, ContainerStats, ContextState,
    WeakContext,
};
pub use bootstrap::{Bootstrap, BootstrapImporter, BOOTSTRAP_PRIMARY_SOURCE};
pub use lifetime_manager::{CacheStats, LifetimeManager};
pub use dependency_graph::DependencyGraph;

// Definitions and registry
pub use definition::{
    markers, ComponentDefinition, DefinitionBuilder, Marker, Origin, ProductInfo, ProductSpec,
    Provision, Scope,
};
pub use registry::{DefinitionRegistry, RegistrySnapshot};
pub use condition::{Condition, ConditionContext, ConditionEvaluator, ConditionPredicate};
pub use environment::Environment;

// Wiring
pub use types::{Component, Instance, Sentinel, TypeKey};
pub use wiring::{
    Autowire, Autowired, AutowiredAll, Dependency, DependencyDescriptor, Resolver, Shape,
    WiringPlan,
};
pub use lazy::LazyRef;

// Hooks, interception and events
pub use hooks::{
    AfterRefresh, ContextAware, Decorator, DefinitionRewriter, InstantiationAware, PostProcessor,
    WiringHook,
};
pub use interception::{
    Chain, Constraint, ExceptionAdvice, ExceptionAdviceInterceptor, ExceptionHandler, Failure,
    FailureType, InterceptedTarget, Interceptor, Invocation, MethodDescriptor, MethodTarget,
    ValidationInterceptor,
};
pub use processors::InterceptorBinding;
pub use events::{
    ApplicationEvent, ApplicationListener, ContextClosed, ContextEvent, ContextRefreshed,
    Delivery, EventMulticaster, ListenerId, RefreshScopeRefreshed,
};

// Configuration and errors
pub use config::{ConfigurationLoader, ContainerConfig, Profile};
pub use errors::{ConditionError, ContainerError, ContainerResult, TeardownFailure};
