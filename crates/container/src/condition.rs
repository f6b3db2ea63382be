//! Conditional registration.
//!
//! Candidates are evaluated one at a time, in declaration order, against the
//! registry as it stands at that moment. A condition never sees a definition
//! registered later in the same pass.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::definition::ComponentDefinition;
use crate::environment::Environment;
use crate::errors::ConditionError;
use crate::registry::RegistrySnapshot;
use crate::types::TypeKey;

/// User-supplied registration predicate
pub trait ConditionPredicate: Send + Sync {
    fn matches(&self, context: &ConditionContext<'_>) -> Result<bool, ConditionError>;

    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// State a condition may inspect
pub struct ConditionContext<'a> {
    registry: &'a RegistrySnapshot,
    environment: &'a Environment,
}

impl<'a> ConditionContext<'a> {
    pub fn new(registry: &'a RegistrySnapshot, environment: &'a Environment) -> Self {
        Self {
            registry,
            environment,
        }
    }

    pub fn registry(&self) -> &RegistrySnapshot {
        self.registry
    }

    pub fn environment(&self) -> &Environment {
        self.environment
    }

    pub fn contains_definition(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn has_type(&self, key: &TypeKey) -> bool {
        self.registry.has_type(key)
    }
}

/// Registration condition attached to a definition
#[derive(Clone)]
pub enum Condition {
    /// Every listed name and type is already defined
    OnBean {
        names: Vec<String>,
        types: Vec<TypeKey>,
    },
    /// None of the listed names or types is defined
    OnMissingBean {
        names: Vec<String>,
        types: Vec<TypeKey>,
    },
    /// Every listed module is available
    OnClass(Vec<String>),
    /// None of the listed modules is available
    OnMissingClass(Vec<String>),
    OnProperty {
        key: String,
        having_value: Option<String>,
        match_if_missing: bool,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Custom(Arc<dyn ConditionPredicate>),
}

impl Condition {
    pub fn on_bean<T: ?Sized + 'static>() -> Self {
        Condition::OnBean {
            names: Vec::new(),
            types: vec![TypeKey::of::<T>()],
        }
    }

    pub fn on_bean_named(name: impl Into<String>) -> Self {
        Condition::OnBean {
            names: vec![name.into()],
            types: Vec::new(),
        }
    }

    pub fn on_missing_bean<T: ?Sized + 'static>() -> Self {
        Condition::OnMissingBean {
            names: Vec::new(),
            types: vec![TypeKey::of::<T>()],
        }
    }

    pub fn on_missing_bean_named(name: impl Into<String>) -> Self {
        Condition::OnMissingBean {
            names: vec![name.into()],
            types: Vec::new(),
        }
    }

    pub fn on_class(module: impl Into<String>) -> Self {
        Condition::OnClass(vec![module.into()])
    }

    pub fn on_missing_class(module: impl Into<String>) -> Self {
        Condition::OnMissingClass(vec![module.into()])
    }

    /// Property present (and equal to `value` when given)
    pub fn on_property(key: impl Into<String>, value: Option<&str>) -> Self {
        Condition::OnProperty {
            key: key.into(),
            having_value: value.map(str::to_string),
            match_if_missing: false,
        }
    }

    pub fn custom(predicate: impl ConditionPredicate + 'static) -> Self {
        Condition::Custom(Arc::new(predicate))
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut all) => {
                all.push(other);
                Condition::All(all)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Any(mut any) => {
                any.push(other);
                Condition::Any(any)
            }
            first => Condition::Any(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Condition::Not(Box::new(self))
    }

    pub fn evaluate(&self, context: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        match self {
            Condition::OnBean { names, types } => Ok(names
                .iter()
                .all(|name| context.contains_definition(name))
                && types.iter().all(|key| context.has_type(key))),
            Condition::OnMissingBean { names, types } => Ok(!names
                .iter()
                .any(|name| context.contains_definition(name))
                && !types.iter().any(|key| context.has_type(key))),
            Condition::OnClass(modules) => Ok(modules
                .iter()
                .all(|module| context.environment().has_module(module))),
            Condition::OnMissingClass(modules) => Ok(!modules
                .iter()
                .any(|module| context.environment().has_module(module))),
            Condition::OnProperty {
                key,
                having_value,
                match_if_missing,
            } => Ok(match context.environment().property(key) {
                None => *match_if_missing,
                Some(actual) => match having_value {
                    Some(expected) => actual.eq_ignore_ascii_case(expected),
                    None => !actual.eq_ignore_ascii_case("false"),
                },
            }),
            Condition::All(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(conditions) => {
                for condition in conditions {
                    if condition.evaluate(context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(context)?),
            Condition::Custom(predicate) => predicate.matches(context),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::OnBean { names, types } => {
                write!(f, "OnBean(names={:?}, types={:?})", names, types)
            }
            Condition::OnMissingBean { names, types } => {
                write!(f, "OnMissingBean(names={:?}, types={:?})", names, types)
            }
            Condition::OnClass(modules) => write!(f, "OnClass({:?})", modules),
            Condition::OnMissingClass(modules) => write!(f, "OnMissingClass({:?})", modules),
            Condition::OnProperty {
                key, having_value, ..
            } => write!(f, "OnProperty({}={:?})", key, having_value),
            Condition::All(all) => f.debug_tuple("All").field(all).finish(),
            Condition::Any(any) => f.debug_tuple("Any").field(any).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Custom(predicate) => write!(f, "Custom({})", predicate.describe()),
        }
    }
}

/// Decides whether a candidate definition is admitted
pub struct ConditionEvaluator<'a> {
    environment: &'a Environment,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(environment: &'a Environment) -> Self {
        Self { environment }
    }

    /// All conditions must hold. Undecidable conditions count as not met.
    pub fn admits(&self, definition: &ComponentDefinition, registry: &RegistrySnapshot) -> bool {
        if let Some(declaring) = definition.declaring() {
            if !registry.contains(declaring) {
                debug!(
                    component = definition.name(),
                    "Skipping product: declaring component '{}' is not registered", declaring
                );
                return false;
            }
        }

        let context = ConditionContext::new(registry, self.environment);
        for condition in definition.conditions() {
            match condition.evaluate(&context) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        component = definition.name(),
                        "Condition {:?} not met", condition
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        component = definition.name(),
                        "Condition {:?} could not be evaluated, treating as not met: {}",
                        condition,
                        e
                    );
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DefinitionRegistry;

    struct Cache;
    struct Fallback;

    struct Broken;

    impl ConditionPredicate for Broken {
        fn matches(&self, _: &ConditionContext<'_>) -> Result<bool, ConditionError> {
            Err(ConditionError::Undecidable {
                condition: "broken".into(),
                reason: "lookup failed".into(),
            })
        }
    }

    fn cache_def() -> ComponentDefinition {
        ComponentDefinition::builder::<Cache>("cache")
            .factory(|_| Ok(Cache))
            .build()
    }

    #[test]
    fn test_on_bean_and_missing_bean() {
        let registry = DefinitionRegistry::default();
        let env = Environment::default();

        let empty = registry.snapshot();
        let ctx = ConditionContext::new(&empty, &env);
        assert!(!Condition::on_bean::<Cache>().evaluate(&ctx).unwrap());
        assert!(Condition::on_missing_bean::<Cache>().evaluate(&ctx).unwrap());

        registry.register(cache_def()).unwrap();
        let filled = registry.snapshot();
        let ctx = ConditionContext::new(&filled, &env);
        assert!(Condition::on_bean_named("cache").evaluate(&ctx).unwrap());
        assert!(!Condition::on_missing_bean_named("cache").evaluate(&ctx).unwrap());
        assert!(Condition::on_missing_bean::<Fallback>().evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_class_and_property_conditions() {
        let registry = DefinitionRegistry::default().snapshot();
        let env = Environment::default()
            .with_module("metrics")
            .with_property("cache.enabled", "true");
        let ctx = ConditionContext::new(&registry, &env);

        assert!(Condition::on_class("metrics").evaluate(&ctx).unwrap());
        assert!(!Condition::on_class("tracing").evaluate(&ctx).unwrap());
        assert!(Condition::on_missing_class("tracing").evaluate(&ctx).unwrap());
        assert!(Condition::on_property("cache.enabled", Some("TRUE"))
            .evaluate(&ctx)
            .unwrap());
        assert!(!Condition::on_property("cache.size", None).evaluate(&ctx).unwrap());

        let missing_ok = Condition::OnProperty {
            key: "cache.size".into(),
            having_value: None,
            match_if_missing: true,
        };
        assert!(missing_ok.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_combinators() {
        let registry = DefinitionRegistry::default().snapshot();
        let env = Environment::default().with_module("metrics");
        let ctx = ConditionContext::new(&registry, &env);

        let both = Condition::on_class("metrics").and(Condition::on_class("tracing"));
        let either = Condition::on_class("metrics").or(Condition::on_class("tracing"));
        assert!(!both.evaluate(&ctx).unwrap());
        assert!(either.evaluate(&ctx).unwrap());
        assert!(both.not().evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_evaluator_fails_closed() {
        let registry = DefinitionRegistry::default();
        let env = Environment::default();
        let evaluator = ConditionEvaluator::new(&env);

        let guarded = ComponentDefinition::builder::<Cache>("cache")
            .factory(|_| Ok(Cache))
            .condition(Condition::custom(Broken))
            .build();
        assert!(!evaluator.admits(&guarded, &registry.snapshot()));
        assert!(evaluator.admits(&cache_def(), &registry.snapshot()));
    }

    #[test]
    fn test_product_of_rejected_declaring_is_rejected() {
        let registry = DefinitionRegistry::default();
        let env = Environment::default();
        let evaluator = ConditionEvaluator::new(&env);

        let product = ComponentDefinition::produced_by::<Cache, Fallback, _>(
            "fallback",
            "cache",
            |_, _| Ok(Fallback),
        )
        .build();
        assert!(!evaluator.admits(&product, &registry.snapshot()));

        registry.register(cache_def()).unwrap();
        assert!(evaluator.admits(&product, &registry.snapshot()));
    }
}
