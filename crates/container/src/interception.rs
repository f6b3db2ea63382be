//! Method interception.
//!
//! Components that want their calls intercepted expose themselves as
//! [`MethodTarget`]: a named method table taking and returning JSON values.
//! Interceptors are composed into a [`Chain`]; each link either returns
//! without proceeding (short-circuit) or hands the invocation on with
//! [`Chain::proceed`], which consumes the chain so it can happen once.
//!
//! Decorating hooks install an [`InterceptedTarget`] as the component's
//! `dyn MethodTarget` view. Wrapping an already intercepted component adds
//! the new interceptor as the outermost link: later registrations wrap
//! earlier ones.

use std::fmt;
use std::ptr;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::types::Component;

/// Node of the static failure-type hierarchy
#[derive(Debug)]
pub struct FailureType {
    name: &'static str,
    parent: Option<&'static FailureType>,
}

impl FailureType {
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn extends(name: &'static str, parent: &'static FailureType) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static FailureType> {
        self.parent
    }

    /// Hops from `self` up to `ancestor`; `Some(0)` for the same type
    pub fn distance_to(&self, ancestor: &FailureType) -> Option<usize> {
        let mut current = Some(self);
        let mut hops = 0;
        while let Some(ty) = current {
            if ty == ancestor {
                return Some(hops);
            }
            current = ty.parent;
            hops += 1;
        }
        None
    }

    pub fn is_a(&self, ancestor: &FailureType) -> bool {
        self.distance_to(ancestor).is_some()
    }
}

impl PartialEq for FailureType {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for FailureType {}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub static FAILURE: FailureType = FailureType::root("Failure");
pub static ILLEGAL_ARGUMENT: FailureType = FailureType::extends("IllegalArgument", &FAILURE);
pub static ILLEGAL_STATE: FailureType = FailureType::extends("IllegalState", &FAILURE);
pub static VALIDATION: FailureType = FailureType::extends("Validation", &ILLEGAL_ARGUMENT);
pub static METHOD_NOT_FOUND: FailureType =
    FailureType::extends("MethodNotFound", &ILLEGAL_ARGUMENT);

/// Failure raised by a method target or an interceptor
#[derive(Debug, Clone, Error)]
#[error("{ty}: {message}")]
pub struct Failure {
    ty: &'static FailureType,
    message: String,
    details: Option<Value>,
}

impl Failure {
    pub fn new(ty: &'static FailureType, message: impl Into<String>) -> Self {
        Self {
            ty,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn ty(&self) -> &'static FailureType {
        self.ty
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub fn is_a(&self, ty: &FailureType) -> bool {
        self.ty.is_a(ty)
    }
}

/// Value constraint on a parameter or return value
#[derive(Debug, Clone)]
pub enum Constraint {
    NotNull,
    /// Non-null string with at least one non-whitespace character
    NotBlank,
    Min(i64),
    Max(i64),
    /// Length bounds for strings (chars) and arrays (elements)
    Length { min: usize, max: usize },
    Pattern(Regex),
}

impl Constraint {
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Constraint::Pattern(Regex::new(pattern)?))
    }

    /// Violation message, `None` when `value` satisfies the constraint.
    /// Null passes every constraint except `NotNull` and `NotBlank`.
    pub fn check(&self, value: &Value) -> Option<String> {
        match (self, value) {
            (Constraint::NotNull, Value::Null) => Some("must not be null".into()),
            (Constraint::NotBlank, Value::String(s)) if s.trim().is_empty() => {
                Some("must not be blank".into())
            }
            (Constraint::NotBlank, Value::Null) => Some("must not be blank".into()),
            (_, Value::Null) => None,
            (Constraint::Min(min), Value::Number(n)) => match n.as_f64() {
                Some(v) if v < *min as f64 => {
                    Some(format!("must be greater than or equal to {}", min))
                }
                _ => None,
            },
            (Constraint::Max(max), Value::Number(n)) => match n.as_f64() {
                Some(v) if v > *max as f64 => {
                    Some(format!("must be less than or equal to {}", max))
                }
                _ => None,
            },
            (Constraint::Length { min, max }, Value::String(s)) => {
                let len = s.chars().count();
                (len < *min || len > *max)
                    .then(|| format!("length must be between {} and {}", min, max))
            }
            (Constraint::Length { min, max }, Value::Array(items)) => {
                let len = items.len();
                (len < *min || len > *max)
                    .then(|| format!("size must be between {} and {}", min, max))
            }
            (Constraint::Pattern(regex), Value::String(s)) => {
                (!regex.is_match(s)).then(|| format!("must match \"{}\"", regex.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub constraints: Vec<Constraint>,
}

/// Signature of a callable method, with its validation constraints
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    params: Vec<ParamSpec>,
    returns: Vec<Constraint>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, constraints: Vec<Constraint>) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            constraints,
        });
        self
    }

    pub fn returns(mut self, constraints: Vec<Constraint>) -> Self {
        self.returns = constraints;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn return_constraints(&self) -> &[Constraint] {
        &self.returns
    }

    pub fn has_constraints(&self) -> bool {
        !self.returns.is_empty() || self.params.iter().any(|p| !p.constraints.is_empty())
    }
}

/// Component surface that can be intercepted
pub trait MethodTarget: Send + Sync {
    fn methods(&self) -> Vec<MethodDescriptor>;

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure>;
}

/// A call travelling through the chain
#[derive(Debug, Clone)]
pub struct Invocation {
    target: String,
    method: MethodDescriptor,
    args: Vec<Value>,
}

impl Invocation {
    pub fn new(target: impl Into<String>, method: MethodDescriptor, args: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            method,
            args,
        }
    }

    /// Name of the intercepted component
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }
}

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn intercept(&self, invocation: &mut Invocation, chain: Chain<'_>) -> Result<Value, Failure>;
}

/// Remaining links of an interceptor chain, ending at the target
pub struct Chain<'a> {
    links: &'a [Arc<dyn Interceptor>],
    target: &'a dyn MethodTarget,
}

impl<'a> Chain<'a> {
    pub fn new(links: &'a [Arc<dyn Interceptor>], target: &'a dyn MethodTarget) -> Self {
        Self { links, target }
    }

    pub fn proceed(self, invocation: &mut Invocation) -> Result<Value, Failure> {
        match self.links.split_first() {
            Some((head, rest)) => head.intercept(
                invocation,
                Chain {
                    links: rest,
                    target: self.target,
                },
            ),
            None => self
                .target
                .invoke(invocation.method.name(), invocation.args.clone()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.links.len()
    }
}

/// Original target plus its interceptors, outermost first
pub(crate) struct Advised {
    target: Arc<dyn MethodTarget>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

/// Intercepting proxy installed as a component's `dyn MethodTarget` view
pub struct InterceptedTarget {
    name: String,
    target: Arc<dyn MethodTarget>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    methods: Vec<MethodDescriptor>,
}

impl InterceptedTarget {
    pub fn new(
        name: impl Into<String>,
        target: Arc<dyn MethodTarget>,
        interceptors: Vec<Arc<dyn Interceptor>>,
    ) -> Self {
        let methods = target.methods();
        Self {
            name: name.into(),
            target,
            interceptors,
            methods,
        }
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }
}

impl MethodTarget for InterceptedTarget {
    fn methods(&self) -> Vec<MethodDescriptor> {
        self.methods.clone()
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, Failure> {
        let descriptor = self
            .methods
            .iter()
            .find(|m| m.name() == method)
            .cloned()
            .ok_or_else(|| {
                Failure::new(
                    &METHOD_NOT_FOUND,
                    format!("'{}' has no method '{}'", self.name, method),
                )
            })?;
        let mut invocation = Invocation::new(self.name.clone(), descriptor, args);
        Chain::new(&self.interceptors, self.target.as_ref()).proceed(&mut invocation)
    }
}

impl Component {
    /// Copy of this component whose `dyn MethodTarget` view runs through
    /// `interceptor` first. `None` when the component is not a method target.
    pub fn intercept(&self, interceptor: Arc<dyn Interceptor>) -> Option<Component> {
        let (target, mut interceptors) = match &self.advised {
            Some(advised) => (Arc::clone(&advised.target), advised.interceptors.clone()),
            None => (self.view::<dyn MethodTarget>()?, Vec::new()),
        };
        debug!(
            component = self.name(),
            "Wrapping with interceptor '{}'",
            interceptor.name()
        );
        interceptors.insert(0, interceptor);

        let proxy: Arc<dyn MethodTarget> = Arc::new(InterceptedTarget::new(
            self.name(),
            Arc::clone(&target),
            interceptors.clone(),
        ));
        let mut wrapped = self.with_view::<dyn MethodTarget>(proxy);
        wrapped.advised = Some(Arc::new(Advised {
            target,
            interceptors,
        }));
        Some(wrapped)
    }

    /// Interceptor names, outermost first
    pub fn interceptors(&self) -> Vec<String> {
        self.advised
            .as_ref()
            .map(|a| a.interceptors.iter().map(|i| i.name().to_string()).collect())
            .unwrap_or_default()
    }
}

/// Checks declared parameter constraints before the call and return
/// constraints after it
#[derive(Debug, Default)]
pub struct ValidationInterceptor;

impl ValidationInterceptor {
    fn violations(constraints: &[Constraint], path: &str, value: &Value) -> Vec<Value> {
        constraints
            .iter()
            .filter_map(|c| c.check(value))
            .map(|message| json!({ "path": path, "message": message }))
            .collect()
    }
}

impl Interceptor for ValidationInterceptor {
    fn name(&self) -> &str {
        "validation"
    }

    fn intercept(&self, invocation: &mut Invocation, chain: Chain<'_>) -> Result<Value, Failure> {
        let method = invocation.method().clone();
        let mut violations = Vec::new();
        for (index, param) in method.params().iter().enumerate() {
            let value = invocation.args().get(index).unwrap_or(&Value::Null);
            let path = format!("{}.{}", method.name(), param.name);
            violations.extend(Self::violations(&param.constraints, &path, value));
        }
        if !violations.is_empty() {
            return Err(Failure::new(
                &VALIDATION,
                format!("{} constraint violation(s) calling {}", violations.len(), method.name()),
            )
            .with_details(Value::Array(violations)));
        }

        let result = chain.proceed(invocation)?;

        let path = format!("{}.<return>", method.name());
        let violations = Self::violations(method.return_constraints(), &path, &result);
        if !violations.is_empty() {
            return Err(Failure::new(
                &VALIDATION,
                format!("return value of {} violates its constraints", method.name()),
            )
            .with_details(Value::Array(violations)));
        }
        Ok(result)
    }
}

type HandlerFn = Arc<dyn Fn(&Failure, &Invocation) -> Result<Value, Failure> + Send + Sync>;

/// Handler for one failure type (and its descendants)
#[derive(Clone)]
pub struct ExceptionHandler {
    handles: &'static FailureType,
    handler: HandlerFn,
}

impl ExceptionHandler {
    pub fn new<F>(handles: &'static FailureType, handler: F) -> Self
    where
        F: Fn(&Failure, &Invocation) -> Result<Value, Failure> + Send + Sync + 'static,
    {
        Self {
            handles,
            handler: Arc::new(handler),
        }
    }

    pub fn handles(&self) -> &'static FailureType {
        self.handles
    }
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionHandler({})", self.handles)
    }
}

/// Component supplying exception handlers to advised components
pub trait ExceptionAdvice: Send + Sync {
    fn handlers(&self) -> Vec<ExceptionHandler>;

    /// Whether this advice applies to `definition`
    fn covers(&self, definition: &crate::definition::ComponentDefinition) -> bool {
        definition.has_marker(crate::definition::markers::ADVISED)
    }
}

/// Routes failures to the most specific registered handler. A handled
/// failure becomes the call's result; unhandled failures propagate.
pub struct ExceptionAdviceInterceptor {
    handlers: Vec<ExceptionHandler>,
}

impl ExceptionAdviceInterceptor {
    pub fn new(handlers: Vec<ExceptionHandler>) -> Self {
        Self { handlers }
    }

    /// Exact type first; otherwise the nearest ancestor, earliest
    /// declaration winning among equally near handlers
    pub fn find_handler(&self, failure: &Failure) -> Option<&ExceptionHandler> {
        if let Some(exact) = self.handlers.iter().find(|h| h.handles == failure.ty()) {
            return Some(exact);
        }
        self.handlers
            .iter()
            .filter_map(|h| failure.ty().distance_to(h.handles).map(|d| (d, h)))
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Interceptor for ExceptionAdviceInterceptor {
    fn name(&self) -> &str {
        "exception-advice"
    }

    fn intercept(&self, invocation: &mut Invocation, chain: Chain<'_>) -> Result<Value, Failure> {
        match chain.proceed(invocation) {
            Ok(value) => Ok(value),
            Err(failure) => match self.find_handler(&failure) {
                Some(handler) => {
                    debug!(
                        component = invocation.target(),
                        "Failure {} handled by handler for {}",
                        failure.ty(),
                        handler.handles
                    );
                    (handler.handler)(&failure, invocation)
                }
                None => Err(failure),
            },
        }
    }
}
