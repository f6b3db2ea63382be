//! Error types of the component runtime
//!
//! - **ContainerError**: definition, wiring, lifecycle, bootstrap and teardown
//!   failures. Factories and callbacks return `anyhow::Result`; their cause
//!   chain is flattened into the `reason` of the typed variant.
//! - **ConditionError**: a predicate could not be decided. Never escapes the
//!   evaluator, which treats it as "condition not met".
//!
//! Interception failures have their own type, see [`crate::interception::Failure`].

use std::fmt;
use thiserror::Error;

/// Main error type for container operations
#[derive(Debug, Error, Clone)]
pub enum ContainerError {
    #[error("No component definition named '{name}'")]
    NotFound { name: String },

    #[error("No component of type {type_name} is registered")]
    NoCandidate { type_name: String },

    #[error("Component '{name}' is already defined and overriding is disabled")]
    DuplicateDefinition { name: String },

    #[error("Invalid definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Unresolved dependency '{field}' ({type_name}) required by '{component}'")]
    UnresolvedDependency {
        component: String,
        field: String,
        type_name: String,
    },

    #[error("Ambiguous dependency on {type_name}: candidates {candidates:?}")]
    Ambiguous {
        type_name: String,
        candidates: Vec<String>,
    },

    #[error("Circular dependency: {}", .chain.join(" -> "))]
    Circular { chain: Vec<String> },

    #[error("Component '{name}' does not provide {type_name}")]
    TypeMismatch { name: String, type_name: String },

    #[error("Failed to create component '{name}': {reason}")]
    Creation { name: String, reason: String },

    #[error("Hook '{hook}' failed while processing '{component}': {reason}")]
    Hook {
        hook: String,
        component: String,
        reason: String,
    },

    #[error("Illegal context state: expected {expected}, found {actual}")]
    IllegalState { expected: String, actual: String },

    #[error("Listener '{listener}' failed: {reason}")]
    Listener { listener: String, reason: String },

    #[error("Dependency slot for {type_name} has not been wired")]
    Unwired { type_name: String },

    #[error("Deferred reference to {type_name} could not be resolved: {reason}")]
    LazyResolution { type_name: String, reason: String },

    #[error("Bootstrap failed: {reason}")]
    Bootstrap { reason: String },

    #[error("Teardown failed for {} component(s): {}", .failures.len(), join_failures(.failures))]
    Teardown { failures: Vec<TeardownFailure> },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ContainerError {
    /// Wrap a factory failure, keeping the whole cause chain in the message
    pub fn creation(name: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Creation {
            name: name.into(),
            reason: format!("{:#}", error),
        }
    }

    pub fn illegal_state(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::IllegalState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Definition errors abort `refresh()`
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateDefinition { .. }
                | Self::InvalidDefinition { .. }
                | Self::UnresolvedDependency { .. }
                | Self::Circular { .. }
                | Self::Ambiguous { .. }
        )
    }
}

/// One component whose teardown failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub component: String,
    pub reason: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component, self.reason)
    }
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A condition that could not be decided
#[derive(Debug, Error, Clone)]
pub enum ConditionError {
    #[error("Condition '{condition}' is undecidable: {reason}")]
    Undecidable { condition: String, reason: String },
}

pub type ContainerResult<T> = Result<T, ContainerError>;
