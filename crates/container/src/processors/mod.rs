//! Built-in post-processing hooks, registered by every context in this
//! order weight:
//!
//! | hook                          | order        | capability          |
//! |-------------------------------|--------------|---------------------|
//! | [`AutowiredProcessor`]        | `i32::MIN`   | wiring              |
//! | [`FactoryComponentProcessor`] | `i32::MIN+1` | definition rewrite  |
//! | [`MethodValidationProcessor`] | 100          | decoration          |
//! | [`ExceptionAdviceProcessor`]  | 200          | decoration          |
//! | [`InterceptionProcessor`]     | 300          | decoration          |
//!
//! Decorators that run later wrap the earlier ones.

mod autowired;
mod binding;
mod exception_advice;
mod factory_component;
mod validation;

pub use autowired::AutowiredProcessor;
pub use binding::{InterceptionProcessor, InterceptorBinding};
pub use exception_advice::ExceptionAdviceProcessor;
pub use factory_component::FactoryComponentProcessor;
pub use validation::MethodValidationProcessor;
