//! Invocation and platform contexts.

mod invocation;
mod lambda;

pub use invocation::InvocationContext;
pub use lambda::{FunctionConfig, LambdaContext};

pub(crate) use lambda::names;
