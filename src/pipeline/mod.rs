//! Invocation and lifecycle pipelines.
//!
//! - [`InvocationBuilder`] folds middleware around one terminal handler.
//! - [`InitBuilder`] and [`ShutdownBuilder`] collect phase handlers that run
//!   concurrently, each in its own service scope.
//! - [`binding`] turns plain async functions into any of the above.

pub mod binding;
mod delegate;
mod invocation;
mod lifecycle;

pub use binding::{Event, Service};
pub use delegate::{
    DelegateRegistry, EventDeserializer, InvocationDelegate, Middleware, Next, ResponseSerializer,
};
pub use invocation::InvocationBuilder;
pub use lifecycle::{
    InitBuilder, InitDelegate, InitHandler, PhaseHandler, ShutdownBuilder, ShutdownDelegate,
    ShutdownHandler,
};
