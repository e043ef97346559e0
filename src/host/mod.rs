//! Process hosting: the lifecycle service and the application builder.

mod builder;
mod service;

pub use builder::{LambdaApplication, LambdaApplicationBuilder};
pub use service::{HostState, HostedLambdaService};
