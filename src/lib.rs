//! # Fezz Hosting - middleware pipeline hosting for AWS Lambda
//!
//! Fezz Hosting runs a Lambda function the way a long-lived service is run:
//! services are registered in a container, every invocation flows through an
//! ordered middleware pipeline into one terminal handler, and init/shutdown
//! phases bracket the process lifetime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    Lambda Runtime API (platform)                    │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                   │ next / response / error
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     HostedLambdaService                             │
//! │   init phase ──► Bootstrap loop ──► shutdown phase                  │
//! │                       │                                             │
//! │                       ▼                                             │
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │ HandlerComposer (per invocation)                            │    │
//! │  │  deserialize ─► m1 ─► m2 ─► … ─► handler ─► … ─► serialize  │    │
//! │  │  linked token · lazy scope · scope disposed on every path   │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fezz_hosting::prelude::*;
//!
//! struct Greeter {
//!     greeting: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), HostingError> {
//!     let mut builder = LambdaApplicationBuilder::from_env()?;
//!     builder.services().add_singleton(Greeter {
//!         greeting: "Hello".into(),
//!     });
//!     builder.use_json::<String, String>();
//!
//!     builder.use_fn(|ctx, next| {
//!         Box::pin(async move {
//!             tracing::info!(request_id = ctx.request_id(), "before");
//!             next.call(ctx).await?;
//!             tracing::info!(request_id = ctx.request_id(), "after");
//!             Ok(())
//!         })
//!     });
//!
//!     builder.handle_fn(|Event(name): Event<String>, greeter: Service<Greeter>| async move {
//!         Ok::<_, BoxError>(format!("{}, {name}!", greeter.greeting))
//!     })?;
//!
//!     builder.on_shutdown_fn(|| async { Ok::<_, BoxError>(()) });
//!
//!     builder.build()?.run().await
//! }
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Init**: every init handler runs concurrently in its own scope. Any
//!    failure is reported to the platform and the loop never starts; a handler
//!    returning `false` halts startup without an error.
//! 2. **Invocations**: one composed chain per invocation, bounded by a token
//!    that trips `remaining - buffer` before the platform deadline.
//! 3. **Shutdown**: on SIGTERM or when the loop ends, the loop is drained
//!    within the shutdown budget and every shutdown handler runs; all
//!    failures are reported together.

pub mod cancellation;
pub mod composer;
pub mod context;
pub mod envelopes;
pub mod error;
pub mod host;
pub mod options;
pub mod pipeline;
pub mod runtime;
pub mod services;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::context::{InvocationContext, LambdaContext};
    pub use crate::error::{BoxError, ConfigError, HostingError};
    pub use crate::host::{LambdaApplication, LambdaApplicationBuilder};
    pub use crate::options::{HostingOptions, ShutdownDuration};
    pub use crate::pipeline::{Event, InvocationDelegate, Middleware, Next, Service};
    pub use crate::services::{ServiceCollection, ServiceScope};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export for convenience
pub use composer::{HandlerComposer, RawHandler};
pub use error::{AggregateError, BoxError, ConfigError, HostingError};
pub use host::{HostState, HostedLambdaService, LambdaApplication, LambdaApplicationBuilder};
pub use options::{HostingOptions, ShutdownDuration};
