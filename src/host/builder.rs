//! Application builder and process host.

use super::service::HostedLambdaService;
use crate::cancellation::{BufferedDeadline, CancellationFactory, DeadlineSource};
use crate::composer::HandlerComposer;
use crate::context::InvocationContext;
use crate::error::{BoxError, ConfigError, HostingError};
use crate::options::HostingOptions;
use crate::pipeline::binding::{
    IntoHandlerResponse, IntoInitOutcome, IntoShutdownOutcome, InvocationArgs, ScopeArgs,
    TypedHandler,
};
use crate::pipeline::{
    EventDeserializer, InitBuilder, InitHandler, InvocationBuilder, InvocationDelegate, Middleware,
    Next, ResponseSerializer, ShutdownBuilder, ShutdownHandler,
};
use crate::runtime::{Bootstrap, RuntimeBootstrap};
use crate::services::{ScopeFactory, ServiceCollection, ServiceProvider};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collects services, options, pipeline and lifecycle handlers.
///
/// ```rust,no_run
/// use fezz_hosting::prelude::*;
///
/// # async fn run() -> Result<(), HostingError> {
/// let mut builder = LambdaApplicationBuilder::new();
/// builder.use_json::<String, String>();
/// builder.handle_fn(|Event(name): Event<String>| async move {
///     Ok::<_, BoxError>(format!("hello {name}"))
/// })?;
/// builder.build()?.run().await
/// # }
/// ```
#[derive(Default)]
pub struct LambdaApplicationBuilder {
    services: ServiceCollection,
    options: HostingOptions,
    invocation: InvocationBuilder,
    init: InitBuilder,
    shutdown: ShutdownBuilder,
    bootstrap: Option<Arc<dyn Bootstrap>>,
    cancellation: Option<Arc<dyn CancellationFactory>>,
}

impl LambdaApplicationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from options overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            options: HostingOptions::default().from_env()?,
            ..Self::default()
        })
    }

    /// Service registrations.
    pub fn services(&mut self) -> &mut ServiceCollection {
        &mut self.services
    }

    /// Options; frozen by [`build`](Self::build).
    pub fn options(&mut self) -> &mut HostingOptions {
        &mut self.options
    }

    pub fn use_middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.invocation.use_middleware(middleware);
        self
    }

    pub fn use_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.invocation.use_fn(f);
        self
    }

    pub fn handle(&mut self, handler: InvocationDelegate) -> Result<&mut Self, ConfigError> {
        self.invocation.handle(handler)?;
        Ok(self)
    }

    pub fn handle_fn<H, Args>(&mut self, handler: H) -> Result<&mut Self, ConfigError>
    where
        H: TypedHandler<Args>,
        Args: InvocationArgs,
        H::Output: IntoHandlerResponse,
    {
        self.invocation.handle_fn(handler)?;
        Ok(self)
    }

    pub fn deserializer(&mut self, deserializer: EventDeserializer) -> &mut Self {
        self.invocation.deserializer(deserializer);
        self
    }

    pub fn serializer(&mut self, serializer: ResponseSerializer) -> &mut Self {
        self.invocation.serializer(serializer);
        self
    }

    /// JSON event of type `E`, JSON response of type `R`.
    pub fn use_json<E, R>(&mut self) -> &mut Self
    where
        E: DeserializeOwned + Send + Sync + 'static,
        R: Serialize + Send + Sync + 'static,
    {
        self.invocation.use_json::<E, R>();
        self
    }

    pub fn on_init(&mut self, handler: InitHandler) -> &mut Self {
        self.init.on_init(handler);
        self
    }

    pub fn on_init_fn<H, Args>(&mut self, handler: H) -> &mut Self
    where
        H: TypedHandler<Args>,
        Args: ScopeArgs,
        H::Output: IntoInitOutcome,
    {
        self.init.on_init_fn(handler);
        self
    }

    pub fn on_shutdown(&mut self, handler: ShutdownHandler) -> &mut Self {
        self.shutdown.on_shutdown(handler);
        self
    }

    pub fn on_shutdown_fn<H, Args>(&mut self, handler: H) -> &mut Self
    where
        H: TypedHandler<Args>,
        Args: ScopeArgs,
        H::Output: IntoShutdownOutcome,
    {
        self.shutdown.on_shutdown_fn(handler);
        self
    }

    /// Replace the Runtime API loop.
    pub fn bootstrap(&mut self, bootstrap: impl Bootstrap + 'static) -> &mut Self {
        self.bootstrap = Some(Arc::new(bootstrap));
        self
    }

    /// Replace the per-invocation deadline policy.
    pub fn cancellation_factory(&mut self, factory: impl CancellationFactory + 'static) -> &mut Self {
        self.cancellation = Some(Arc::new(factory));
        self
    }

    /// Freeze the configuration. Fails if no handler was set.
    pub fn build(self) -> Result<LambdaApplication, ConfigError> {
        let chain = self.invocation.build()?;
        let provider = self.services.build();
        let scopes: Arc<dyn ScopeFactory> = Arc::new(provider.clone());

        let cancellation = self.cancellation.unwrap_or_else(|| {
            Arc::new(BufferedDeadline::new(self.options.invocation_cancellation_buffer))
        });
        let composer = HandlerComposer::new(
            chain,
            self.invocation.registry(),
            scopes.clone(),
            cancellation,
        );
        let bootstrap = self
            .bootstrap
            .unwrap_or_else(|| Arc::new(RuntimeBootstrap::new(self.options.clone())));

        let service = HostedLambdaService::new(
            composer,
            self.init.build(self.options.init_timeout),
            self.shutdown.build(),
            scopes,
            bootstrap,
            self.options.shutdown_budget(),
        );

        info!(
            middleware = self.invocation.registry().middleware().len(),
            init_handlers = self.init.len(),
            shutdown_handlers = self.shutdown.len(),
            "Lambda application built"
        );

        Ok(LambdaApplication {
            service: Arc::new(service),
            options: self.options,
            provider,
        })
    }
}

/// A built application, ready to run.
#[derive(Debug)]
pub struct LambdaApplication {
    service: Arc<HostedLambdaService>,
    options: HostingOptions,
    provider: ServiceProvider,
}

impl LambdaApplication {
    pub fn service(&self) -> &Arc<HostedLambdaService> {
        &self.service
    }

    pub fn options(&self) -> &HostingOptions {
        &self.options
    }

    /// Root container.
    pub fn services(&self) -> &ServiceProvider {
        &self.provider
    }

    /// Run until the loop ends or the process receives SIGTERM / Ctrl-C.
    pub async fn run(self) -> Result<(), HostingError> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until the loop ends or `shutdown` completes, then stop within the
    /// shutdown budget.
    ///
    /// `shutdown` is watched from the start: a signal that arrives while the
    /// init phase is still running stops the service as soon as init settles.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), HostingError>
    where
        F: Future<Output = ()>,
    {
        let budget = self.options.shutdown_budget();
        let start = self.service.start();
        tokio::pin!(start);
        tokio::pin!(shutdown);

        let signalled_during_start = tokio::select! {
            biased;
            started = &mut start => {
                started?;
                false
            }
            _ = &mut shutdown => true,
        };

        if signalled_during_start {
            info!("Shutdown signal received during init");
            let deadline = DeadlineSource::linked(&CancellationToken::new(), budget);
            let (started, stopped) = tokio::join!(start, self.service.stop(deadline.token().clone()));
            started?;
            return stopped;
        }

        let stop_requested = self.service.stop_requested();
        tokio::select! {
            _ = stop_requested.cancelled() => info!("Stop requested by the hosted service"),
            _ = &mut shutdown => info!("Shutdown signal received"),
        }

        let deadline = DeadlineSource::linked(&CancellationToken::new(), budget);
        self.service.stop(deadline.token().clone()).await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
