//! Init and shutdown phase builders.
//!
//! All handlers of a phase run concurrently, each in its own service scope,
//! and observe one shared token. There is no ordering between handlers of
//! the same phase; they must not depend on each other's side effects.
//! A failing handler never cancels or masks its siblings: every outcome is
//! collected and failures are reported together.

use super::binding::{
    into_init_handler, into_shutdown_handler, IntoInitOutcome, IntoShutdownOutcome, ScopeArgs,
    TypedHandler,
};
use crate::cancellation::DeadlineSource;
use crate::error::{AggregateError, BoxError, HostingError};
use crate::services::{ScopeFactory, ServiceScope};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type PhaseFn<T> = dyn Fn(Arc<dyn ServiceScope>, CancellationToken) -> BoxFuture<'static, Result<T, BoxError>>
    + Send
    + Sync;

/// One handler of a lifecycle phase.
pub struct PhaseHandler<T>(Arc<PhaseFn<T>>);

/// Init handler; `Ok(false)` votes to halt startup.
pub type InitHandler = PhaseHandler<bool>;

/// Shutdown handler.
pub type ShutdownHandler = PhaseHandler<()>;

impl<T> PhaseHandler<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Arc<dyn ServiceScope>, CancellationToken) -> BoxFuture<'static, Result<T, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn invoke(
        &self,
        scope: Arc<dyn ServiceScope>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<T, BoxError>> {
        (self.0)(scope, token)
    }
}

impl<T> Clone for PhaseHandler<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for PhaseHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PhaseHandler")
    }
}

/// Collects init handlers.
#[derive(Debug, Default)]
pub struct InitBuilder {
    handlers: Vec<InitHandler>,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(&mut self, handler: InitHandler) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// Register a typed init handler. See [`super::binding`] for bindable parameters.
    pub fn on_init_fn<H, Args>(&mut self, handler: H) -> &mut Self
    where
        H: TypedHandler<Args>,
        Args: ScopeArgs,
        H::Output: IntoInitOutcome,
    {
        self.on_init(into_init_handler(handler))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Compile the phase; the shared token trips after `timeout`.
    pub fn build(&self, timeout: Duration) -> InitDelegate {
        InitDelegate {
            handlers: self.handlers.clone().into(),
            timeout,
        }
    }
}

/// Compiled init phase.
#[derive(Debug, Clone)]
pub struct InitDelegate {
    handlers: Arc<[InitHandler]>,
    timeout: Duration,
}

impl InitDelegate {
    /// Run every handler to completion.
    ///
    /// Returns whether startup should continue (the AND of every vote), or an
    /// aggregate of every handler failure.
    pub async fn run(
        &self,
        scopes: &Arc<dyn ScopeFactory>,
        stopping: &CancellationToken,
    ) -> Result<bool, HostingError> {
        if self.handlers.is_empty() {
            return Ok(true);
        }

        let deadline = DeadlineSource::linked(stopping, self.timeout);
        let outcomes = run_concurrently("init", &self.handlers, scopes, deadline.token()).await;

        let mut errors = AggregateError::default();
        let mut proceed = true;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(vote) => {
                    if !vote {
                        warn!(phase = "init", handler = index, "Init handler voted to halt startup");
                    }
                    proceed &= vote;
                }
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(proceed)
        } else {
            Err(HostingError::Init(errors))
        }
    }
}

/// Collects shutdown handlers.
#[derive(Debug, Default)]
pub struct ShutdownBuilder {
    handlers: Vec<ShutdownHandler>,
}

impl ShutdownBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_shutdown(&mut self, handler: ShutdownHandler) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// Register a typed shutdown handler.
    pub fn on_shutdown_fn<H, Args>(&mut self, handler: H) -> &mut Self
    where
        H: TypedHandler<Args>,
        Args: ScopeArgs,
        H::Output: IntoShutdownOutcome,
    {
        self.on_shutdown(into_shutdown_handler(handler))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn build(&self) -> ShutdownDelegate {
        ShutdownDelegate {
            handlers: self.handlers.clone().into(),
        }
    }
}

/// Compiled shutdown phase.
#[derive(Debug, Clone)]
pub struct ShutdownDelegate {
    handlers: Arc<[ShutdownHandler]>,
}

impl ShutdownDelegate {
    /// Run every handler to completion against the shutdown token.
    pub async fn run(
        &self,
        scopes: &Arc<dyn ScopeFactory>,
        token: &CancellationToken,
    ) -> Result<(), HostingError> {
        if self.handlers.is_empty() {
            return Ok(());
        }

        let outcomes = run_concurrently("shutdown", &self.handlers, scopes, token).await;
        let errors: Vec<BoxError> = outcomes.into_iter().filter_map(Result::err).collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HostingError::Shutdown(AggregateError::new(errors)))
        }
    }
}

/// Spawn every handler in a fresh scope and collect each outcome, in
/// registration order.
async fn run_concurrently<T: Send + 'static>(
    phase: &'static str,
    handlers: &[PhaseHandler<T>],
    scopes: &Arc<dyn ScopeFactory>,
    token: &CancellationToken,
) -> Vec<Result<T, BoxError>> {
    let started = Instant::now();
    info!(phase, handlers = handlers.len(), "Running lifecycle phase");

    let tasks: Vec<_> = handlers
        .iter()
        .enumerate()
        .map(|(index, handler)| {
            let handler = handler.clone();
            let scopes = scopes.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let scope = scopes.create_scope();
                let handler_scope = scope.clone();
                let outcome = AssertUnwindSafe(async move { handler.invoke(handler_scope, token).await })
                    .catch_unwind()
                    .await;
                scope.dispose().await;

                let outcome = match outcome {
                    Ok(result) => result,
                    Err(panic) => Err(Box::new(HostingError::from_panic(panic)) as BoxError),
                };
                if let Err(err) = &outcome {
                    error!(phase, handler = index, error = %err, "Lifecycle handler failed");
                }
                outcome
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        outcomes.push(match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(Box::new(join_error) as BoxError),
        });
    }

    debug!(
        phase,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Lifecycle phase finished"
    );
    outcomes
}
