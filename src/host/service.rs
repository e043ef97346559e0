//! Hosted lifecycle service: init, polling loop, shutdown.

use crate::composer::HandlerComposer;
use crate::error::{AggregateError, HostingError};
use crate::pipeline::{InitDelegate, ShutdownDelegate};
use crate::runtime::Bootstrap;
use crate::services::ScopeFactory;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle state of a [`HostedLambdaService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Init or the loop failed, or stop surfaced errors.
    Faulted,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::NotStarted => "not_started",
            HostState::Starting => "starting",
            HostState::Running => "running",
            HostState::Stopping => "stopping",
            HostState::Stopped => "stopped",
            HostState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Owns the built pipeline for the lifetime of the process.
///
/// `start` runs the init phase and then the polling loop on a background
/// task; `stop` drains the loop within a deadline and runs the shutdown
/// phase. Whenever the loop ends, [`stop_requested`](Self::stop_requested)
/// fires so the host can begin an orderly stop.
///
/// `stop` may be called while `start` is still in the init phase. It then
/// waits for init to settle, the loop is never started, and the shutdown
/// phase runs if init completed.
pub struct HostedLambdaService {
    composer: Mutex<Option<HandlerComposer>>,
    init: InitDelegate,
    shutdown: ShutdownDelegate,
    scopes: Arc<dyn ScopeFactory>,
    bootstrap: Arc<dyn Bootstrap>,
    shutdown_budget: Duration,
    state: Mutex<HostState>,
    initialized: AtomicBool,
    stop_attempted: AtomicBool,
    stopping: CancellationToken,
    stop_requested: CancellationToken,
    start_settled: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), HostingError>>>>,
}

impl HostedLambdaService {
    pub fn new(
        composer: HandlerComposer,
        init: InitDelegate,
        shutdown: ShutdownDelegate,
        scopes: Arc<dyn ScopeFactory>,
        bootstrap: Arc<dyn Bootstrap>,
        shutdown_budget: Duration,
    ) -> Self {
        Self {
            composer: Mutex::new(Some(composer)),
            init,
            shutdown,
            scopes,
            bootstrap,
            shutdown_budget,
            state: Mutex::new(HostState::NotStarted),
            initialized: AtomicBool::new(false),
            stop_attempted: AtomicBool::new(false),
            stopping: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            start_settled: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    /// Fires when the host should begin stopping: the loop ended, init
    /// failed, or init voted not to continue.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }

    fn transition(&self, next: HostState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        info!(from = %previous, to = %next, "Hosted service state changed");
    }

    /// Move to `next` only while still in `Starting`. A stop that began
    /// during init owns the state from then on.
    fn leave_starting(&self, next: HostState) {
        let mut state = self.state.lock();
        if *state == HostState::Starting {
            *state = next;
            drop(state);
            info!(from = %HostState::Starting, to = %next, "Hosted service state changed");
        }
    }

    /// Run the init phase, then start the polling loop in the background.
    ///
    /// Init failures and loop failures that happen before the first
    /// suspension are returned here; the loop is never started after an
    /// init failure, nor once a stop has begun.
    pub async fn start(&self) -> Result<(), HostingError> {
        {
            let mut state = self.state.lock();
            if *state != HostState::NotStarted {
                return Err(HostingError::Runtime(format!(
                    "hosted service cannot start from state {}",
                    *state
                )));
            }
            *state = HostState::Starting;
        }
        info!(from = %HostState::NotStarted, to = %HostState::Starting, "Hosted service state changed");

        let result = self.init_and_launch().await;
        self.start_settled.cancel();
        result
    }

    async fn init_and_launch(&self) -> Result<(), HostingError> {
        match self.init.run(&self.scopes, &self.stopping).await {
            Ok(true) => self.initialized.store(true, Ordering::Release),
            Ok(false) => {
                warn!("Init phase voted to halt startup; invocation loop will not start");
                self.initialized.store(true, Ordering::Release);
                self.leave_starting(HostState::Running);
                self.stop_requested.cancel();
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "Init phase failed");
                if let Err(report_err) = self.bootstrap.report_init_error(&err).await {
                    warn!(error = %report_err, "Could not report init failure");
                }
                self.leave_starting(HostState::Faulted);
                self.stop_requested.cancel();
                return Err(err);
            }
        }

        if self.stopping.is_cancelled() {
            info!("Stop began during init; invocation loop will not start");
            self.stop_requested.cancel();
            return Ok(());
        }

        let Some(composer) = self.composer.lock().take() else {
            return Err(HostingError::Runtime("invocation pipeline already consumed".into()));
        };
        let handler = composer.into_raw_handler(self.stopping.clone());
        let bootstrap = self.bootstrap.clone();
        let stopping = self.stopping.clone();
        let stop_requested = self.stop_requested.clone();

        let mut run = Box::pin(async move {
            let result = bootstrap.run(handler, stopping).await;
            match &result {
                Ok(()) => info!("Invocation loop ended"),
                Err(err) => error!(error = %err, "Invocation loop failed"),
            }
            stop_requested.cancel();
            result
        });

        // One synchronous poll so an immediate failure reaches the caller.
        if let Some(result) = (&mut run).now_or_never() {
            return match result {
                Ok(()) => {
                    self.leave_starting(HostState::Running);
                    Ok(())
                }
                Err(err) => {
                    self.leave_starting(HostState::Faulted);
                    Err(err)
                }
            };
        }

        *self.task.lock() = Some(tokio::spawn(run));
        self.leave_starting(HostState::Running);
        Ok(())
    }

    /// Stop the loop and run the shutdown phase.
    ///
    /// `token` is the shutdown deadline. A start still in its init phase and
    /// then the loop are awaited until the token fires; past that a
    /// [`HostingError::ShutdownTimeout`] is recorded and the shutdown phase
    /// runs anyway. Every captured error is returned together as
    /// [`HostingError::Aggregate`]. Only the first call does any work.
    pub async fn stop(&self, token: CancellationToken) -> Result<(), HostingError> {
        if self.stop_attempted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            *state = match previous {
                HostState::NotStarted => HostState::Stopped,
                _ => HostState::Stopping,
            };
            previous
        };
        if previous == HostState::NotStarted {
            info!(from = %previous, to = %HostState::Stopped, "Hosted service state changed");
            return Ok(());
        }
        info!(from = %previous, to = %HostState::Stopping, "Hosted service state changed");
        self.stopping.cancel();

        let mut errors = AggregateError::default();
        let mut timed_out = false;

        if previous == HostState::Starting {
            tokio::select! {
                biased;
                _ = self.start_settled.cancelled() => {}
                _ = token.cancelled() => {
                    warn!(
                        budget_ms = self.shutdown_budget.as_millis() as u64,
                        "Init phase did not settle in time"
                    );
                    timed_out = true;
                }
            }
        }

        let task = if timed_out { None } else { self.task.lock().take() };
        if let Some(mut task) = task {
            tokio::select! {
                biased;
                joined = &mut task => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => errors.push(err),
                    Err(join_err) if join_err.is_panic() => {
                        errors.push(HostingError::from_panic(join_err.into_panic()));
                    }
                    Err(join_err) => errors.push(join_err),
                },
                _ = token.cancelled() => {
                    warn!(
                        budget_ms = self.shutdown_budget.as_millis() as u64,
                        "Invocation loop did not stop in time"
                    );
                    timed_out = true;
                }
            }
        }
        if timed_out {
            errors.push(HostingError::ShutdownTimeout(self.shutdown_budget));
        }

        if self.initialized.load(Ordering::Acquire) {
            if let Err(err) = self.shutdown.run(&self.scopes, &token).await {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            self.transition(HostState::Stopped);
            Ok(())
        } else {
            error!(errors = errors.len(), "Hosted service stopped with errors");
            self.transition(HostState::Faulted);
            Err(HostingError::Aggregate(errors))
        }
    }
}

impl fmt::Debug for HostedLambdaService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedLambdaService")
            .field("state", &self.state())
            .field("shutdown_budget", &self.shutdown_budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::{BufferedDeadline, DeadlineSource};
    use crate::composer::RawHandler;
    use crate::context::LambdaContext;
    use crate::error::BoxError;
    use crate::pipeline::{Event, InitBuilder, InvocationBuilder, PhaseHandler, ShutdownBuilder};
    use crate::services::ServiceCollection;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_err;

    /// Replays scripted payloads, then idles until stopped.
    #[derive(Default)]
    struct ScriptedBootstrap {
        payloads: Vec<&'static str>,
        outputs: Arc<Mutex<Vec<Result<String, String>>>>,
        fail_immediately: bool,
        ignore_stop: bool,
        runs: AtomicUsize,
        init_errors: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Bootstrap for ScriptedBootstrap {
        async fn run(&self, handler: RawHandler, stopping: CancellationToken) -> Result<(), HostingError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_immediately {
                return Err(HostingError::Runtime("no endpoint".into()));
            }
            for (i, payload) in self.payloads.iter().enumerate() {
                let ctx = LambdaContext::new(format!("req-{i}"), Duration::from_secs(30));
                let output = handler(Bytes::from_static(payload.as_bytes()), ctx)
                    .await
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(|err| err.to_string());
                self.outputs.lock().push(output);
            }
            if self.ignore_stop {
                std::future::pending::<()>().await;
            }
            stopping.cancelled().await;
            Ok(())
        }

        async fn report_init_error(&self, error: &HostingError) -> Result<(), HostingError> {
            self.init_errors.lock().push(error.to_string());
            Ok(())
        }
    }

    fn echo_composer() -> HandlerComposer {
        let mut builder = InvocationBuilder::new();
        builder
            .deserializer(crate::pipeline::EventDeserializer::from_fn(|raw: &[u8]| {
                Ok(String::from_utf8(raw.to_vec())?)
            }))
            .serializer(crate::pipeline::ResponseSerializer::from_fn(|out: &String| {
                Ok(Bytes::from(out.clone()))
            }));
        builder
            .handle_fn(|Event(input): Event<String>| async move {
                if input == "fail" {
                    Err::<String, BoxError>("refused".into())
                } else {
                    Ok(input)
                }
            })
            .unwrap();

        HandlerComposer::new(
            builder.build().unwrap(),
            builder.registry(),
            Arc::new(ServiceCollection::new().build()),
            Arc::new(BufferedDeadline::new(Duration::from_millis(100))),
        )
    }

    fn service(
        bootstrap: Arc<ScriptedBootstrap>,
        init: &InitBuilder,
        shutdown: &ShutdownBuilder,
    ) -> HostedLambdaService {
        HostedLambdaService::new(
            echo_composer(),
            init.build(Duration::from_secs(60)),
            shutdown.build(),
            Arc::new(ServiceCollection::new().build()),
            bootstrap,
            Duration::from_millis(1950),
        )
    }

    fn deadline(after: Duration) -> DeadlineSource {
        DeadlineSource::linked(&CancellationToken::new(), after)
    }

    #[tokio::test]
    async fn start_run_stop() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            payloads: vec!["ping", "fail"],
            ..Default::default()
        });
        let shut = Arc::new(AtomicUsize::new(0));
        let counter = shut.clone();
        let mut shutdown = ShutdownBuilder::new();
        shutdown.on_shutdown(PhaseHandler::new(move |_, _| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        let service = service(bootstrap.clone(), &InitBuilder::new(), &shutdown);
        assert_eq!(service.state(), HostState::NotStarted);

        service.start().await.unwrap();
        assert_eq!(service.state(), HostState::Running);

        tokio::time::timeout(Duration::from_secs(5), async {
            while bootstrap.outputs.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stop = deadline(Duration::from_secs(2));
        service.stop(stop.token().clone()).await.unwrap();

        assert_eq!(service.state(), HostState::Stopped);
        assert_eq!(shut.load(Ordering::SeqCst), 1);
        assert!(service.stop_requested().is_cancelled());

        let outputs = bootstrap.outputs.lock().clone();
        assert_eq!(outputs[0], Ok("ping".to_string()));
        assert_eq!(outputs[1], Err("invocation failed: refused".to_string()));
    }

    #[tokio::test]
    async fn init_failure_prevents_loop() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let mut init = InitBuilder::new();
        init.on_init(PhaseHandler::new(|_, _| Box::pin(async { Err("db unreachable".into()) })));

        let service = service(bootstrap.clone(), &init, &ShutdownBuilder::new());
        let err = assert_err!(service.start().await);

        assert!(matches!(err, HostingError::Init(_)));
        assert_eq!(bootstrap.runs.load(Ordering::SeqCst), 0);
        assert_eq!(service.state(), HostState::Faulted);
        assert!(service.stop_requested().is_cancelled());
        assert_eq!(bootstrap.init_errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn init_veto_skips_loop_and_requests_stop() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let mut init = InitBuilder::new();
        init.on_init(PhaseHandler::new(|_, _| Box::pin(async { Ok(false) })));

        let service = service(bootstrap.clone(), &init, &ShutdownBuilder::new());
        service.start().await.unwrap();

        assert_eq!(bootstrap.runs.load(Ordering::SeqCst), 0);
        assert!(service.stop_requested().is_cancelled());

        let stop = deadline(Duration::from_secs(1));
        service.stop(stop.token().clone()).await.unwrap();
        assert_eq!(service.state(), HostState::Stopped);
    }

    #[tokio::test]
    async fn immediate_loop_failure_surfaces_from_start() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            fail_immediately: true,
            ..Default::default()
        });
        let service = service(bootstrap, &InitBuilder::new(), &ShutdownBuilder::new());

        let err = assert_err!(service.start().await);
        assert!(matches!(err, HostingError::Runtime(_)));
        assert_eq!(service.state(), HostState::Faulted);
        assert!(service.stop_requested().is_cancelled());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let service = service(bootstrap, &InitBuilder::new(), &ShutdownBuilder::new());
        service.start().await.unwrap();
        assert_err!(service.start().await);

        let stop = deadline(Duration::from_secs(1));
        service.stop(stop.token().clone()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_times_out_and_still_runs_shutdown() {
        let bootstrap = Arc::new(ScriptedBootstrap {
            ignore_stop: true,
            ..Default::default()
        });
        let ran_shutdown = Arc::new(AtomicBool::new(false));
        let flag = ran_shutdown.clone();
        let mut shutdown = ShutdownBuilder::new();
        shutdown
            .on_shutdown(PhaseHandler::new(move |_, _| {
                let flag = flag.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .on_shutdown(PhaseHandler::new(|_, _| Box::pin(async { Err("flush failed".into()) })));

        let service = service(bootstrap, &InitBuilder::new(), &shutdown);
        service.start().await.unwrap();

        let stop = deadline(Duration::from_millis(1950));
        let err = assert_err!(service.stop(stop.token().clone()).await);

        assert!(ran_shutdown.load(Ordering::SeqCst));
        assert_eq!(service.state(), HostState::Faulted);
        match err {
            HostingError::Aggregate(agg) => {
                assert_eq!(agg.len(), 2);
                assert_eq!(
                    agg.errors()[0].to_string(),
                    "graceful shutdown did not complete within the allocated period (1.95s)"
                );
                assert!(agg.errors()[1].to_string().contains("flush failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let service = service(bootstrap, &InitBuilder::new(), &ShutdownBuilder::new());
        service.stop(CancellationToken::new()).await.unwrap();
        assert_eq!(service.state(), HostState::Stopped);
    }

    fn counting_shutdown(counter: Arc<AtomicUsize>, fail: bool) -> ShutdownBuilder {
        let mut shutdown = ShutdownBuilder::new();
        shutdown.on_shutdown(PhaseHandler::new(move |_, _| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(BoxError::from("flush failed"));
                }
                Ok(())
            })
        }));
        shutdown
    }

    #[tokio::test]
    async fn stop_during_init_waits_and_never_starts_loop() {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let mut init = InitBuilder::new();
        init.on_init(PhaseHandler::new(move |_, _| {
            let gate = gate.clone();
            Box::pin(async move {
                gate.notified().await;
                Ok(true)
            })
        }));
        let shutdown_runs = Arc::new(AtomicUsize::new(0));
        let shutdown = counting_shutdown(shutdown_runs.clone(), false);

        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let service = Arc::new(service(bootstrap.clone(), &init, &shutdown));

        let starting = tokio::spawn({
            let service = service.clone();
            async move { service.start().await }
        });
        while service.state() != HostState::Starting {
            tokio::task::yield_now().await;
        }

        let stopping = tokio::spawn({
            let service = service.clone();
            async move {
                let stop = deadline(Duration::from_secs(5));
                service.stop(stop.token().clone()).await
            }
        });
        while service.state() != HostState::Stopping {
            tokio::task::yield_now().await;
        }
        assert!(!stopping.is_finished());

        release.notify_one();
        starting.await.unwrap().unwrap();
        stopping.await.unwrap().unwrap();

        assert_eq!(bootstrap.runs.load(Ordering::SeqCst), 0);
        assert_eq!(shutdown_runs.load(Ordering::SeqCst), 1);
        assert_eq!(service.state(), HostState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_on_init_that_never_settles() {
        let mut init = InitBuilder::new();
        init.on_init(PhaseHandler::new(|_, _| {
            Box::pin(async {
                std::future::pending::<()>().await;
                Ok(true)
            })
        }));
        let shutdown_runs = Arc::new(AtomicUsize::new(0));
        let shutdown = counting_shutdown(shutdown_runs.clone(), false);

        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let service = Arc::new(service(bootstrap.clone(), &init, &shutdown));
        let starting = tokio::spawn({
            let service = service.clone();
            async move { service.start().await }
        });
        while service.state() != HostState::Starting {
            tokio::task::yield_now().await;
        }

        let stop = deadline(Duration::from_millis(500));
        let err = assert_err!(service.stop(stop.token().clone()).await);
        assert!(matches!(
            err,
            HostingError::Aggregate(ref agg)
                if agg.len() == 1 && agg.errors()[0].to_string().contains("allocated period")
        ));
        assert_eq!(shutdown_runs.load(Ordering::SeqCst), 0);
        assert_eq!(bootstrap.runs.load(Ordering::SeqCst), 0);
        starting.abort();
    }

    #[tokio::test]
    async fn second_stop_after_failed_stop_is_a_noop() {
        let shutdown_runs = Arc::new(AtomicUsize::new(0));
        let shutdown = counting_shutdown(shutdown_runs.clone(), true);
        let bootstrap = Arc::new(ScriptedBootstrap::default());
        let service = service(bootstrap, &InitBuilder::new(), &shutdown);
        service.start().await.unwrap();

        let stop = deadline(Duration::from_secs(1));
        assert_err!(service.stop(stop.token().clone()).await);
        assert_eq!(service.state(), HostState::Faulted);

        let again = deadline(Duration::from_secs(1));
        service.stop(again.token().clone()).await.unwrap();
        assert_eq!(shutdown_runs.load(Ordering::SeqCst), 1);
        assert_eq!(service.state(), HostState::Faulted);
    }
}
