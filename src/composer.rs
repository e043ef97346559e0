//! Per-invocation orchestration.
//!
//! Turns the composed middleware chain into the `(bytes, context) -> bytes`
//! function the polling loop drives.

use crate::cancellation::CancellationFactory;
use crate::context::{InvocationContext, LambdaContext};
use crate::error::{BoxError, HostingError};
use crate::pipeline::{DelegateRegistry, EventDeserializer, InvocationDelegate, ResponseSerializer};
use crate::services::ScopeFactory;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// The function handed to the polling loop.
pub type RawHandler = Arc<
    dyn Fn(Bytes, LambdaContext) -> BoxFuture<'static, Result<Bytes, HostingError>> + Send + Sync,
>;

/// Runs one invocation end to end: token, context, codecs, chain, cleanup.
pub struct HandlerComposer {
    chain: InvocationDelegate,
    deserializer: Option<EventDeserializer>,
    serializer: Option<ResponseSerializer>,
    scopes: Arc<dyn ScopeFactory>,
    cancellation: Arc<dyn CancellationFactory>,
}

impl HandlerComposer {
    /// `chain` is the built pipeline; codec hooks are taken from `registry`.
    pub fn new(
        chain: InvocationDelegate,
        registry: &DelegateRegistry,
        scopes: Arc<dyn ScopeFactory>,
        cancellation: Arc<dyn CancellationFactory>,
    ) -> Self {
        Self {
            chain,
            deserializer: registry.deserializer().cloned(),
            serializer: registry.serializer().cloned(),
            scopes,
            cancellation,
        }
    }

    /// Process one invocation.
    ///
    /// The scope, if one was created, is disposed before this returns on
    /// every path. Without a serializer the output is empty.
    pub async fn invoke(
        &self,
        raw: Bytes,
        lambda: LambdaContext,
        stopping: &CancellationToken,
    ) -> Result<Bytes, HostingError> {
        let span = info_span!("invocation", request_id = %lambda.request_id);
        let deadline = self.cancellation.create(&lambda, stopping);

        async move {
            let started = Instant::now();
            let mut ctx = InvocationContext::new(
                Arc::new(lambda),
                raw.clone(),
                self.scopes.clone(),
                deadline.token().clone(),
            );

            let outcome = AssertUnwindSafe(self.run(&mut ctx, raw)).catch_unwind().await;
            ctx.close().await;
            drop(deadline);

            let result = match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(into_hosting_error(err)),
                Err(panic) => Err(HostingError::from_panic(panic)),
            };

            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Invocation finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, ctx: &mut InvocationContext, raw: Bytes) -> Result<Bytes, BoxError> {
        if let Some(deserializer) = &self.deserializer {
            deserializer.deserialize(ctx, raw).await?;
        }

        self.chain.call(ctx).await?;

        match &self.serializer {
            Some(serializer) => serializer.serialize(ctx).await,
            None => Ok(Bytes::new()),
        }
    }

    /// Bind the composer to the service's stopping token.
    pub fn into_raw_handler(self, stopping: CancellationToken) -> RawHandler {
        let composer = Arc::new(self);
        Arc::new(
            move |raw: Bytes, lambda: LambdaContext| -> BoxFuture<'static, Result<Bytes, HostingError>> {
                let composer = composer.clone();
                let stopping = stopping.clone();
                Box::pin(async move { composer.invoke(raw, lambda, &stopping).await })
            },
        )
    }
}

/// Keep engine errors as they are; wrap anything from user code.
fn into_hosting_error(err: BoxError) -> HostingError {
    match err.downcast::<HostingError>() {
        Ok(err) => *err,
        Err(err) => HostingError::Invocation(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::BufferedDeadline;
    use crate::pipeline::{Event, InvocationBuilder, Middleware};
    use crate::services::testing::CountingScopes;
    use crate::services::ServiceCollection;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn composer(builder: &InvocationBuilder, scopes: Arc<dyn ScopeFactory>) -> HandlerComposer {
        HandlerComposer::new(
            builder.build().unwrap(),
            builder.registry(),
            scopes,
            Arc::new(BufferedDeadline::new(Duration::from_millis(100))),
        )
    }

    fn lambda() -> LambdaContext {
        LambdaContext::new("req-1", Duration::from_secs(30))
    }

    fn passthrough(builder: &mut InvocationBuilder) {
        builder
            .deserializer(EventDeserializer::from_fn(|raw: &[u8]| {
                Ok(String::from_utf8(raw.to_vec())?)
            }))
            .serializer(ResponseSerializer::from_fn(|response: &String| {
                Ok(Bytes::from(response.clone()))
            }));
    }

    fn marker(log: Arc<Mutex<Vec<String>>>, name: &'static str) -> Middleware {
        Middleware::from_fn(move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(format!("{name}-before"));
                let result = next.call(ctx).await;
                log.lock().push(format!("{name}-after"));
                result
            })
        })
    }

    #[tokio::test]
    async fn echo_through_logging_and_auth() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = InvocationBuilder::new();
        passthrough(&mut builder);
        builder
            .use_middleware(marker(log.clone(), "Logging"))
            .use_middleware(marker(log.clone(), "Auth"));

        let echo_log = log.clone();
        builder
            .handle_fn(move |Event(input): Event<String>| {
                let log = echo_log.clone();
                async move {
                    log.lock().push("Echo".to_string());
                    Ok::<_, BoxError>(input)
                }
            })
            .unwrap();

        let composer = composer(&builder, Arc::new(ServiceCollection::new().build()));
        let output = composer
            .invoke(Bytes::from_static(b"ping"), lambda(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.as_ref(), b"ping");
        assert_eq!(
            *log.lock(),
            vec!["Logging-before", "Auth-before", "Echo", "Auth-after", "Logging-after"]
        );
    }

    #[tokio::test]
    async fn json_round_trip_is_identity() {
        let mut builder = InvocationBuilder::new();
        builder.use_json::<serde_json::Value, serde_json::Value>();
        builder
            .handle_fn(|Event(value): Event<serde_json::Value>| async move {
                Ok::<_, BoxError>(value)
            })
            .unwrap();

        let input = br#"{"id":7,"tags":["a","b"],"nested":{"ok":true}}"#;
        let output = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::from_static(input), lambda(), &CancellationToken::new())
            .await
            .unwrap();

        let expected: serde_json::Value = serde_json::from_slice(input).unwrap();
        let actual: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn missing_serializer_yields_empty_output() {
        let mut builder = InvocationBuilder::new();
        builder
            .handle(InvocationDelegate::new(|ctx| {
                Box::pin(async move {
                    ctx.set_response(String::from("ignored"));
                    Ok(())
                })
            }))
            .unwrap();

        let output = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::from_static(b"anything"), lambda(), &CancellationToken::new())
            .await;
        assert!(assert_ok!(output).is_empty());
    }

    #[tokio::test]
    async fn raw_bytes_bind_without_a_deserializer() {
        let mut builder = InvocationBuilder::new();
        builder.serializer(ResponseSerializer::from_fn(|response: &Bytes| Ok(response.clone())));
        builder
            .handle_fn(|Event(raw): Event<Bytes>| async move {
                let mut out = raw.to_vec();
                out.push(b'!');
                Ok::<_, BoxError>(Bytes::from(out))
            })
            .unwrap();

        let output = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::from_static(b"raw"), lambda(), &CancellationToken::new())
            .await;
        assert_eq!(assert_ok!(output).as_ref(), b"raw!");
    }

    #[tokio::test]
    async fn scope_is_not_created_when_unused() {
        let scopes = CountingScopes::new(ServiceCollection::new().build());
        let mut builder = InvocationBuilder::new();
        builder
            .handle(InvocationDelegate::new(|_ctx| Box::pin(async { Ok(()) })))
            .unwrap();

        assert_ok!(
            composer(&builder, scopes.clone())
                .invoke(Bytes::new(), lambda(), &CancellationToken::new())
                .await
        );
        assert_eq!(scopes.created(), 0);
        assert_eq!(scopes.disposed(), 0);
    }

    fn scope_touching(fail: bool) -> InvocationBuilder {
        let mut builder = InvocationBuilder::new();
        builder
            .handle(InvocationDelegate::new(move |ctx| {
                Box::pin(async move {
                    let _ = ctx.service::<String>();
                    if fail {
                        return Err("handler failed".into());
                    }
                    Ok(())
                })
            }))
            .unwrap();
        builder
    }

    #[tokio::test]
    async fn scope_is_disposed_once_on_success_and_failure() {
        for fail in [false, true] {
            let scopes = CountingScopes::new(ServiceCollection::new().build());
            let result = composer(&scope_touching(fail), scopes.clone())
                .invoke(Bytes::new(), lambda(), &CancellationToken::new())
                .await;

            assert_eq!(result.is_err(), fail);
            assert_eq!(scopes.created(), 1);
            assert_eq!(scopes.disposed(), 1);
        }
    }

    #[tokio::test]
    async fn handler_error_propagates_as_invocation_error() {
        let result = composer(&scope_touching(true), Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::new(), lambda(), &CancellationToken::new())
            .await;

        match assert_err!(result) {
            HostingError::Invocation(err) => assert_eq!(err.to_string(), "handler failed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn panic_is_caught_and_scope_disposed() {
        let scopes = CountingScopes::new(ServiceCollection::new().build());
        let mut builder = InvocationBuilder::new();
        builder
            .handle(InvocationDelegate::new(|ctx| {
                Box::pin(async move {
                    let _ = ctx.service::<String>();
                    panic!("kaboom");
                })
            }))
            .unwrap();

        let result = composer(&builder, scopes.clone())
            .invoke(Bytes::new(), lambda(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(HostingError::HandlerPanicked(ref m)) if m == "kaboom"));
        assert_eq!(scopes.disposed(), 1);
    }

    #[tokio::test]
    async fn deserialization_failure_skips_handler() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();

        let mut builder = InvocationBuilder::new();
        builder.use_json::<serde_json::Value, serde_json::Value>();
        builder
            .handle(InvocationDelegate::new(move |_ctx| {
                let flag = flag.clone();
                Box::pin(async move {
                    *flag.lock() = true;
                    Ok(())
                })
            }))
            .unwrap();

        let result = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::from_static(b"{not json"), lambda(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(HostingError::Invocation(_))));
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn binding_errors_keep_their_kind() {
        let mut builder = InvocationBuilder::new();
        builder
            .handle_fn(|Event(n): Event<u64>| async move { Ok::<_, BoxError>(n) })
            .unwrap();

        let result = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::new(), lambda(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HostingError::Binding(_))));
    }

    #[tokio::test]
    async fn handler_sees_stopping_token() {
        let mut builder = InvocationBuilder::new();
        builder
            .handle_fn(|token: CancellationToken| async move {
                Ok::<_, BoxError>(token.is_cancelled())
            })
            .unwrap();
        builder.serializer(ResponseSerializer::from_fn(|cancelled: &bool| {
            Ok(Bytes::from(cancelled.to_string()))
        }));

        let stopping = CancellationToken::new();
        stopping.cancel();
        let output = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .invoke(Bytes::new(), lambda(), &stopping)
            .await
            .unwrap();
        assert_eq!(output.as_ref(), b"true");
    }

    #[tokio::test]
    async fn raw_handler_drives_composer() {
        let mut builder = InvocationBuilder::new();
        passthrough(&mut builder);
        builder
            .handle_fn(|Event(input): Event<String>| async move {
                Ok::<_, BoxError>(input.to_uppercase())
            })
            .unwrap();

        let raw = composer(&builder, Arc::new(ServiceCollection::new().build()))
            .into_raw_handler(CancellationToken::new());
        let output = raw(Bytes::from_static(b"hello"), lambda()).await.unwrap();
        assert_eq!(output.as_ref(), b"HELLO");
    }
}
