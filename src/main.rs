//! Fezz Hosting - example Lambda function
//!
//! An API Gateway function with a timing middleware, a per-process counter
//! service and init/shutdown handlers. Run it under the Lambda runtime (or
//! an emulator exposing `AWS_LAMBDA_RUNTIME_API`).

use fezz_hosting::envelopes::{ApiGatewayRequest, ApiGatewayResponse, StatusCode};
use fezz_hosting::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Invocation counter shared by every invocation of this process.
#[derive(Default)]
struct Counter {
    count: AtomicU64,
}

#[derive(Debug, Default, Deserialize)]
struct Greeting {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Reply {
    message: String,
    count: u64,
    request_id: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut builder = LambdaApplicationBuilder::from_env()?;
    builder.services().add_singleton(Counter::default());
    builder.use_json::<ApiGatewayRequest<Greeting>, ApiGatewayResponse<Reply>>();

    builder.use_fn(|ctx, next| {
        Box::pin(async move {
            let started = Instant::now();
            let result = next.call(ctx).await;
            tracing::info!(
                request_id = ctx.request_id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Handled request"
            );
            result
        })
    });

    builder.handle_fn(
        |Event(mut request): Event<ApiGatewayRequest<Greeting>>,
         counter: Service<Counter>,
         lambda: LambdaContext| async move {
            let greeting = match request.body {
                Some(_) => request.parse_body().map(|g| g.name.clone()).unwrap_or(None),
                None => request.query("name").map(str::to_string),
            };
            let name = greeting.unwrap_or_else(|| "World".to_string());
            let count = counter.count.fetch_add(1, Ordering::SeqCst) + 1;

            ApiGatewayResponse::json(
                StatusCode::OK,
                Reply {
                    message: format!("Hello, {name}!"),
                    count,
                    request_id: lambda.request_id,
                },
            )
            .map_err(BoxError::from)
        },
    )?;

    builder.on_init_fn(|counter: Service<Counter>| async move {
        counter.count.store(0, Ordering::SeqCst);
        tracing::info!("Counter initialized");
        Ok::<_, BoxError>(true)
    });

    builder.on_shutdown_fn(|counter: Service<Counter>| async move {
        tracing::info!(
            final_count = counter.count.load(Ordering::SeqCst),
            "Counter shutting down"
        );
        Ok::<_, BoxError>(())
    });

    builder.build()?.run().await?;
    Ok(())
}
