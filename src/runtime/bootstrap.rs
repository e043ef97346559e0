//! The polling loop.

use super::api::RuntimeApiClient;
use crate::composer::RawHandler;
use crate::error::HostingError;
use crate::options::HostingOptions;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives invocations into a [`RawHandler`] until stopped.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Run until `stopping` fires or the loop fails. An in-flight invocation
    /// is allowed to finish; it observes `stopping` through its own token.
    async fn run(&self, handler: RawHandler, stopping: CancellationToken) -> Result<(), HostingError>;

    /// Tell the platform that initialization failed.
    async fn report_init_error(&self, _error: &HostingError) -> Result<(), HostingError> {
        Ok(())
    }
}

/// [`Bootstrap`] over the Lambda Runtime API.
#[derive(Debug)]
pub struct RuntimeBootstrap {
    client: Option<Arc<RuntimeApiClient>>,
    options: HostingOptions,
}

impl RuntimeBootstrap {
    /// The client is built from `options` (or the environment) when the loop starts.
    pub fn new(options: HostingOptions) -> Self {
        Self {
            client: None,
            options,
        }
    }

    /// Use a preconfigured client.
    pub fn with_client(client: RuntimeApiClient) -> Self {
        Self {
            client: Some(Arc::new(client)),
            options: HostingOptions::default(),
        }
    }

    fn client(&self) -> Result<Arc<RuntimeApiClient>, HostingError> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => Ok(Arc::new(RuntimeApiClient::from_options(&self.options)?)),
        }
    }
}

#[async_trait]
impl Bootstrap for RuntimeBootstrap {
    async fn run(&self, handler: RawHandler, stopping: CancellationToken) -> Result<(), HostingError> {
        let client = self.client()?;
        info!(endpoint = client.base_url(), "Polling loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = stopping.cancelled() => {
                    info!("Polling loop stopped");
                    return Ok(());
                }
                next = client.next_invocation() => next,
            };

            let invocation = match next {
                Ok(invocation) => invocation,
                Err(HostingError::Invocation(err)) => {
                    warn!(error = %err, "Skipping malformed invocation");
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "Polling loop failed");
                    return Err(err);
                }
            };

            let request_id = invocation.context.request_id.clone();
            match handler(invocation.payload, invocation.context).await {
                Ok(output) => client.send_response(&request_id, output).await?,
                Err(err) => {
                    error!(request_id = %request_id, error = %err, "Invocation failed");
                    client.send_error(&request_id, &err).await?;
                }
            }
        }
    }

    async fn report_init_error(&self, error: &HostingError) -> Result<(), HostingError> {
        self.client()?.send_init_error(error).await
    }
}
