//! Lambda Runtime API client.

use crate::context::{names, FunctionConfig, LambdaContext};
use crate::error::{ConfigError, HostingError};
use crate::options::HostingOptions;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Runtime API version path segment.
pub const API_VERSION: &str = "2018-06-01";

/// One invocation fetched from `/runtime/invocation/next`.
#[derive(Debug, Clone)]
pub struct NextInvocation {
    pub payload: Bytes,
    pub context: LambdaContext,
}

/// Error document accepted by the `error` endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub error_message: String,
    pub error_type: String,
}

impl From<&HostingError> for ErrorReport {
    fn from(err: &HostingError) -> Self {
        Self {
            error_message: err.to_string(),
            error_type: err.error_type().to_string(),
        }
    }
}

/// HTTP/1.1 client for the platform's polling protocol.
#[derive(Clone)]
pub struct RuntimeApiClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: String,
    config: FunctionConfig,
}

impl RuntimeApiClient {
    /// `endpoint` is `host:port`, optionally prefixed with `http://`.
    pub fn new(endpoint: impl AsRef<str>, config: FunctionConfig) -> Self {
        let endpoint = endpoint.as_ref().trim_end_matches('/');
        let base = if endpoint.starts_with("http://") {
            format!("{endpoint}/{API_VERSION}")
        } else {
            format!("http://{endpoint}/{API_VERSION}")
        };

        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base,
            config,
        }
    }

    /// Build from the configured endpoint, falling back to `AWS_LAMBDA_RUNTIME_API`.
    pub fn from_options(options: &HostingOptions) -> Result<Self, ConfigError> {
        let endpoint = options
            .runtime_api
            .clone()
            .or_else(|| std::env::var("AWS_LAMBDA_RUNTIME_API").ok())
            .filter(|endpoint| !endpoint.is_empty())
            .ok_or(ConfigError::MissingRuntimeApi)?;
        Ok(Self::new(endpoint, FunctionConfig::from_env()))
    }

    /// Base URL including the API version.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Block until the platform hands out the next invocation.
    ///
    /// A response without a request ID is an [`HostingError::Invocation`]
    /// (nothing to report it against); any transport failure is
    /// [`HostingError::Runtime`].
    pub async fn next_invocation(&self) -> Result<NextInvocation, HostingError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/runtime/invocation/next", self.base))
            .body(Full::new(Bytes::new()))
            .map_err(runtime_error)?;

        let response = self.client.request(request).await.map_err(runtime_error)?;
        let status = response.status();
        let (parts, body) = response.into_parts();
        let payload = body.collect().await.map_err(runtime_error)?.to_bytes();

        if !status.is_success() {
            return Err(HostingError::Runtime(format!(
                "next invocation returned {status}"
            )));
        }

        let context = LambdaContext::from_headers(&parts.headers, self.config.clone()).ok_or_else(
            || HostingError::Invocation("next invocation response carries no request id".into()),
        )?;

        debug!(
            request_id = %context.request_id,
            bytes = payload.len(),
            "Received invocation"
        );
        Ok(NextInvocation { payload, context })
    }

    /// Report a successful invocation.
    pub async fn send_response(&self, request_id: &str, body: Bytes) -> Result<(), HostingError> {
        let uri = format!("{}/runtime/invocation/{request_id}/response", self.base);
        self.post(uri, body, None).await
    }

    /// Report a failed invocation.
    pub async fn send_error(&self, request_id: &str, error: &HostingError) -> Result<(), HostingError> {
        let uri = format!("{}/runtime/invocation/{request_id}/error", self.base);
        self.post_error(uri, error).await
    }

    /// Report a failed initialization. The platform will not hand out invocations afterwards.
    pub async fn send_init_error(&self, error: &HostingError) -> Result<(), HostingError> {
        let uri = format!("{}/runtime/init/error", self.base);
        self.post_error(uri, error).await
    }

    async fn post_error(&self, uri: String, error: &HostingError) -> Result<(), HostingError> {
        let report = ErrorReport::from(error);
        let body = serde_json::to_vec(&report).map_err(runtime_error)?;
        self.post(uri, Bytes::from(body), Some(&report.error_type)).await
    }

    async fn post(
        &self,
        uri: String,
        body: Bytes,
        error_type: Option<&str>,
    ) -> Result<(), HostingError> {
        let mut builder = Request::builder().method(Method::POST).uri(&uri);
        if let Some(error_type) = error_type {
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .header(names::FUNCTION_ERROR_TYPE, error_type);
        }
        let request = builder.body(Full::new(body)).map_err(runtime_error)?;

        let response = self.client.request(request).await.map_err(runtime_error)?;
        check_accepted(&uri, response).await
    }
}

impl std::fmt::Debug for RuntimeApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApiClient")
            .field("base", &self.base)
            .field("function", &self.config.function_name)
            .finish()
    }
}

async fn check_accepted<B>(uri: &str, response: Response<B>) -> Result<(), HostingError>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    let status = response.status();
    if status == StatusCode::ACCEPTED || status.is_success() {
        return Ok(());
    }

    let body = match response.into_body().collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(err) => err.to_string(),
    };
    warn!(uri, %status, body = %body, "Runtime API rejected request");
    Err(HostingError::Runtime(format!("{uri} returned {status}: {body}")))
}

fn runtime_error(err: impl std::fmt::Display) -> HostingError {
    HostingError::Runtime(err.to_string())
}
