//! Platform-supplied invocation context.

use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Static function metadata published by the platform through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub function_name: String,
    pub version: String,
    /// Memory limit in MB.
    pub memory_size: u32,
    pub log_group: String,
    pub log_stream: String,
}

impl FunctionConfig {
    /// Read the function metadata from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            function_name: lookup("AWS_LAMBDA_FUNCTION_NAME").unwrap_or_default(),
            version: lookup("AWS_LAMBDA_FUNCTION_VERSION").unwrap_or_default(),
            memory_size: lookup("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            log_group: lookup("AWS_LAMBDA_LOG_GROUP_NAME").unwrap_or_default(),
            log_stream: lookup("AWS_LAMBDA_LOG_STREAM_NAME").unwrap_or_default(),
        }
    }
}

/// Read-only context of one platform invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LambdaContext {
    /// Platform request ID.
    pub request_id: String,
    /// Forced termination time, in Unix epoch milliseconds.
    pub deadline_ms: u64,
    pub invoked_function_arn: String,
    pub xray_trace_id: Option<String>,
    /// Raw client context JSON (mobile SDK invocations).
    pub client_context: Option<String>,
    /// Raw Cognito identity JSON.
    pub identity: Option<String>,
    /// Function metadata.
    pub config: FunctionConfig,
    /// Extra headers passed by the platform that have no dedicated field.
    pub extra: HashMap<String, String>,
}

impl LambdaContext {
    /// Create a context for `request_id` that must finish within `remaining`.
    pub fn new(request_id: impl Into<String>, remaining: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            deadline_ms: now_ms().saturating_add(remaining.as_millis() as u64),
            ..Self::default()
        }
    }

    /// Attach function metadata.
    pub fn with_config(mut self, config: FunctionConfig) -> Self {
        self.config = config;
        self
    }

    /// Time left before the platform terminates the invocation.
    pub fn remaining_time(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(now_ms()))
    }

    /// Memory limit in MB.
    pub fn memory_limit_mb(&self) -> u32 {
        self.config.memory_size
    }

    /// Build a context from the runtime API's `next` response headers.
    ///
    /// Returns `None` when the request ID header is missing.
    pub fn from_headers(headers: &HeaderMap, config: FunctionConfig) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let request_id = get(names::REQUEST_ID).filter(|id| !id.is_empty())?;
        let deadline_ms = get(names::DEADLINE_MS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut extra = HashMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if name.starts_with("lambda-runtime-") && !names::KNOWN.contains(&name) {
                if let Ok(v) = value.to_str() {
                    extra.insert(name.to_string(), v.to_string());
                }
            }
        }

        Some(Self {
            request_id,
            deadline_ms,
            invoked_function_arn: get(names::FUNCTION_ARN).unwrap_or_default(),
            xray_trace_id: get(names::TRACE_ID),
            client_context: get(names::CLIENT_CONTEXT),
            identity: get(names::COGNITO_IDENTITY),
            config,
            extra,
        })
    }
}

pub(crate) mod names {
    pub const REQUEST_ID: &str = "lambda-runtime-aws-request-id";
    pub const DEADLINE_MS: &str = "lambda-runtime-deadline-ms";
    pub const FUNCTION_ARN: &str = "lambda-runtime-invoked-function-arn";
    pub const TRACE_ID: &str = "lambda-runtime-trace-id";
    pub const CLIENT_CONTEXT: &str = "lambda-runtime-client-context";
    pub const COGNITO_IDENTITY: &str = "lambda-runtime-cognito-identity";
    pub const FUNCTION_ERROR_TYPE: &str = "lambda-runtime-function-error-type";

    pub const KNOWN: [&str; 6] = [
        REQUEST_ID,
        DEADLINE_MS,
        FUNCTION_ARN,
        TRACE_ID,
        CLIENT_CONTEXT,
        COGNITO_IDENTITY,
    ];
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
