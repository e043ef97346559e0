//! Hosting configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time the platform grants the process between SIGTERM and SIGKILL.
///
/// The platform picks the window from the kind of extensions registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownDuration {
    /// No extensions registered: no shutdown window at all.
    NoExtensions,
    /// Internal extensions only (500 ms).
    InternalExtensions,
    /// External extensions registered (2000 ms).
    ExternalExtensions,
    /// Explicit window in milliseconds.
    Custom(u64),
}

impl ShutdownDuration {
    /// The window as a duration.
    pub fn as_duration(&self) -> Duration {
        match self {
            ShutdownDuration::NoExtensions => Duration::ZERO,
            ShutdownDuration::InternalExtensions => Duration::from_millis(500),
            ShutdownDuration::ExternalExtensions => Duration::from_millis(2000),
            ShutdownDuration::Custom(ms) => Duration::from_millis(*ms),
        }
    }
}

impl Default for ShutdownDuration {
    fn default() -> Self {
        ShutdownDuration::ExternalExtensions
    }
}

/// Configuration for the hosted Lambda service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingOptions {
    /// Subtracted from the platform's remaining time to get the invocation deadline.
    #[serde(with = "duration_ms")]
    pub invocation_cancellation_buffer: Duration,
    /// Ceiling for the whole init phase.
    #[serde(with = "duration_ms")]
    pub init_timeout: Duration,
    /// Shutdown window granted by the platform.
    pub shutdown_duration: ShutdownDuration,
    /// Kept in reserve from the shutdown window.
    #[serde(with = "duration_ms")]
    pub shutdown_duration_buffer: Duration,
    /// Custom runtime API endpoint (`host:port`). Falls back to `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
}

impl Default for HostingOptions {
    fn default() -> Self {
        Self {
            invocation_cancellation_buffer: Duration::from_secs(3),
            init_timeout: Duration::from_secs(15 * 60),
            shutdown_duration: ShutdownDuration::default(),
            shutdown_duration_buffer: Duration::from_millis(50),
            runtime_api: None,
        }
    }
}

impl HostingOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the invocation cancellation buffer.
    pub fn invocation_cancellation_buffer(mut self, buffer: Duration) -> Self {
        self.invocation_cancellation_buffer = buffer;
        self
    }

    /// Set the init phase timeout.
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the shutdown window.
    pub fn shutdown_duration(mut self, duration: ShutdownDuration) -> Self {
        self.shutdown_duration = duration;
        self
    }

    /// Set the shutdown buffer.
    pub fn shutdown_duration_buffer(mut self, buffer: Duration) -> Self {
        self.shutdown_duration_buffer = buffer;
        self
    }

    /// Use a custom runtime API endpoint.
    pub fn runtime_api(mut self, endpoint: impl Into<String>) -> Self {
        self.runtime_api = Some(endpoint.into());
        self
    }

    /// Time available to stop the loop and run shutdown handlers.
    pub fn shutdown_budget(&self) -> Duration {
        self.shutdown_duration
            .as_duration()
            .saturating_sub(self.shutdown_duration_buffer)
    }

    /// Overlay values from the process environment.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.with_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_ms(&lookup, "FEZZ_INVOCATION_CANCELLATION_BUFFER_MS")? {
            self.invocation_cancellation_buffer = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "FEZZ_INIT_TIMEOUT_MS")? {
            self.init_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "FEZZ_SHUTDOWN_DURATION_MS")? {
            self.shutdown_duration = ShutdownDuration::Custom(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "FEZZ_SHUTDOWN_DURATION_BUFFER_MS")? {
            self.shutdown_duration_buffer = Duration::from_millis(ms);
        }
        if self.runtime_api.is_none() {
            self.runtime_api = lookup("AWS_LAMBDA_RUNTIME_API").filter(|v| !v.is_empty());
        }
        Ok(self)
    }
}

fn parse_ms<F>(lookup: &F, name: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOption {
                name: name.to_string(),
                value,
            }),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
