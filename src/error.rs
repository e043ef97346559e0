//! Error taxonomy for the hosting engine.
//!
//! User code (middleware, handlers, lifecycle phases, codec hooks) returns
//! [`BoxError`] so `?` works on any error type. The engine wraps those into
//! [`HostingError`] at the boundary of each unit of work.

use std::fmt;
use std::time::Duration;

/// Boxed error returned by user-authored code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used by the engine.
pub type Result<T, E = HostingError> = std::result::Result<T, E>;

/// Configuration errors, raised while the application is being assembled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `handle` was called a second time on the same builder.
    #[error("invocation handler already set")]
    HandlerAlreadySet,

    /// `build` was called before a terminal handler was registered.
    #[error("invocation handler not set; call `handle` before `build`")]
    HandlerNotSet,

    /// No runtime API endpoint configured and `AWS_LAMBDA_RUNTIME_API` unset.
    #[error("runtime API endpoint not configured (set AWS_LAMBDA_RUNTIME_API)")]
    MissingRuntimeApi,

    /// An option could not be parsed.
    #[error("invalid value {value:?} for option `{name}`")]
    InvalidOption { name: String, value: String },
}

/// Errors raised by the hosting engine.
#[derive(Debug, thiserror::Error)]
pub enum HostingError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// One or more init handlers failed.
    #[error("init phase failed: {0}")]
    Init(AggregateError),

    /// One or more shutdown handlers failed.
    #[error("shutdown phase failed: {0}")]
    Shutdown(AggregateError),

    /// The invocation loop did not stop within the shutdown budget.
    #[error("graceful shutdown did not complete within the allocated period ({0:?})")]
    ShutdownTimeout(Duration),

    /// Deserialization, handler or serialization failure for one invocation.
    #[error("invocation failed: {0}")]
    Invocation(#[source] BoxError),

    /// A user future panicked.
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    /// A handler parameter could not be resolved for this unit of work.
    #[error("parameter binding failed: {0}")]
    Binding(String),

    /// Unrecoverable failure talking to the platform.
    #[error("runtime API error: {0}")]
    Runtime(String),

    /// Several independent failures surfaced together.
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl HostingError {
    /// Short type name reported to the platform on invocation failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            HostingError::Config(_) => "Hosting.ConfigError",
            HostingError::Init(_) => "Hosting.InitError",
            HostingError::Shutdown(_) => "Hosting.ShutdownError",
            HostingError::ShutdownTimeout(_) => "Hosting.ShutdownTimeout",
            HostingError::Invocation(_) => "Hosting.InvocationError",
            HostingError::HandlerPanicked(_) => "Hosting.HandlerPanicked",
            HostingError::Binding(_) => "Hosting.BindingError",
            HostingError::Runtime(_) => "Hosting.RuntimeError",
            HostingError::Aggregate(_) => "Hosting.AggregateError",
        }
    }

    /// Turn a payload caught by `catch_unwind` into an error.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HostingError::HandlerPanicked(message)
    }
}

/// A set of errors collected from concurrently executed units of work.
///
/// No member masks another: every captured error is kept and displayed.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<BoxError>,
}

impl AggregateError {
    /// Create an aggregate from the collected errors.
    pub fn new(errors: Vec<BoxError>) -> Self {
        Self { errors }
    }

    /// Append one more error.
    pub fn push(&mut self, error: impl Into<BoxError>) {
        self.errors.push(error.into());
    }

    /// The collected errors, in completion-independent registration order.
    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Flatten into the underlying errors.
    pub fn into_errors(self) -> Vec<BoxError> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "; [{}] {}", i, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_error() {
        let mut agg = AggregateError::default();
        agg.push("first");
        agg.push(std::io::Error::new(std::io::ErrorKind::Other, "second"));

        let text = agg.to_string();
        assert_eq!(agg.len(), 2);
        assert!(text.starts_with("2 error(s) occurred"));
        assert!(text.contains("[0] first"));
        assert!(text.contains("[1] second"));
    }

    #[test]
    fn shutdown_timeout_is_distinct() {
        let err = HostingError::ShutdownTimeout(Duration::from_millis(1950));
        assert_eq!(err.error_type(), "Hosting.ShutdownTimeout");
        assert!(err
            .to_string()
            .contains("graceful shutdown did not complete within the allocated period"));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let err = HostingError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "handler panicked: boom");

        let err = HostingError::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "handler panicked: bang");

        let err = HostingError::from_panic(Box::new(7_u8));
        assert_eq!(err.to_string(), "handler panicked: non-string panic payload");
    }

    #[test]
    fn config_errors_convert() {
        let err: HostingError = ConfigError::HandlerAlreadySet.into();
        assert!(matches!(err, HostingError::Config(ConfigError::HandlerAlreadySet)));
    }
}
