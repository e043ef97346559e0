//! Deadline-bound cancellation for invocations and lifecycle phases.
//!
//! Every token handed to user code is a child of a process-level token, so
//! it observes cancellation when either its own deadline or the parent fires.

use crate::context::LambdaContext;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A token that trips at a deadline, linked to a parent token.
///
/// Dropping the source stops its timer without cancelling the token.
#[derive(Debug)]
pub struct DeadlineSource {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineSource {
    /// Create a child of `parent` that also trips after `after`.
    ///
    /// A zero duration trips immediately. Must be called inside a Tokio runtime
    /// unless `after` is zero.
    pub fn linked(parent: &CancellationToken, after: Duration) -> Self {
        let token = parent.child_token();
        if after.is_zero() {
            token.cancel();
            return Self { token, timer: None };
        }

        let timer_token = token.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    trace!(after_ms = after.as_millis() as u64, "Deadline reached");
                    timer_token.cancel();
                }
                _ = timer_token.cancelled() => {}
            }
        });

        Self {
            token,
            timer: Some(timer),
        }
    }

    /// The linked token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for DeadlineSource {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Derives the per-invocation cancellation source from the platform context.
pub trait CancellationFactory: Send + Sync {
    fn create(&self, lambda: &LambdaContext, stopping: &CancellationToken) -> DeadlineSource;
}

/// Trips `remaining - buffer` from now; immediately when that is zero or negative.
#[derive(Debug, Clone, Copy)]
pub struct BufferedDeadline {
    buffer: Duration,
}

impl BufferedDeadline {
    pub fn new(buffer: Duration) -> Self {
        Self { buffer }
    }

    /// Time from now until the invocation token trips.
    pub fn delay_for(&self, remaining: Duration) -> Duration {
        remaining.saturating_sub(self.buffer)
    }
}

impl CancellationFactory for BufferedDeadline {
    fn create(&self, lambda: &LambdaContext, stopping: &CancellationToken) -> DeadlineSource {
        DeadlineSource::linked(stopping, self.delay_for(lambda.remaining_time()))
    }
}
