//! Bounded retry with a per-attempt timeout around a [`Resolver`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::backend::Resolver;
use tether_core::config::DispatchSettings;
use tether_core::errors::{BackendError, DispatchError};

/// Resolution attempts started (counter).
pub const DISPATCH_ATTEMPTS_TOTAL: &str = "dispatch_attempts_total";
/// Attempts abandoned at their deadline (counter).
pub const DISPATCH_TIMEOUTS_TOTAL: &str = "dispatch_timeouts_total";
/// Prompts that spent every attempt (counter, labels: kind).
pub const DISPATCH_FAILURES_TOTAL: &str = "dispatch_failures_total";

/// Attempt budget for one prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Attempts per prompt, including the first.
    pub max_attempts: u32,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for DispatchPolicy {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_attempts: settings.max_retries,
            attempt_timeout: settings.attempt_timeout(),
        }
    }
}

enum AttemptOutcome {
    Answered(String),
    Failed(BackendError),
    TimedOut,
}

/// Runs each prompt against the resolver until it answers or the attempt
/// budget is spent.
///
/// Every attempt runs on its own task with its own result channel. When an
/// attempt times out its token is cancelled and its receiver dropped, so a
/// late answer is discarded instead of leaking into the next attempt. The
/// underlying resolution still runs to completion.
pub struct Dispatcher<R: Resolver + ?Sized> {
    resolver: Arc<R>,
    policy: DispatchPolicy,
}

impl<R: Resolver + ?Sized> Clone for Dispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            resolver: Arc::clone(&self.resolver),
            policy: self.policy.clone(),
        }
    }
}

impl<R: Resolver + ?Sized + 'static> Dispatcher<R> {
    /// Wrap `resolver` with the given attempt budget.
    pub fn new(resolver: Arc<R>, policy: DispatchPolicy) -> Self {
        Self { resolver, policy }
    }

    /// Dispatch using the configured policy.
    pub async fn dispatch(&self, prompt: &str) -> Result<String, DispatchError> {
        self.dispatch_with(prompt, self.policy.max_attempts, self.policy.attempt_timeout)
            .await
    }

    async fn dispatch_with(
        &self,
        prompt: &str,
        max_attempts: u32,
        attempt_timeout: Duration,
    ) -> Result<String, DispatchError> {
        for attempt in 1..=max_attempts {
            metrics::counter!(DISPATCH_ATTEMPTS_TOTAL).increment(1);
            let last = attempt == max_attempts;

            match self.attempt(prompt, attempt, attempt_timeout).await {
                AttemptOutcome::Answered(answer) => return Ok(answer),
                AttemptOutcome::Failed(source) => {
                    if last {
                        metrics::counter!(DISPATCH_FAILURES_TOTAL, "kind" => "retries_exhausted")
                            .increment(1);
                        return Err(DispatchError::RetriesExhausted {
                            attempts: attempt,
                            source,
                        });
                    }
                    warn!(attempt, error = %source, "dispatch attempt failed, retrying");
                }
                AttemptOutcome::TimedOut => {
                    metrics::counter!(DISPATCH_TIMEOUTS_TOTAL).increment(1);
                    if last {
                        metrics::counter!(DISPATCH_FAILURES_TOTAL, "kind" => "timeout_exhausted")
                            .increment(1);
                        return Err(DispatchError::TimeoutExhausted {
                            attempts: attempt,
                            timeout: attempt_timeout,
                        });
                    }
                    warn!(
                        attempt,
                        timeout_ms = u64::try_from(attempt_timeout.as_millis()).unwrap_or(u64::MAX),
                        "dispatch attempt timed out, retrying"
                    );
                }
            }
        }

        Err(DispatchError::Unknown)
    }

    async fn attempt(&self, prompt: &str, attempt: u32, timeout: Duration) -> AttemptOutcome {
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();

        let resolver = Arc::clone(&self.resolver);
        let prompt = prompt.to_string();
        let attempt_token = token.clone();
        let _ = tokio::spawn(async move {
            let result = resolver.resolve(&prompt).await;
            if attempt_token.is_cancelled() {
                debug!(attempt, ok = result.is_ok(), "discarding late result of timed-out attempt");
                return;
            }
            let _ = tx.send(result);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(answer))) => AttemptOutcome::Answered(answer),
            Ok(Ok(Err(err))) => AttemptOutcome::Failed(err),
            Ok(Err(_)) => AttemptOutcome::Failed(BackendError::Unavailable(
                "resolution task ended without a result".into(),
            )),
            Err(_) => {
                token.cancel();
                AttemptOutcome::TimedOut
            }
        }
    }
}
