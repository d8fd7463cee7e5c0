//! Error taxonomy shared by the backend pool, dispatcher and config loader.

use std::time::Duration;

/// Failures raised by the backend pool while resolving a single prompt.
///
/// A prompt missing from a backend's answer table is not represented here:
/// it resolves successfully to that backend's fallback answer.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The active backend answered too slowly but its error score did not
    /// cross the switch threshold, so no failover happened.
    #[error("response time exceeded acceptable limits ({backend} took {latency:?})")]
    SlowResponse {
        /// Backend that answered slowly.
        backend: String,
        /// Measured lookup time.
        latency: Duration,
    },
    /// Every backend was tried once within a single resolution and none
    /// produced a timely answer.
    #[error("all providers failed ({tried} tried)")]
    AllBackendsExhausted {
        /// Backends tried before giving up.
        tried: usize,
    },
    /// A pluggable backend reported that it cannot serve requests.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SlowResponse { .. } => "slow_response",
            Self::AllBackendsExhausted { .. } => "all_backends_exhausted",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Terminal outcome of a dispatch that used up its attempt budget.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// The last attempt failed with a backend error.
    #[error("all retries failed: {source}")]
    RetriesExhausted {
        /// Attempts consumed.
        attempts: u32,
        /// Failure of the last attempt.
        #[source]
        source: BackendError,
    },
    /// The last attempt did not finish within the per-attempt timeout.
    #[error("response timeout: all retries failed")]
    TimeoutExhausted {
        /// Attempts consumed.
        attempts: u32,
        /// Per-attempt timeout that each attempt hit.
        timeout: Duration,
    },
    /// The attempt loop ended without an outcome (only reachable with a zero
    /// attempt budget).
    #[error("unknown error")]
    Unknown,
}

impl DispatchError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::TimeoutExhausted { .. } => "timeout_exhausted",
            Self::Unknown => "unknown",
        }
    }

    /// Number of attempts consumed before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } | Self::TimeoutExhausted { attempts, .. } => {
                *attempts
            }
            Self::Unknown => 0,
        }
    }
}

/// Errors raised while loading or validating gateway configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON for [`GatewayConfig`](crate::config::GatewayConfig).
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but breaks a cross-field rule.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
