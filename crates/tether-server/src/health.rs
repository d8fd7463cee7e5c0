//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tether_backend::BackendStatus;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Live WebSocket connections.
    pub connections: usize,
    /// Per-backend failover state. `None` whenever a resolution holds the
    /// pool lock, which under steady traffic can be most of the time.
    pub backends: Option<Vec<BackendStatus>>,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    started_at: DateTime<Utc>,
    connections: usize,
    backends: Option<Vec<BackendStatus>>,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        started_at,
        connections,
        backends,
    }
}
