//! Gateway configuration model.
//!
//! Every section is defaulted so a partial JSON file only needs to name the
//! values it changes. Durations are stored as milliseconds and exposed as
//! [`Duration`] through accessor methods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Root configuration for the gateway process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    /// Listener and HTTP surface.
    pub server: ServerSettings,
    /// Per-connection liveness.
    pub session: SessionSettings,
    /// Retry budget per prompt.
    pub dispatch: DispatchSettings,
    /// Backend failover thresholds.
    pub failover: FailoverSettings,
    /// Ordered backends. The first one starts active.
    pub backends: Vec<BackendSpec>,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            dispatch: DispatchSettings::default(),
            failover: FailoverSettings::default(),
            backends: reference_backends(),
            logging: LoggingSettings::default(),
        }
    }
}

/// The three built-in providers served when no backends are configured.
pub fn reference_backends() -> Vec<BackendSpec> {
    vec![
        BackendSpec::new(
            "provider-1",
            "Provider 1: I'm sorry, I don't understand the question.",
        )
        .answer("What is your name?", "I am Provider 1.")
        .answer("How are you?", "Provider 1 is functioning well.")
        .answer("Hi", "Hello from Provider 1"),
        BackendSpec::new("provider-2", "Provider 2: I cannot process that request.")
            .answer("What is your name?", "I am Provider 2.")
            .answer("How are you?", "Provider 2 is operational.")
            .answer("Hi", "Greetings from Provider 2"),
        BackendSpec::new(
            "provider-3",
            "Provider 3: Sorry, I don't have a response for that.",
        )
        .answer("What is your name?", "I am Provider 3.")
        .answer("How are you?", "Provider 3 is up and running.")
        .answer("Hi", "Hi from Provider 3"),
    ]
}

/// Listener and HTTP surface settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Exact-match `Origin` allow list. Empty accepts every origin.
    pub allowed_origins: Vec<String>,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Upper bound on graceful shutdown before open tasks are abandoned.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws".to_string(),
            allowed_origins: Vec::new(),
            max_message_size: 64 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    /// Graceful shutdown bound.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Whether an upgrade carrying `origin` may proceed.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|o| self.allowed_origins.iter().any(|allowed| allowed == o))
    }
}

/// Connection liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long to wait for a pong before the read deadline expires.
    pub pong_wait_ms: u64,
    /// Heartbeat interval. Derived from `pong_wait_ms` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_period_ms: Option<u64>,
    /// Deadline for writing a control probe.
    pub write_wait_ms: u64,
    /// Close the connection after reporting a dispatch failure to the peer.
    pub close_on_dispatch_failure: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pong_wait_ms: 60_000,
            ping_period_ms: None,
            write_wait_ms: 10_000,
            close_on_dispatch_failure: true,
        }
    }
}

impl SessionSettings {
    /// Read deadline extension granted by each acknowledgement.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Heartbeat interval: the configured value, or 90% of the pong wait.
    pub fn ping_period(&self) -> Duration {
        match self.ping_period_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.pong_wait() * 9 / 10,
        }
    }

    /// Deadline for a single outbound write.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

/// Retry budget for a single inbound prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Attempts per prompt, including the first.
    pub max_retries: u32,
    /// Time each attempt may take before it is abandoned.
    pub attempt_timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl DispatchSettings {
    /// Per-attempt timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Backend failover policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverSettings {
    /// Lookups slower than this count as slow responses.
    pub latency_threshold_ms: u64,
    /// Error score above which the pool rotates to the next backend.
    pub switch_threshold: f64,
    /// Amount added to a backend's error score per slow response.
    pub error_increment: f64,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 2_000,
            switch_threshold: 0.5,
            error_increment: 1.0,
        }
    }
}

impl FailoverSettings {
    /// Slowest acceptable lookup.
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }
}

/// Static definition of one backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSpec {
    /// Unique name, used in logs, metrics and `/health`.
    pub name: String,
    /// Exact prompt to answer table.
    pub answers: HashMap<String, String>,
    /// Answer for prompts missing from the table.
    pub fallback: String,
    /// Simulated lookup delay applied to every prompt.
    pub latency_ms: u64,
    /// Per-prompt delay overrides.
    pub prompt_latency_ms: HashMap<String, u64>,
}

impl BackendSpec {
    /// A backend with an empty answer table and no simulated latency.
    pub fn new(name: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fallback: fallback.into(),
            ..Self::default()
        }
    }

    /// Add one entry to the answer table.
    pub fn answer(mut self, prompt: impl Into<String>, answer: impl Into<String>) -> Self {
        let _ = self.answers.insert(prompt.into(), answer.into());
        self
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Per-module level overrides, e.g. `{"tether_backend": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(invalid("at least one backend is required"));
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(invalid("backend name must not be empty"));
            }
            if !seen.insert(backend.name.as_str()) {
                return Err(invalid(format!("duplicate backend name '{}'", backend.name)));
            }
        }
        if self.dispatch.max_retries == 0 {
            return Err(invalid("dispatch.maxRetries must be at least 1"));
        }
        if self.dispatch.attempt_timeout_ms == 0 {
            return Err(invalid("dispatch.attemptTimeoutMs must be positive"));
        }
        if self.session.pong_wait_ms == 0 || self.session.write_wait_ms == 0 {
            return Err(invalid("session timeouts must be positive"));
        }
        let ping = self.session.ping_period();
        if ping.is_zero() || ping >= self.session.pong_wait() {
            return Err(invalid("session ping period must be positive and shorter than pongWaitMs"));
        }
        if !(self.failover.switch_threshold > 0.0) || !(self.failover.error_increment > 0.0) {
            return Err(invalid("failover thresholds must be positive"));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(invalid("server.wsPath must start with '/'"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> GatewayConfig {
        GatewayConfig {
            backends: vec![BackendSpec::new("a", "fallback a")],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn reference_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.ws_path, "/ws");
        assert_eq!(cfg.dispatch.max_retries, 3);
        assert_eq!(cfg.dispatch.attempt_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.session.pong_wait(), Duration::from_secs(60));
        assert_eq!(cfg.session.ping_period(), Duration::from_secs(54));
        assert_eq!(cfg.session.write_wait(), Duration::from_secs(10));
        assert_eq!(cfg.failover.latency_threshold(), Duration::from_secs(2));
        assert!((cfg.failover.switch_threshold - 0.5).abs() < f64::EPSILON);
        assert!((cfg.failover.error_increment - 1.0).abs() < f64::EPSILON);
        assert!(cfg.session.close_on_dispatch_failure);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn reference_catalog() {
        let backends = reference_backends();
        let names: Vec<_> = backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["provider-1", "provider-2", "provider-3"]);
        assert_eq!(
            backends[1].answers.get("Hi").map(String::as_str),
            Some("Greetings from Provider 2")
        );
        assert_eq!(
            backends[2].fallback,
            "Provider 3: Sorry, I don't have a response for that."
        );
        assert!(backends.iter().all(|b| b.latency_ms == 0));
    }

    #[test]
    fn explicit_ping_period_wins() {
        let settings = SessionSettings {
            ping_period_ms: Some(1_000),
            ..SessionSettings::default()
        };
        assert_eq!(settings.ping_period(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: GatewayConfig =
            serde_json::from_str(r#"{"server":{"port":9000},"dispatch":{"maxRetries":5}}"#).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.dispatch.max_retries, 5);
        assert_eq!(cfg.dispatch.attempt_timeout_ms, 5_000);
    }

    #[test]
    fn backend_latencies_from_json() {
        let spec: BackendSpec = serde_json::from_str(
            r#"{"name":"a","answers":{"Hi":"hello"},"latencyMs":10,"promptLatencyMs":{"Hi":3000}}"#,
        )
        .unwrap();
        assert_eq!(spec.latency_ms, 10);
        assert_eq!(spec.prompt_latency_ms.get("Hi"), Some(&3_000));
        assert_eq!(spec.answers.get("Hi").map(String::as_str), Some("hello"));
        assert!(spec.fallback.is_empty());
    }

    #[test]
    fn logging_module_levels_from_json() {
        let cfg: GatewayConfig =
            serde_json::from_str(r#"{"logging":{"modules":{"tether_backend":"debug"}}}"#).unwrap();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(
            cfg.logging.modules.get("tether_backend").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn origin_policy() {
        let mut server = ServerSettings::default();
        assert!(server.origin_allowed(None));
        assert!(server.origin_allowed(Some("http://evil.example")));

        server.allowed_origins = vec!["http://localhost:3000".into()];
        assert!(server.origin_allowed(Some("http://localhost:3000")));
        assert!(!server.origin_allowed(Some("http://evil.example")));
        assert!(!server.origin_allowed(None));
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_backends() {
        let mut cfg = valid();
        cfg.backends.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one backend"));
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let mut cfg = valid();
        cfg.backends.push(BackendSpec::new("a", "again"));
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn validate_rejects_zero_retries() {
        let mut cfg = valid();
        cfg.dispatch.max_retries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_ping_not_shorter_than_pong() {
        let mut cfg = valid();
        cfg.session.ping_period_ms = Some(cfg.session.pong_wait_ms);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_thresholds_and_path() {
        let mut cfg = valid();
        cfg.failover.switch_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.failover.error_increment = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.server.ws_path = "ws".into();
        assert!(cfg.validate().is_err());
    }
}
