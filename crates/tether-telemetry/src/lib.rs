//! Tracing subscriber setup for the gateway.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_backend" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Failures setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A level name that `tracing` does not know.
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Parse a level name (`trace`, `debug`, `info`, `warn`, `error`).
pub fn parse_level(name: &str) -> Result<Level, TelemetryError> {
    name.trim()
        .parse::<Level>()
        .map_err(|_| TelemetryError::InvalidLevel(name.to_string()))
}

/// Parse `module => level` pairs into per-module overrides.
pub fn parse_module_levels<'a, I>(modules: I) -> Result<Vec<(String, Level)>, TelemetryError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    modules
        .into_iter()
        .map(|(module, level)| parse_level(level).map(|level| (module.clone(), level)))
        .collect()
}

/// Build the `EnvFilter` directive string for a config.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

/// Initialize the global subscriber. Call once at startup.
///
/// Returns an error rather than panicking if a subscriber is already set.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.module_levels.is_empty());
        assert!(!config.json);
    }

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("tether_backend".into(), Level::DEBUG),
                ("tower_http".into(), Level::ERROR),
            ],
            json: false,
        };
        assert_eq!(
            filter_directives(&config),
            "warn,tether_backend=debug,tower_http=error"
        );
    }

    #[test]
    fn parse_level_names() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_level(" info ").unwrap(), Level::INFO);
        assert!(matches!(
            parse_level("loud"),
            Err(TelemetryError::InvalidLevel(l)) if l == "loud"
        ));
    }

    #[test]
    fn module_levels_parse_or_fail() {
        let mut modules = std::collections::BTreeMap::new();
        let _ = modules.insert("tether_server".to_string(), "debug".to_string());
        let _ = modules.insert("tower_http".to_string(), "warn".to_string());
        assert_eq!(
            parse_module_levels(&modules).unwrap(),
            vec![
                ("tether_server".to_string(), Level::DEBUG),
                ("tower_http".to_string(), Level::WARN),
            ]
        );

        let _ = modules.insert("axum".to_string(), "chatty".to_string());
        assert!(matches!(
            parse_module_levels(&modules),
            Err(TelemetryError::InvalidLevel(l)) if l == "chatty"
        ));
    }

    #[test]
    fn second_init_is_an_error_not_a_panic() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(matches!(init_telemetry(&config), Err(TelemetryError::Init(_))));
    }
}
