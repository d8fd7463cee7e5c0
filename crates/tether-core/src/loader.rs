//! Configuration loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewayConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::errors::ConfigError;

/// Default config location (`~/.tether/config.json`).
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("config.json")
}

/// Load configuration from `path` and apply env overrides.
///
/// A missing file yields defaults. Unreadable files or invalid JSON are errors.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let defaults = serde_json::to_value(GatewayConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: GatewayConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Some(v) = read_env_string("TETHER_HOST") {
        config.server.host = v;
    }
    if let Some(v) = read_env_u16("TETHER_PORT", 0, 65535) {
        config.server.port = v;
    }
    if let Some(v) = read_env_string("TETHER_WS_PATH") {
        config.server.ws_path = v;
    }
    if let Some(v) = read_env_u32("TETHER_MAX_RETRIES", 1, 100) {
        config.dispatch.max_retries = v;
    }
    if let Some(v) = read_env_u64("TETHER_ATTEMPT_TIMEOUT_MS", 1, 600_000) {
        config.dispatch.attempt_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_PONG_WAIT_MS", 100, 3_600_000) {
        config.session.pong_wait_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_WRITE_WAIT_MS", 1, 600_000) {
        config.session.write_wait_ms = v;
    }
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        config.logging.level = v;
    }
    if let Some(v) = read_env_bool("TETHER_LOG_JSON") {
        config.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an integer, rejecting values outside `min..=max`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_num<T>(name: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let val = std::env::var(name).ok()?;
    let result = parse_in_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    read_env_num(name, min, max)
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    read_env_num(name, min, max)
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    read_env_num(name, min, max)
}
