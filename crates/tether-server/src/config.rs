//! Server configuration with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If the config file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)
//!
//! CLI flags are applied by the binary after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionSettings;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub max_send_queue: usize,
    /// 0 disables heartbeat pings.
    pub heartbeat_interval_secs: u64,
    /// 0 disables idle reaping.
    pub idle_timeout_secs: u64,
    pub drain_timeout_ms: u64,
    /// Attach timing info to `success` responses.
    pub include_stat: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            drain_timeout_ms: 2000,
            include_stat: true,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_send_queue: self.max_send_queue.max(1),
            heartbeat_interval: self.heartbeat_interval(),
            drain_timeout: self.drain_timeout(),
        }
    }
}

/// Default config file location (`~/.tether/config.json`).
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("config.json")
}

/// Load from `path` (or the default location) and apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let default_path = config_path();
    let path = path.unwrap_or(&default_path);
    let mut config = load_config_file(path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Defaults merged with the file at `path`. A missing file yields defaults;
/// invalid JSON is an error.
pub fn load_config_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        tracing::debug!(?path, "Loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        tracing::debug!(?path, "Config file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key; anything else is replaced. Nulls in `source` are
/// skipped.
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply `TETHER_*` overrides read through `lookup`. Invalid values are
/// ignored with a warning.
pub fn apply_overrides_from(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("TETHER_HOST") {
        config.host = v;
    }
    if let Some(v) = parsed(&read, "TETHER_PORT", |v| v.parse::<u16>().ok()) {
        config.port = v;
    }
    if let Some(v) = parsed(&read, "TETHER_MAX_SEND_QUEUE", |v| {
        parse_usize_range(v, 1, 1_000_000)
    }) {
        config.max_send_queue = v;
    }
    if let Some(v) = parsed(&read, "TETHER_HEARTBEAT_SECS", |v| v.parse::<u64>().ok()) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = parsed(&read, "TETHER_IDLE_TIMEOUT_SECS", |v| v.parse::<u64>().ok()) {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = parsed(&read, "TETHER_INCLUDE_STAT", parse_bool) {
        config.include_stat = v;
    }
    if let Some(v) = parsed(&read, "TETHER_LOG_JSON", parse_bool) {
        config.log_json = v;
    }
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = read(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "Invalid env var, ignoring");
    }
    result
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 9091);
        assert_eq!(c.max_send_queue, 256);
        assert_eq!(c.heartbeat_interval(), Some(Duration::from_secs(30)));
        assert_eq!(c.idle_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(c.drain_timeout(), Duration::from_millis(2000));
        assert!(c.include_stat);
        assert_eq!(c.bind_addr(), "0.0.0.0:9091");
    }

    #[test]
    fn zero_disables_timers() {
        let c = ServerConfig {
            heartbeat_interval_secs: 0,
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(c.heartbeat_interval(), None);
        assert_eq!(c.idle_timeout(), None);
        assert_eq!(c.connection_settings().heartbeat_interval, None);
    }

    #[test]
    fn deep_merge_nested_and_nulls() {
        let target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        let source = json!({"b": {"c": 20}, "e": [9], "a": null, "f": "new"});
        assert_eq!(
            deep_merge(target, source),
            json!({"a": 1, "b": {"c": 20, "d": 3}, "e": [9], "f": "new"})
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = load_config_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(c, ServerConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 8080, "include_stat": false, "host": null}}"#).unwrap();

        let c = load_config_file(file.path()).unwrap();
        assert_eq!(c.port, 8080);
        assert!(!c.include_stat);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.max_send_queue, 256);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            load_config_file(file.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut c = ServerConfig::default();
        apply_overrides_from(
            &mut c,
            env(&[
                ("TETHER_HOST", "127.0.0.1"),
                ("TETHER_PORT", "7000"),
                ("TETHER_MAX_SEND_QUEUE", "64"),
                ("TETHER_HEARTBEAT_SECS", "0"),
                ("TETHER_IDLE_TIMEOUT_SECS", "300"),
                ("TETHER_INCLUDE_STAT", "off"),
                ("TETHER_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 7000);
        assert_eq!(c.max_send_queue, 64);
        assert_eq!(c.heartbeat_interval_secs, 0);
        assert_eq!(c.idle_timeout_secs, 300);
        assert!(!c.include_stat);
        assert!(c.log_json);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut c = ServerConfig::default();
        apply_overrides_from(
            &mut c,
            env(&[
                ("TETHER_PORT", "99999"),
                ("TETHER_MAX_SEND_QUEUE", "0"),
                ("TETHER_INCLUDE_STAT", "maybe"),
                ("TETHER_HOST", ""),
            ]),
        );
        assert_eq!(c, ServerConfig::default());
    }

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }
}
