//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SyncSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `STORESYNC_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::SyncSettings;

/// Resolve the default settings file path (`~/.storesync/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".storesync").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or a failed validation is an
/// error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let mut settings = read_file_layer(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.validate()?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (normally `std::env::var`).
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.string("STORESYNC_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number("STORESYNC_PORT", 0, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("STORESYNC_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = env.number("STORESYNC_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.number("STORESYNC_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.server.send_queue_capacity = v;
    }
    if let Some(v) = env.number("STORESYNC_LIVENESS_INTERVAL_MS", 10, 3_600_000) {
        settings.liveness.interval_ms = v;
    }
    if let Some(v) = env.string("STORESYNC_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.boolean("STORESYNC_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a boolean env value.
///
/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn number<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = (self.lookup)(name)?;
        let result = parse_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    // ── file layer ──────────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_file_layer(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9191}, "liveness": {"intervalMs": 5000}}"#,
        )
        .unwrap();

        let settings = read_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9191);
        assert_eq!(settings.server.ws_path, "/ws");
        assert_eq!(settings.liveness.interval_ms, 5000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = read_file_layer(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"liveness": {"intervalMs": 0}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue(_)));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply() {
        let mut settings = SyncSettings::default();
        apply_overrides(
            &mut settings,
            env_of(&[
                ("STORESYNC_HOST", "127.0.0.1"),
                ("STORESYNC_PORT", "3001"),
                ("STORESYNC_LIVENESS_INTERVAL_MS", "1500"),
                ("STORESYNC_LOG_JSON", "yes"),
                ("STORESYNC_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 3001);
        assert_eq!(settings.liveness.interval_ms, 1500);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_overrides_ignored() {
        let mut settings = SyncSettings::default();
        apply_overrides(
            &mut settings,
            env_of(&[
                ("STORESYNC_PORT", "not-a-port"),
                ("STORESYNC_MAX_CONNECTIONS", "0"),
                ("STORESYNC_LOG_JSON", "maybe"),
                ("STORESYNC_HOST", ""),
            ]),
        );
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_range::<u64>("50", 10, 100), Some(50));
        assert_eq!(parse_range::<u64>("5", 10, 100), None);
        assert_eq!(parse_range::<u16>("70000", 0, u16::MAX), None);
    }
}
