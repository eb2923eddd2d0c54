//! Settings loading: defaults, then the JSON file, then environment.
//!
//! Merge rules: objects merge per key, arrays and scalars are replaced,
//! `null` in the file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::CourierSettings;

/// `~/.courier`, or `/tmp/.courier` without a home directory.
pub fn courier_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier")
}

pub fn settings_path() -> PathBuf {
    courier_home().join("settings.json")
}

/// Resolve the configured database path against `~/.courier`.
pub fn resolve_store_path(settings: &CourierSettings) -> PathBuf {
    let path = PathBuf::from(&settings.store.path);
    if path.is_absolute() {
        path
    } else {
        courier_home().join(path)
    }
}

pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` (missing file means defaults), then apply `COURIER_*`
/// overrides and validate.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

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

/// Apply environment overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning, keeping the file/default value.
pub fn apply_overrides<F>(settings: &mut CourierSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read_string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let read_u64 = |name: &str, min: u64, max: u64| {
        let raw = read_string(name)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = read_string("COURIER_INSTANCE_ID") {
        settings.instance_id = Some(v);
    }
    if let Some(v) = read_string("COURIER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_u64("COURIER_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = read_u64("COURIER_KEEPALIVE_SECS", 1, 3_600) {
        settings.server.keepalive_secs = v;
    }
    if let Some(v) = read_u64("COURIER_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.manager.queue_capacity = v as usize;
    }
    if let Some(v) = read_string("COURIER_STORE_PATH") {
        settings.store.path = v;
    }
    if let Some(v) = read_string("COURIER_EXCHANGE") {
        settings.broker.exchange = v;
    }
    if let Some(v) = read_u64("COURIER_POLL_INTERVAL_MS", 1, 60_000) {
        settings.broker.poll_interval_ms = v;
    }
    if let Some(v) = read_string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_string("COURIER_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 9100, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 7000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 7000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replaced() {
        let merged = deep_merge(serde_json::json!({"a": [1, 2]}), serde_json::json!({"a": [3]}));
        assert_eq!(merged["a"], serde_json::json!([3]));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.server.port, 9100);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"manager": {"queueCapacity": 8}, "broker": {"exchange": "test-x"}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.manager.queue_capacity, 8);
        assert_eq!(settings.broker.exchange, "test-x");
        assert_eq!(settings.broker.poll_interval_ms, 50);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = CourierSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("COURIER_INSTANCE_ID", "node-7"),
                ("COURIER_PORT", "9200"),
                ("COURIER_QUEUE_CAPACITY", "16"),
                ("COURIER_LOG_FORMAT", "compact"),
            ]),
        );
        assert_eq!(settings.instance_id.as_deref(), Some("node-7"));
        assert_eq!(settings.server.port, 9200);
        assert_eq!(settings.manager.queue_capacity, 16);
        assert_eq!(settings.logging.format, "compact");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = CourierSettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("COURIER_PORT", "99999"),
                ("COURIER_QUEUE_CAPACITY", "lots"),
                ("COURIER_HOST", "   "),
            ]),
        );
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.manager.queue_capacity, 1024);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn relative_store_path_resolves_under_home() {
        let settings = CourierSettings::default();
        assert!(resolve_store_path(&settings).ends_with(".courier/courier.db"));

        let mut absolute = CourierSettings::default();
        absolute.store.path = "/var/lib/courier/shared.db".into();
        assert_eq!(resolve_store_path(&absolute), PathBuf::from("/var/lib/courier/shared.db"));
    }

    #[test]
    fn parse_range_bounds() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("x", 1, 10), None);
    }
}
