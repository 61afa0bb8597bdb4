//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`QuarrySettings::default()`]
//! 2. If `~/.quarry/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `QUARRY_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{PollingSettings, QuarrySettings};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// `~/.quarry/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".quarry").join("settings.json")
}

pub fn load_settings() -> Result<QuarrySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<QuarrySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults with the file merged over them, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<QuarrySettings> {
    let defaults = serde_json::to_value(QuarrySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let settings: QuarrySettings = serde_json::from_value(merged)?;
    validate_polling(&settings.polling)?;
    Ok(settings)
}

/// Reject poll timings that would turn the status loop into a busy poll or
/// shrink its interval.
pub fn validate_polling(polling: &PollingSettings) -> Result<()> {
    if polling.interval_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "polling.intervalMs must be greater than 0".into(),
        ));
    }
    if !polling.multiplier.is_finite() || polling.multiplier < 1.0 {
        return Err(SettingsError::InvalidValue(format!(
            "polling.multiplier must be a finite number >= 1, got {}",
            polling.multiplier
        )));
    }
    if polling.max_interval_ms < polling.interval_ms {
        return Err(SettingsError::InvalidValue(format!(
            "polling.maxIntervalMs ({}) is below polling.intervalMs ({})",
            polling.max_interval_ms, polling.interval_ms
        )));
    }
    if polling.max_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "polling.maxAttempts must be at least 1".into(),
        ));
    }
    Ok(())
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `QUARRY_*` environment variables. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut QuarrySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable lookup.
pub fn apply_overrides(settings: &mut QuarrySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("QUARRY_BASE_URL") {
        settings.backend.base_url = v;
    }
    if let Some(v) = read("QUARRY_TOKEN") {
        settings.query.token = Some(SecretString::from(v));
    }
    if let Some(v) = read("QUARRY_MODEL") {
        settings.query.model = v;
    }
    if let Some(v) = read("QUARRY_KB_LIST") {
        let kbs = parse_list(&v);
        if kbs.is_empty() {
            warn!(key = "QUARRY_KB_LIST", "empty knowledge base list env var, ignoring");
        } else {
            settings.query.kb_list = kbs;
        }
    }
    if let Some(v) = read("QUARRY_STREAM") {
        match parse_bool(&v) {
            Some(stream) => settings.query.stream = stream,
            None => warn!(key = "QUARRY_STREAM", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("QUARRY_LOG_LEVEL") {
        match parse_log_level(&v) {
            Some(level) => settings.logging.level = level,
            None => warn!(key = "QUARRY_LOG_LEVEL", value = %v, "invalid log level env var, ignoring"),
        }
    }
    if let Some(v) = read("QUARRY_POLL_MAX_ATTEMPTS") {
        match parse_u32_range(&v, 1, 10_000) {
            Some(n) => settings.polling.max_attempts = n,
            None => warn!(key = "QUARRY_POLL_MAX_ATTEMPTS", value = %v, "invalid attempt count env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated, blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn parse_log_level(val: &str) -> Option<String> {
    let level = val.trim().to_lowercase();
    LOG_LEVELS.contains(&level.as_str()).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"backend": {"baseUrl": "a", "queryPath": "/q"}});
        let source = serde_json::json!({"backend": {"baseUrl": "b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["backend"]["baseUrl"], "b");
        assert_eq!(merged["backend"]["queryPath"], "/q");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"kbList": ["a", "b"]});
        let source = serde_json::json!({"kbList": ["c"]});
        assert_eq!(deep_merge(target, source)["kbList"], serde_json::json!(["c"]));
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
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_file_layer ─────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings.backend.base_url, "http://localhost:8000");
        assert_eq!(settings.polling.max_attempts, 120);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"backend": {"baseUrl": "https://kb.example.com"}, "polling": {"maxAttempts": 5}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.backend.base_url, "https://kb.example.com");
        assert_eq!(settings.backend.stream_path, "/api/chat/stream");
        assert_eq!(settings.polling.max_attempts, 5);
        assert_eq!(settings.polling.interval_ms, 2_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_file_layer(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn bad_poll_timings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        for polling in [
            r#"{"multiplier": -1.5}"#,
            r#"{"intervalMs": 0}"#,
            r#"{"maxIntervalMs": 500}"#,
            r#"{"maxAttempts": 0}"#,
        ] {
            std::fs::write(&path, format!(r#"{{"polling": {polling}}}"#)).unwrap();
            let err = load_file_layer(&path).unwrap_err();
            assert_eq!(err.error_kind(), "invalid_value", "{polling}");
        }
    }

    #[test]
    fn default_poll_timings_are_valid() {
        assert!(validate_polling(&PollingSettings::default()).is_ok());
        let mut polling = PollingSettings::default();
        polling.multiplier = f64::NAN;
        assert!(matches!(
            validate_polling(&polling),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut settings = QuarrySettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("QUARRY_BASE_URL", "https://kb.internal"),
                ("QUARRY_TOKEN", "secret-token"),
                ("QUARRY_MODEL", "gpt-4o"),
                ("QUARRY_KB_LIST", "kb-a, ,kb-b"),
                ("QUARRY_STREAM", "off"),
                ("QUARRY_LOG_LEVEL", "DEBUG"),
                ("QUARRY_POLL_MAX_ATTEMPTS", "7"),
            ]),
        );

        assert_eq!(settings.backend.base_url, "https://kb.internal");
        assert_eq!(
            settings.query.token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("secret-token".to_string())
        );
        assert_eq!(settings.query.model, "gpt-4o");
        assert_eq!(settings.query.kb_list, vec!["kb-a", "kb-b"]);
        assert!(!settings.query.stream);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.polling.max_attempts, 7);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = QuarrySettings::default();
        apply_overrides(
            &mut settings,
            env(&[
                ("QUARRY_STREAM", "maybe"),
                ("QUARRY_LOG_LEVEL", "loud"),
                ("QUARRY_POLL_MAX_ATTEMPTS", "0"),
                ("QUARRY_KB_LIST", " , "),
                ("QUARRY_BASE_URL", ""),
            ]),
        );

        let defaults = QuarrySettings::default();
        assert!(settings.query.stream);
        assert_eq!(settings.logging.level, defaults.logging.level);
        assert_eq!(settings.polling.max_attempts, defaults.polling.max_attempts);
        assert!(settings.query.kb_list.is_empty());
        assert_eq!(settings.backend.base_url, defaults.backend.base_url);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool(""), None);
        assert_eq!(parse_u32_range("42", 1, 100), Some(42));
        assert_eq!(parse_u32_range("101", 1, 100), None);
        assert_eq!(parse_u32_range("-1", 1, 100), None);
        assert_eq!(parse_list("a,b ,,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_log_level(" Info "), Some("info".to_string()));
    }
}
