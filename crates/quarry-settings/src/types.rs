//! Settings type definitions.
//!
//! All field names are camelCase in JSON. Every section is `#[serde(default)]`
//! so a partial file only has to name what it changes.

use std::collections::BTreeMap;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "backend": { "baseUrl": "https://kb.example.com" },
///   "query": { "kbList": ["kb-main"], "stream": true }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuarrySettings {
    pub backend: BackendSettings,
    pub query: QuerySettings,
    pub polling: PollingSettings,
    pub logging: LoggingSettings,
}

/// Endpoint layout and timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub base_url: String,
    pub stream_path: String,
    pub query_path: String,
    pub upload_path: String,
    pub status_path: String,
    pub delete_path: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            stream_path: "/api/chat/stream".to_string(),
            query_path: "/api/chat".to_string(),
            upload_path: "/api/documents/upload".to_string(),
            status_path: "/api/documents/status".to_string(),
            delete_path: "/api/documents/delete".to_string(),
            connect_timeout_ms: 30_000,
            request_timeout_ms: 120_000,
            idle_timeout_ms: 90_000,
        }
    }
}

impl BackendSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Defaults for every submitted query.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySettings {
    /// Never written back out.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub token: Option<SecretString>,
    pub model: String,
    pub kb_list: Vec<String>,
    pub documents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    pub stream: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            token: None,
            model: "gpt-4o-mini".to_string(),
            kb_list: Vec::new(),
            documents: Vec::new(),
            temperature: None,
            max_tokens: None,
            response_format: None,
            stream: true,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|v| !v.trim().is_empty()).map(SecretString::from))
}

/// Document status poll timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingSettings {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            interval_ms: 2_000,
            multiplier: 1.5,
            max_interval_ms: 30_000,
            max_attempts: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    pub json: bool,
    /// Per-module overrides, e.g. `{"quarry_client": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
