use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, SyncError};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Runtime settings for the sync layer.
///
/// Loaded in layers, later layers winning: built-in defaults, an optional
/// JSON file, `CRABGRASS_*` environment variables, then CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Backend origin, without a trailing slash.
    pub base_url: String,
    /// Value of the `crabgrass_dev_user` cookie sent with every request.
    pub dev_user: Option<String>,
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Upper bound on one chat send; expiry is treated as a failed send.
    pub send_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Streamed edits with no `end` after this long are dropped.
    pub pending_edit_ttl_secs: u64,
    /// Capacity of each editing session's update broadcast channel.
    pub update_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            dev_user: None,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            send_timeout_secs: 120,
            request_timeout_secs: 30,
            pending_edit_ttl_secs: 300,
            update_buffer: 256,
        }
    }
}

impl SyncConfig {
    pub fn load(file: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self> {
        let file_layer = match file {
            Some(path) => read_json_file(path)?,
            None => empty_object(),
        };
        Self::from_layers(
            file_layer,
            env_layer(|key| std::env::var(key).ok()),
            cli_overrides.unwrap_or_else(empty_object),
        )
    }

    pub fn from_layers(file: Value, env: Value, cli: Value) -> Result<Self> {
        let mut merged = serde_json::to_value(SyncConfig::default())?;
        deep_merge(&mut merged, &file);
        deep_merge(&mut merged, &env);
        deep_merge(&mut merged, &cli);
        let mut config: SyncConfig = serde_json::from_value(merged)
            .map_err(|e| SyncError::InvalidConfig(format!("config does not parse: {}", e)))?;
        config.base_url = config.base_url.trim().trim_end_matches('/').to_string();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(SyncError::InvalidConfig(format!(
                "base_url must be an http(s) origin, got '{}'",
                self.base_url
            )));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "reconnect_base_delay_ms must be positive".to_string(),
            ));
        }
        if self.update_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "update_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pending_edit_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_edit_ttl_secs)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(SyncError::NotFound(format!(
            "config file {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str::<Value>(&raw).map_err(|e| {
        SyncError::InvalidConfig(format!("{} is not valid JSON: {}", path.display(), e))
    })
}

/// Builds the environment layer from a variable lookup.
pub fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(url) = lookup("CRABGRASS_API_URL").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "base_url": url }));
    }
    if let Some(user) = lookup("CRABGRASS_DEV_USER").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "dev_user": user.trim() }));
    }
    if let Some(ms) = lookup("CRABGRASS_RECONNECT_BASE_MS").and_then(|v| parse_u64(&v)) {
        deep_merge(&mut root, &json!({ "reconnect_base_delay_ms": ms }));
    }
    if let Some(max) = lookup("CRABGRASS_MAX_RECONNECT_ATTEMPTS").and_then(|v| parse_u64(&v)) {
        deep_merge(&mut root, &json!({ "max_reconnect_attempts": max }));
    }
    if let Some(secs) = lookup("CRABGRASS_SEND_TIMEOUT_SECS").and_then(|v| parse_u64(&v)) {
        deep_merge(&mut root, &json!({ "send_timeout_secs": secs }));
    }

    root
}

fn parse_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay(), Duration::from_secs(1));
        assert_eq!(config.pending_edit_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn later_layers_win() {
        let file = json!({ "base_url": "http://file:1", "max_reconnect_attempts": 3 });
        let env = json!({ "base_url": "http://env:2/" });
        let cli = json!({ "max_reconnect_attempts": 7 });

        let config = SyncConfig::from_layers(file, env, cli).unwrap();

        assert_eq!(config.base_url, "http://env:2");
        assert_eq!(config.max_reconnect_attempts, 7);
        assert_eq!(config.send_timeout_secs, 120);
    }

    #[test]
    fn env_layer_reads_known_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CRABGRASS_API_URL", "https://crabgrass.example"),
            ("CRABGRASS_DEV_USER", " 0000-sally "),
            ("CRABGRASS_RECONNECT_BASE_MS", "250"),
            ("CRABGRASS_MAX_RECONNECT_ATTEMPTS", "not-a-number"),
        ]);
        let layer = env_layer(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(
            layer,
            json!({
                "base_url": "https://crabgrass.example",
                "dev_user": "0000-sally",
                "reconnect_base_delay_ms": 250
            })
        );
    }

    #[test]
    fn rejects_non_http_base_url() {
        let err = SyncConfig::from_layers(
            json!({ "base_url": "ftp://nope" }),
            empty_object(),
            empty_object(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crabgrass.json");
        std::fs::write(&path, r#"{ "dev_user": "u-1", "send_timeout_secs": 5 }"#).unwrap();

        let value = read_json_file(&path).unwrap();
        let config = SyncConfig::from_layers(value, empty_object(), empty_object()).unwrap();

        assert_eq!(config.dev_user.as_deref(), Some("u-1"));
        assert_eq!(config.send_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
