//! On-disk configuration: the model-mapping table with server binding, and
//! the optional local API key. Both files live in the per-user config
//! directory and hot-reload through the watcher.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";
pub const API_KEY_FILE: &str = "apikey.json";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8082
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Client-supplied model id → upstream model id. Unknown ids pass
    /// through unchanged.
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

/// When present, every /v1 route requires this key; when absent, all local
/// callers are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

pub fn api_key_path(dir: &Path) -> PathBuf {
    dir.join(API_KEY_FILE)
}

/// Missing file means defaults; a malformed file is an error the caller
/// decides how to treat.
pub fn load_config(dir: &Path) -> Result<AppConfig, ConfigError> {
    match fs::read(config_path(dir)) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn load_api_key(dir: &Path) -> Result<Option<ApiKeyRecord>, ConfigError> {
    match fs::read(api_key_path(dir)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8082);
        assert!(config.model_mapping.is_empty());
        assert_eq!(load_api_key(dir.path()).unwrap(), None);
    }

    #[test]
    fn mapping_passes_unknown_models_through() {
        let mut config = AppConfig::default();
        config
            .model_mapping
            .insert("gpt-4".into(), "claude-sonnet-4-5".into());
        assert_eq!(config.map_model("gpt-4"), "claude-sonnet-4-5");
        assert_eq!(config.map_model("claude-opus-4-1"), "claude-opus-4-1");
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempdir().unwrap();
        let raw = r#"{
            "modelMapping": {"gpt-4": "claude-sonnet-4-5"},
            "server": {"host": "0.0.0.0", "port": 9000}
        }"#;
        fs::write(config_path(dir.path()), raw).unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.map_model("gpt-4"), "claude-sonnet-4-5");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn api_key_file_parses() {
        let dir = tempdir().unwrap();
        fs::write(
            api_key_path(dir.path()),
            r#"{"key": "local-secret", "createdAt": "2025-06-01T00:00:00Z"}"#,
        )
        .unwrap();
        let record = load_api_key(dir.path()).unwrap().unwrap();
        assert_eq!(record.key, "local-secret");
    }
}
