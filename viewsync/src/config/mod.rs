//! Engine configuration.
//!
//! Loaded from a TOML file whose sections mirror the engine's parts. Every
//! field has a default, so an empty file (or no file) is a valid config.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::bridge::BridgeConfig;
use crate::hub::HubConfig;
use crate::llm::LlmConfig;
use crate::state::{PlacementConfig, MAX_LAYOUT_COLUMNS};

/// Largest accepted placement cell, in canvas pixels.
pub const MAX_CELL_SIZE: i32 = 10_000;

/// Environment variable consulted for the model API key.
pub const API_KEY_ENV: &str = "VIEWSYNC_LLM_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8844".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSyncConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub bridge: BridgeConfig,
    pub llm: LlmConfig,
    pub placement: PlacementConfig,
}

impl ViewSyncConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ViewSyncConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fill the API key from the environment when the file left it unset.
    pub fn apply_env(&mut self) {
        if self.llm.api_key.is_none() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                if !key.trim().is_empty() {
                    self.llm.api_key = Some(key);
                }
            }
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| ConfigError::invalid("server.bind_addr", format!("{e}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::invalid(
                "server.ws_path",
                "must start with `/`",
            ));
        }

        let hub = &self.hub;
        if hub.ping_interval_secs == 0 {
            return Err(ConfigError::invalid("hub.ping_interval_secs", "must be > 0"));
        }
        if hub.write_deadline_secs == 0 {
            return Err(ConfigError::invalid("hub.write_deadline_secs", "must be > 0"));
        }
        if hub.read_deadline_secs <= hub.ping_interval_secs {
            return Err(ConfigError::invalid(
                "hub.read_deadline_secs",
                "must be longer than the ping interval",
            ));
        }
        if hub.outbound_capacity == 0 {
            return Err(ConfigError::invalid("hub.outbound_capacity", "must be > 0"));
        }

        if self.bridge.model_timeout_secs == 0 {
            return Err(ConfigError::invalid("bridge.model_timeout_secs", "must be > 0"));
        }

        let placement = &self.placement;
        if placement.cell_size <= 0 || placement.cell_size > MAX_CELL_SIZE {
            return Err(ConfigError::invalid(
                "placement.cell_size",
                format!("must be within 1..={MAX_CELL_SIZE}"),
            ));
        }
        if placement.columns == 0 || placement.rows == 0 {
            return Err(ConfigError::invalid(
                "placement.columns",
                "grid needs at least one row and one column",
            ));
        }
        if placement.columns > MAX_LAYOUT_COLUMNS || placement.rows > MAX_LAYOUT_COLUMNS {
            return Err(ConfigError::invalid(
                "placement.columns",
                format!("grid is limited to {MAX_LAYOUT_COLUMNS}x{MAX_LAYOUT_COLUMNS}"),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::invalid("llm.temperature", "must be within 0.0..=2.0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ViewSyncConfig::from_toml_str("").expect("defaults are valid");
        assert_eq!(config, ViewSyncConfig::default());
        assert_eq!(config.server.bind_addr, "127.0.0.1:8844");
        assert_eq!(config.hub.ping_interval_secs, 30);
        assert_eq!(config.bridge.model_timeout_secs, 30);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
            [hub]
            ping_interval_secs = 5
            read_deadline_secs = 15

            [llm]
            provider = "anthropic"
            model = "claude-3-5-sonnet-latest"
        "#;
        let config = ViewSyncConfig::from_toml_str(raw).expect("parse");
        assert_eq!(config.hub.ping_interval_secs, 5);
        assert_eq!(config.hub.write_deadline_secs, 10);
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.llm.max_tokens, 1000);
        assert_eq!(config.placement.cell_size, 220);
    }

    #[test]
    fn read_deadline_must_outlast_ping_interval() {
        let raw = "[hub]\nping_interval_secs = 30\nread_deadline_secs = 30\n";
        assert!(matches!(
            ViewSyncConfig::from_toml_str(raw),
            Err(ConfigError::Invalid {
                field: "hub.read_deadline_secs",
                ..
            })
        ));
    }

    #[test]
    fn huge_cell_size_is_rejected() {
        let raw = "[placement]\ncell_size = 2147483647\n";
        assert!(matches!(
            ViewSyncConfig::from_toml_str(raw),
            Err(ConfigError::Invalid {
                field: "placement.cell_size",
                ..
            })
        ));
    }

    #[test]
    fn bad_bind_addr_is_rejected() {
        let raw = "[server]\nbind_addr = \"not an address\"\n";
        assert!(ViewSyncConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn file_round_trip() {
        let mut config = ViewSyncConfig::default();
        config.bridge.history_limit = 7;
        config.server.ws_path = "/live".to_string();

        let file = tempfile::NamedTempFile::new().expect("temp file");
        config.save_to_file(file.path()).expect("save");
        let loaded = ViewSyncConfig::load_from_file(file.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[hub\nping = ").expect("write");
        assert!(matches!(
            ViewSyncConfig::load_from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
