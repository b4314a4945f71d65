//! Configuration of a display session.
//!
//! A [`SessionConfig`] is passed explicitly to the session factory, so every
//! construction-time choice (preview, device node, flip timeout) is fixed
//! before the device is opened. It deserializes from TOML; missing fields take
//! the defaults from the [`defaults`] module and unknown fields are rejected.
//!
//! ```toml
//! preview = true
//! display_mode = "overlay"
//! flip_timeout_ms = 1000
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Which hardware path `render_buffer` presents through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Nothing selected; presented like `Primary`.
    None,
    /// Full CRTC scan-out: mode-set once, page flip afterwards.
    #[default]
    Primary,
    /// Overlay plane updates on top of whatever the CRTC scans out.
    Overlay,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file from {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

pub mod defaults {
    use std::path::PathBuf;

    pub fn default_card_node_base() -> PathBuf {
        PathBuf::from("/dev/dri/card")
    }

    pub fn default_render_node_base() -> PathBuf {
        PathBuf::from("/dev/dri/renderD")
    }

    pub fn default_max_nodes() -> u32 {
        16
    }

    pub fn default_flip_timeout_ms() -> u64 {
        3000
    }

    pub fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn default_log_format() -> String {
        "text".to_string()
    }
}

/// Logging settings for processes embedding the display session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn" or "error".
    #[serde(default = "defaults::default_log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "defaults::default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::default_log_level(),
            format: defaults::default_log_format(),
        }
    }
}

/// Construction-time settings of a display session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Whether the session may drive a local on-screen display. Without it,
    /// device discovery prefers render nodes and `render_init` is refused.
    #[serde(default)]
    pub preview: bool,
    /// Open exactly this node instead of scanning.
    #[serde(default)]
    pub device_path: Option<PathBuf>,
    #[serde(default = "defaults::default_card_node_base")]
    pub card_node_base: PathBuf,
    #[serde(default = "defaults::default_render_node_base")]
    pub render_node_base: PathBuf,
    /// Number of nodes probed per node family.
    #[serde(default = "defaults::default_max_nodes")]
    pub max_nodes: u32,
    /// How long a page flip waits for its completion event.
    #[serde(default = "defaults::default_flip_timeout_ms")]
    pub flip_timeout_ms: u64,
    #[serde(default)]
    pub display_mode: DisplayMode,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview: false,
            device_path: None,
            card_node_base: defaults::default_card_node_base(),
            render_node_base: defaults::default_render_node_base(),
            max_nodes: defaults::default_max_nodes(),
            flip_timeout_ms: defaults::default_flip_timeout_ms(),
            display_mode: DisplayMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Default configuration with local preview enabled.
    pub fn with_preview() -> Self {
        Self {
            preview: true,
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_nodes == 0 {
            return Err(ConfigError::ValidationError("max_nodes must be at least 1".to_string()));
        }
        if self.flip_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("flip_timeout_ms must be non-zero".to_string()));
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!("Invalid log level: {}", other)));
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::ValidationError(format!("Invalid log format: {}", other))),
        }
    }

    pub fn flip_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(!config.preview);
        assert_eq!(config.device_path, None);
        assert_eq!(config.card_node_base, PathBuf::from("/dev/dri/card"));
        assert_eq!(config.max_nodes, 16);
        assert_eq!(config.flip_timeout(), Duration::from_secs(3));
        assert_eq!(config.display_mode, DisplayMode::Primary);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_equals_default() {
        assert_eq!(SessionConfig::from_toml_str("").unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_parse_full() {
        let config = SessionConfig::from_toml_str(
            r#"
            preview = true
            device_path = "/dev/dri/card1"
            display_mode = "overlay"
            flip_timeout_ms = 500

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        assert!(config.preview);
        assert_eq!(config.device_path, Some(PathBuf::from("/dev/dri/card1")));
        assert_eq!(config.display_mode, DisplayMode::Overlay);
        assert_eq!(config.flip_timeout_ms, 500);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SessionConfig::from_toml_str("previw = true").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation_errors() {
        let err = SessionConfig::from_toml_str("max_nodes = 0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = SessionConfig::from_toml_str("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("loud")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "preview = true").unwrap();
        let config = SessionConfig::load(file.path()).unwrap();
        assert!(config.preview);

        let missing = SessionConfig::load(Path::new("/nonexistent/novade-display.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::ReadError { .. }));
    }
}
