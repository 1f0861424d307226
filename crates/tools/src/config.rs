//! `timssdr-info` configuration file

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use timssdr::EngineConfig;
use timssdr::list::USB_MAX_SERIAL_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoConfig {
    #[serde(default = "InfoConfig::default_log_level")]
    pub log_level: String,
    /// Only report boards whose serial number ends with this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            serial: None,
            engine: EngineConfig::default(),
        }
    }
}

impl InfoConfig {
    fn default_log_level() -> String {
        "warn".to_string()
    }

    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: InfoConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// `~/.config/timssdr/info.toml` on Linux
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("timssdr").join("info.toml")
        } else {
            PathBuf::from(".config/timssdr/info.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Some(serial) = &self.serial
            && (serial.is_empty() || serial.chars().count() > USB_MAX_SERIAL_LENGTH)
        {
            return Err(anyhow!(
                "Serial number filter must be 1 to {} characters",
                USB_MAX_SERIAL_LENGTH
            ));
        }

        self.engine
            .validate()
            .map_err(|e| anyhow!("Invalid engine configuration: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InfoConfig::default();
        assert_eq!(config.log_level, "warn");
        assert!(config.serial.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let config = InfoConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_long_serial() {
        let config = InfoConfig {
            serial: Some("0".repeat(33)),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_engine_table() {
        let config: InfoConfig = toml::from_str(
            r#"
            log_level = "debug"

            [engine]
            transfer_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.transfer_count, 8);
        assert_eq!(config.engine.transfer_buffer_size, 262_144);
        assert!(config.validate().is_ok());
    }
}
