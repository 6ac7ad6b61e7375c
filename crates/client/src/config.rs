//! Configuration for controllers.
//!
//! This module provides TOML-based configuration loading and saving.
//! The default configuration path is `~/.config/pty-expect/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the helper executable.
pub const HELPER_BINARY: &str = "expect-helper";

/// Default shell prompt pattern.
pub const DEFAULT_PROMPT: &str = r"[\#\$]\s*$";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("handshake_timeout_ms must be between 1 and 600000, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("poll_interval_ms must be between 1 and 10000, got {0}")]
    InvalidPollInterval(u64),

    #[error("wake_interval_ms must be between 1 and 10000, got {0}")]
    InvalidWakeInterval(u64),

    #[error("prompt is not a valid regular expression: {0}")]
    InvalidPrompt(String),

    #[error("linesep must not be empty")]
    EmptyLinesep,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
}

/// Valid log level values for the helper's server log.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Controller-side session behavior.
    pub session: SessionConfig,
    /// How helpers are launched.
    pub helper: HelperConfig,
}

/// Controller-side session behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding session directories.
    pub base_dir: PathBuf,
    /// How long to wait for a helper to announce readiness.
    pub handshake_timeout_ms: u64,
    /// How often reads re-check the output log.
    pub poll_interval_ms: u64,
    /// Default timeout of responsiveness checks.
    pub responsive_timeout_ms: u64,
    /// Appended by `sendline`.
    pub linesep: String,
    /// Text encoding of the child's input and output, as a WHATWG label.
    pub encoding: String,
    /// Prompt pattern of shell sessions.
    pub prompt: String,
    /// Kill the child when a session handle is dropped without closing.
    pub auto_close: bool,
    /// Leave the session directory behind on close.
    pub keep_files: bool,
}

/// How helpers are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HelperConfig {
    /// Helper executable; looked up when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Upper bound on one helper loop wake.
    pub wake_interval_ms: u64,
    /// Shell used to run commands.
    pub shell: PathBuf,
    /// Filter for the helper's server log.
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            handshake_timeout_ms: 10_000,
            poll_interval_ms: 50,
            responsive_timeout_ms: 5_000,
            linesep: "\n".to_string(),
            encoding: "utf-8".to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            auto_close: true,
            keep_files: false,
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            path: None,
            wake_interval_ms: 50,
            shell: PathBuf::from("/bin/bash"),
            log_level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn responsive_timeout(&self) -> Duration {
        Duration::from_millis(self.responsive_timeout_ms)
    }

    /// The configured encoding, UTF-8 if the label is unknown.
    pub fn encoding(&self) -> &'static Encoding {
        Encoding::for_label(self.encoding.as_bytes()).unwrap_or(encoding_rs::UTF_8)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pty-expect")
        .join("config.toml")
}

/// `$TMPDIR`, falling back to `/tmp`.
fn default_base_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - EXPECT_BASE_DIR: Override the session base directory
    /// - EXPECT_HELPER: Override the helper executable
    /// - EXPECT_LOG_LEVEL: Override the helper log level
    /// - EXPECT_DEBUG: Any non-empty value keeps session directories
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_env("EXPECT_BASE_DIR") {
            tracing::info!("Overriding base_dir from environment: {}", dir);
            self.session.base_dir = PathBuf::from(dir);
        }

        if let Some(path) = non_empty_env("EXPECT_HELPER") {
            tracing::info!("Overriding helper path from environment: {}", path);
            self.helper.path = Some(PathBuf::from(path));
        }

        if let Some(level) = non_empty_env("EXPECT_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.helper.log_level = level;
        }

        if non_empty_env("EXPECT_DEBUG").is_some() {
            self.session.keep_files = true;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let handshake = self.session.handshake_timeout_ms;
        if !(1..=600_000).contains(&handshake) {
            return Err(ConfigError::InvalidHandshakeTimeout(handshake));
        }

        let poll = self.session.poll_interval_ms;
        if !(1..=10_000).contains(&poll) {
            return Err(ConfigError::InvalidPollInterval(poll));
        }

        let wake = self.helper.wake_interval_ms;
        if !(1..=10_000).contains(&wake) {
            return Err(ConfigError::InvalidWakeInterval(wake));
        }

        if self.session.linesep.is_empty() {
            return Err(ConfigError::EmptyLinesep);
        }

        Regex::new(&self.session.prompt).map_err(|e| ConfigError::InvalidPrompt(e.to_string()))?;

        if Encoding::for_label(self.session.encoding.as_bytes()).is_none() {
            return Err(ConfigError::UnknownEncoding(self.session.encoding.clone()));
        }

        let level = self.helper.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.helper.log_level.clone()));
        }

        Ok(())
    }

    /// Resolve the helper executable: the configured path, then `PATH`,
    /// then a sibling of the current executable.
    pub fn helper_path(&self) -> PathBuf {
        if let Some(path) = &self.helper.path {
            return path.clone();
        }
        if let Ok(path) = which::which(HELPER_BINARY) {
            return path;
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(HELPER_BINARY)))
            .unwrap_or_else(|| PathBuf::from(HELPER_BINARY))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path, apply environment
    /// overrides and validate the result.
    pub fn load_default() -> Result<Self> {
        let mut config = Self::load(default_config_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.session.linesep, "\n");
        assert_eq!(config.session.prompt, DEFAULT_PROMPT);
        assert!(config.session.auto_close);
        assert!(!config.session.keep_files);
        assert_eq!(config.helper.shell, PathBuf::from("/bin/bash"));
        assert!(config.helper.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            [session]
            poll_interval_ms = 10
            prompt = '> $'

            [helper]
            path = "/opt/bin/expect-helper"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.poll_interval_ms, 10);
        assert_eq!(config.session.prompt, "> $");
        assert_eq!(config.session.handshake_timeout_ms, 10_000);
        assert_eq!(
            config.helper_path(),
            PathBuf::from("/opt/bin/expect-helper")
        );
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let err = Config::from_toml("[session]\npoll_interval_ms = \"fast\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.session.keep_files = true;
        config.helper.log_level = "debug".into();
        let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        let mut config = Config::default();
        config.session.responsive_timeout_ms = 1234;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session.responsive_timeout_ms, 1234);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.session.poll_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPollInterval(0)));

        let mut config = Config::default();
        config.session.prompt = "(".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPrompt(_))
        ));

        let mut config = Config::default();
        config.session.linesep.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyLinesep));

        let mut config = Config::default();
        config.helper.log_level = "loud".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".into()))
        );

        let mut config = Config::default();
        config.session.encoding = "klingon".into();
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownEncoding("klingon".into()))
        );
    }

    #[test]
    fn test_encoding_labels() {
        let mut config = Config::default();
        assert_eq!(config.session.encoding(), encoding_rs::UTF_8);
        config.session.encoding = "latin2".into();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.encoding(), encoding_rs::ISO_8859_2);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("EXPECT_BASE_DIR", "/var/tmp/sessions");
        std::env::set_var("EXPECT_HELPER", "/usr/local/bin/expect-helper");
        std::env::set_var("EXPECT_LOG_LEVEL", "trace");
        std::env::set_var("EXPECT_DEBUG", "1");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("EXPECT_BASE_DIR");
        std::env::remove_var("EXPECT_HELPER");
        std::env::remove_var("EXPECT_LOG_LEVEL");
        std::env::remove_var("EXPECT_DEBUG");

        assert_eq!(config.session.base_dir, PathBuf::from("/var/tmp/sessions"));
        assert_eq!(
            config.helper.path,
            Some(PathBuf::from("/usr/local/bin/expect-helper"))
        );
        assert_eq!(config.helper.log_level, "trace");
        assert!(config.session.keep_files);
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("EXPECT_LOG_LEVEL", "");
        let mut config = Config::default();
        config.apply_env_overrides();
        std::env::remove_var("EXPECT_LOG_LEVEL");
        assert_eq!(config.helper.log_level, "info");
    }
}
