//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

/// Cloud API connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Bearer token issued by the tracking portal
    pub bearer_token: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
}

/// Polling and pagination configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_scan_interval_s")]
    pub scan_interval_s: u64,

    #[serde(default = "default_fetch_extended")]
    pub fetch_extended: bool,

    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            scan_interval_s: default_scan_interval_s(),
            fetch_extended: default_fetch_extended(),
            page_size: default_page_size(),
            max_rows: default_max_rows(),
            max_pages: default_max_pages(),
        }
    }
}

// Default value functions
fn default_base_url() -> String { "https://api.cloudappapi.com/publicapi/v1".to_string() }
fn default_timeout_s() -> u64 { 20 }

fn default_scan_interval_s() -> u64 { 300 }
fn default_fetch_extended() -> bool { true }
fn default_page_size() -> u32 { 200 }
fn default_max_rows() -> usize { 500 }
fn default_max_pages() -> u32 { 100 }

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use fleet_poll::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.api.bearer_token.trim().is_empty() {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("bearer_token cannot be empty")
            ));
        }

        if self.api.base_url.is_empty() {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("base_url cannot be empty")
            ));
        }

        // A finite per-request timeout is mandatory: the refresh cycle has no
        // deadline of its own.
        if self.api.timeout_s == 0 || self.api.timeout_s > 300 {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("timeout_s must be between 1 and 300")
            ));
        }

        if self.poll.scan_interval_s < 5 {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("scan_interval_s must be at least 5")
            ));
        }

        if self.poll.page_size == 0 || self.poll.page_size > 1000 {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("page_size must be between 1 and 1000")
            ));
        }

        if self.poll.max_rows == 0 {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("max_rows must be greater than 0")
            ));
        }

        if self.poll.max_pages == 0 || self.poll.max_pages > 10_000 {
            return Err(crate::error::FleetPollError::Config(
                toml::de::Error::custom("max_pages must be between 1 and 10000")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            api: ApiConfig {
                bearer_token: "token-123".to_string(),
                base_url: default_base_url(),
                timeout_s: default_timeout_s(),
            },
            poll: PollConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [api]
            bearer_token = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.base_url, "https://api.cloudappapi.com/publicapi/v1");
        assert_eq!(config.api.timeout_s, 20);
        assert_eq!(config.poll.scan_interval_s, 300);
        assert!(config.poll.fetch_extended);
        assert_eq!(config.poll.page_size, 200);
        assert_eq!(config.poll.max_rows, 500);
        assert_eq!(config.poll.max_pages, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut config = valid_config();
        config.api.bearer_token = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = valid_config();
        config.api.timeout_s = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_scan_interval_rejected() {
        let mut config = valid_config();
        config.poll.scan_interval_s = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_pages_rejected() {
        let mut config = valid_config();
        config.poll.max_pages = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_page_size_rejected() {
        let mut config = valid_config();
        config.poll.page_size = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [api]
            bearer_token = "abc"
            base_url = "https://example.test/v1"

            [poll]
            scan_interval_s = 60
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.base_url, "https://example.test/v1");
        assert_eq!(config.poll.scan_interval_s, 60);
    }
}
