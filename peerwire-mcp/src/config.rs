//! Configuration management for peerwire sessions

use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::client::ClientOptions;
use crate::protocol::SUPPORTED_PROTOCOL_VERSIONS;
use crate::server::ServerOptions;
use crate::{Error, Result};

/// Prefix of environment overrides, e.g. `PEERWIRE__SESSION__REQUEST_TIMEOUT_MS`
pub const ENV_PREFIX: &str = "PEERWIRE";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Session behaviour shared by both roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default request deadline; `None` waits indefinitely
    pub request_timeout_ms: Option<u64>,
    /// Accepted protocol versions, newest first
    pub supported_versions: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                request_timeout_ms: Some(60_000),
                supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self> {
        let settings = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Self::environment())
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Self::builder()?
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(Self::environment())
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn builder() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
        let defaults = Config::default();
        config::Config::builder()
            .set_default("session.request_timeout_ms", 60_000)?
            .set_default(
                "session.supported_versions",
                defaults.session.supported_versions,
            )?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("session.supported_versions")
            .try_parsing(true)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.supported_versions.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "session.supported_versions must name at least one protocol version".to_string(),
            )));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(Error::Config(ConfigError::Message(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            ))));
        }
        Ok(())
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            supported_versions: self.supported_versions.clone(),
            request_timeout: self.request_timeout(),
        }
    }

    pub fn server_options(&self, instructions: Option<String>) -> ServerOptions {
        ServerOptions {
            supported_versions: self.supported_versions.clone(),
            instructions,
            request_timeout: self.request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_without_files() {
        let config = Config::load().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.session.request_timeout(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let file = write_config(
            r#"
            [session]
            request_timeout_ms = 250
            supported_versions = ["2024-11-05"]

            [logging]
            level = "debug"
            format = "json"
            "#,
        );

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.session.request_timeout_ms, Some(250));
        assert_eq!(config.session.supported_versions, vec!["2024-11-05"]);
        assert_eq!(config.logging.format, "json");

        let options = config.session.client_options();
        assert_eq!(options.request_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
            [session]
            request_timeout_ms = 250
            "#,
        );
        std::env::set_var("PEERWIRE__SESSION__REQUEST_TIMEOUT_MS", "1500");
        std::env::set_var(
            "PEERWIRE__SESSION__SUPPORTED_VERSIONS",
            "2025-03-26,2024-11-05",
        );

        let loaded = Config::load_from(file.path());
        std::env::remove_var("PEERWIRE__SESSION__REQUEST_TIMEOUT_MS");
        std::env::remove_var("PEERWIRE__SESSION__SUPPORTED_VERSIONS");

        let config = loaded.unwrap();
        assert_eq!(config.session.request_timeout_ms, Some(1500));
        assert_eq!(
            config.session.supported_versions,
            vec!["2025-03-26", "2024-11-05"]
        );
    }

    #[test]
    #[serial]
    fn test_empty_version_list_is_rejected() {
        let file = write_config(
            r#"
            [session]
            supported_versions = []
            "#,
        );
        assert_matches!(Config::load_from(file.path()), Err(Error::Config(_)));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert_matches!(
            Config::load_from("/nonexistent/peerwire.toml"),
            Err(Error::Config(_))
        );
    }
}
