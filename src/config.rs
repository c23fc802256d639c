//! Acceptor configuration.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! max_message_size = 1048576
//! max_request_size = 8192
//! server_port = 443
//! allowed_paths = ["/chat", "/feed$"]
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::connection::server::DEFAULT_MAX_REQUEST_SIZE;
use crate::errors::ConfigError;
use crate::handshake::AllowedPaths;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcceptorConfig {
    /// Largest incoming message on an upgraded connection, in bytes.
    pub max_message_size: usize,
    /// Largest request head read before the handshake is abandoned, in bytes.
    pub max_request_size: usize,
    /// Local port requests arrive on. 443 makes legacy locations `wss://`.
    pub server_port: Option<u16>,
    /// Paths that may be upgraded; empty allows every path.
    pub allowed_paths: AllowedPaths,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            server_port: None,
            allowed_paths: AllowedPaths::default(),
        }
    }
}

impl AcceptorConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Validation`] for zero size limits.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AcceptorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`AcceptorConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation("max_message_size must be positive"));
        }
        if self.max_request_size == 0 {
            return Err(ConfigError::Validation("max_request_size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        assert_eq!(
            AcceptorConfig::from_toml_str("").unwrap(),
            AcceptorConfig::default()
        );
    }

    #[test]
    fn parses_all_fields() {
        let config = AcceptorConfig::from_toml_str(
            r#"
            max_message_size = 4096
            max_request_size = 1024
            server_port = 443
            allowed_paths = ["/chat", "/feed$"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.max_request_size, 1024);
        assert_eq!(config.server_port, Some(443));
        assert!(config.allowed_paths.permits("/chat/7"));
        assert!(config.allowed_paths.permits("/feed"));
        assert!(!config.allowed_paths.permits("/feed/7"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            AcceptorConfig::from_toml_str("max_frame = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_invalid_path_pattern() {
        assert!(matches!(
            AcceptorConfig::from_toml_str(r#"allowed_paths = ["/rooms/("]"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn path_patterns_are_regular_expressions() {
        let config = AcceptorConfig::from_toml_str(r#"allowed_paths = ['/room/\d+$']"#).unwrap();
        assert!(config.allowed_paths.permits("/room/42"));
        assert!(!config.allowed_paths.permits("/room/x"));
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(matches!(
            AcceptorConfig::from_toml_str("max_message_size = 0"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            AcceptorConfig::load(Path::new("/nonexistent/hybi-upgrade.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
