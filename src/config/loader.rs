//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a configuration file without validating it.
///
/// Used when command-line values still need to be layered on top.
pub fn read_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let config = read_config(path)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionPolicy;

    #[test]
    fn loads_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dual.toml");
        fs::write(
            &path,
            r#"
            [backends]
            primary = "http://127.0.0.1:3000"
            secondary = "http://127.0.0.1:4000"

            [capture]
            dir = "/var/tmp/captures"
            retention = "keep_all"
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.backends.primary, "http://127.0.0.1:3000");
        assert_eq!(config.capture.retention, RetentionPolicy::KeepAll);
        assert_eq!(config.listener.bind_address, ":8080");
        assert_eq!(config.timeouts.response_header_secs, 30);
    }

    #[test]
    fn rejects_file_without_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dual.toml");
        fs::write(&path, "[listener]\nbind_address = \":9000\"\n").unwrap();

        match load_config(&path) {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dual.toml");
        fs::write(&path, "[listener\n").unwrap();
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}
