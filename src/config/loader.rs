//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::HostConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate host configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate host configuration from TOML text.
pub fn parse_config(content: &str) -> Result<HostConfig, ConfigError> {
    let config: HostConfig = toml::from_str(content).map_err(ConfigError::Parse)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.limits.queue_length, 400);
        assert_eq!(config.timeouts.entity_body_secs, 120);
    }

    #[test]
    fn all_validation_errors_reported() {
        let err = parse_config(
            r#"
            [limits]
            queue_length = 0

            [[prefixes]]
            url = "ftp://nowhere/"
            "#,
        )
        .unwrap_err();

        match err {
            ConfigError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        assert!(matches!(
            parse_config("[limits"),
            Err(ConfigError::Parse(_))
        ));
    }
}
