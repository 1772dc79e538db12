//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::CiceroConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load the full Cicero configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<CiceroConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: CiceroConfig = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &CiceroConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    match config.db.backend.trim().to_ascii_lowercase().as_str() {
        "memory" | "in_memory" => {}
        "postgres" => {
            if config
                .db
                .connection_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
            {
                return Err(ConfigError::Invalid(
                    "db.connection_url is required for the postgres backend".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "db.backend '{other}' is not supported"
            )));
        }
    }

    if config.broker.capacity == 0 {
        return Err(ConfigError::Invalid(
            "broker.capacity must be > 0".to_string(),
        ));
    }

    if config.evaluator.command.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "evaluator.command must not be empty".to_string(),
        ));
    }

    if config.invoker.slots == 0 {
        return Err(ConfigError::Invalid(
            "invoker.slots must be > 0".to_string(),
        ));
    }

    if config.logging.loki_url.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "logging.loki_url must not be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(content.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let file = write_config("{}");
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.version, 1);
        assert_eq!(config.db.backend, "memory");
        assert_eq!(config.invoker.slots, 1);
    }

    #[test]
    fn test_full_config_round_trips() {
        let file = write_config(
            r#"
version: 1
app:
  name: cicero
db:
  backend: postgres
  connection_url: postgres://cicero@localhost/cicero
broker:
  capacity: 512
evaluator:
  command: nix-instantiate
  args: ["--eval", "--strict", "--json"]
  timeout_ms: 30000
invoker:
  slots: 2
logging:
  loki_url: http://loki:3100/loki/api/v1/push
observability:
  log_level: debug
  log_format: json
"#,
        );
        let config = load_config(file.path()).expect("load");
        assert_eq!(config.db.backend, "postgres");
        assert_eq!(config.evaluator.args.len(), 3);
        assert_eq!(config.invoker.slots, 2);
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_postgres_without_url_is_rejected() {
        let file = write_config("db:\n  backend: postgres\n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let file = write_config("db:\n  backend: sqlite\n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_slots_are_rejected() {
        let file = write_config("invoker:\n  slots: 0\n");
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
