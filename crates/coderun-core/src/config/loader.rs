//! Configuration loader for YAML files and environment resolution
//!
//! `${VAR}` and `${VAR:-default}` placeholders are substituted from the
//! process environment before the document is parsed.

use regex::Regex;
use std::env;
use std::path::Path;
use tokio::fs;

use crate::config::types::CoderunConfig;
use crate::errors::ConfigError;

const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<CoderunConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        log::debug!("Loaded configuration file {}", path.display());
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<CoderunConfig, ConfigError> {
        let resolved = Self::resolve_env_placeholders(content)?;
        let config: CoderunConfig = if resolved.trim().is_empty() {
            CoderunConfig::default()
        } else {
            serde_yaml::from_str(&resolved)?
        };
        config.validate()?;
        Ok(config)
    }

    fn resolve_env_placeholders(content: &str) -> Result<String, ConfigError> {
        let pattern = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| ConfigError::Invalid(format!("placeholder pattern: {}", e)))?;

        let mut resolved = String::with_capacity(content.len());
        let mut last = 0;
        for caps in pattern.captures_iter(content) {
            let Some(whole) = caps.get(0) else { continue };
            let name = &caps[1];
            let value = match (env::var(name), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::MissingEnvVar(name.to_string())),
            };
            resolved.push_str(&content[last..whole.start()]);
            resolved.push_str(&value);
            last = whole.end();
        }
        resolved.push_str(&content[last..]);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Environment;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = ConfigLoader::from_yaml_str(
            r#"
runtime:
  image: python:3.12-slim
  command: ["python", "main.py"]
  file_name: main.py
execution:
  deadline_secs: 3
"#,
        )
        .unwrap();

        assert_eq!(config.runtime.image, "python:3.12-slim");
        assert_eq!(config.runtime.working_dir, "/app");
        assert_eq!(config.execution.deadline_secs, 3);
        assert_eq!(config.execution.output_buffer, 64);
        assert_eq!(config.server.environment, Environment::Development);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = ConfigLoader::from_yaml_str("").unwrap();
        assert_eq!(config, CoderunConfig::default());
    }

    #[test]
    fn test_placeholder_default_used_when_unset() {
        let config = ConfigLoader::from_yaml_str(
            "runtime:\n  image: ${CODERUN_TEST_UNSET_IMAGE_VAR:-alpine:3.20}\n",
        )
        .unwrap();
        assert_eq!(config.runtime.image, "alpine:3.20");
    }

    #[test]
    fn test_placeholder_resolved_from_environment() {
        env::set_var("CODERUN_TEST_DEADLINE", "7");
        let config =
            ConfigLoader::from_yaml_str("execution:\n  deadline_secs: ${CODERUN_TEST_DEADLINE}\n")
                .unwrap();
        assert_eq!(config.execution.deadline_secs, 7);
    }

    #[test]
    fn test_missing_placeholder_is_an_error() {
        let err = ConfigLoader::from_yaml_str("runtime:\n  image: ${CODERUN_TEST_NEVER_SET}\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "CODERUN_TEST_NEVER_SET"));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let err = ConfigLoader::from_yaml_str("execution:\n  deadline_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 8081\n  environment: production").unwrap();

        let config = ConfigLoader::from_file(file.path()).await.unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.environment, Environment::Production);
    }

    #[tokio::test]
    async fn test_missing_file_reports_path() {
        let err = ConfigLoader::from_file("/nonexistent/coderun.yaml").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/coderun.yaml"));
    }
}
