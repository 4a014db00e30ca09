//! Configuration types for the execution service

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoderunConfig {
    pub runtime: RuntimeConfig,
    pub execution: ExecutionConfig,
    pub server: ServerSettings,
}

/// How the isolated environment is provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base image every session starts from
    pub image: String,
    /// Entry command run inside the container
    pub command: Vec<String>,
    /// Working directory; the source file is copied here
    pub working_dir: String,
    /// Name of the injected source file
    pub file_name: String,
    /// Permission bits of the injected source file
    pub file_mode: u32,
    /// Allocate a TTY. Output then arrives as one undifferentiated stream.
    pub tty: bool,
    /// Let the runtime remove the container once it exits
    pub auto_remove: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: "golang:1.21".to_string(),
            command: vec!["go".to_string(), "run".to_string(), "main.go".to_string()],
            working_dir: "/app".to_string(),
            file_name: "main.go".to_string(),
            file_mode: 0o644,
            tty: false,
            auto_remove: true,
        }
    }
}

/// Limits applied to a single session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub deadline_secs: u64,
    /// How long output keeps being read after the process has exited
    pub drain_grace_ms: u64,
    pub cleanup_timeout_secs: u64,
    /// Capacity of the channels carrying output chunks
    pub output_buffer: usize,
    /// Cap on output accumulated for synchronous callers
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 10,
            drain_grace_ms: 500,
            cleanup_timeout_secs: 10,
            output_buffer: 64,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}

/// Listener settings consumed by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub environment: Environment,
    pub max_body_size: usize,
    pub enable_cors: bool,
    pub enable_logging: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            environment: Environment::Development,
            max_body_size: 1024 * 1024,
            enable_cors: true,
            enable_logging: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(name)
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid(format!(
                "unknown environment '{}' (expected development|staging|production)",
                other
            ))),
        }
    }
}

impl CoderunConfig {
    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let runtime = &self.runtime;
        if runtime.image.trim().is_empty() {
            return Err(ConfigError::Invalid("runtime.image must not be empty".into()));
        }
        if runtime.command.is_empty() || runtime.command.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid("runtime.command must not be empty".into()));
        }
        if !runtime.working_dir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "runtime.working_dir must be absolute, got '{}'",
                runtime.working_dir
            )));
        }
        if runtime.file_name.is_empty()
            || runtime.file_name.contains('/')
            || runtime.file_name == "."
            || runtime.file_name == ".."
        {
            return Err(ConfigError::Invalid(format!(
                "runtime.file_name must be a plain file name, got '{}'",
                runtime.file_name
            )));
        }
        if runtime.file_mode > 0o7777 {
            return Err(ConfigError::Invalid(format!(
                "runtime.file_mode {:o} is not a permission mask",
                runtime.file_mode
            )));
        }
        if self.execution.deadline_secs == 0 {
            return Err(ConfigError::Invalid("execution.deadline_secs must be positive".into()));
        }
        if self.execution.output_buffer == 0 {
            return Err(ConfigError::Invalid("execution.output_buffer must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoderunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.file_mode, 0o644);
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.execution.deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_relative_working_dir_rejected() {
        let mut config = CoderunConfig::default();
        config.runtime.working_dir = "app".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_nested_file_name_rejected() {
        let mut config = CoderunConfig::default();
        config.runtime.file_name = "../main.go".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_deadline_rejected() {
        let mut config = CoderunConfig::default();
        config.execution.deadline_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert!("qa".parse::<Environment>().is_err());
        assert_eq!(Environment::Development.to_string(), "development");
    }
}
