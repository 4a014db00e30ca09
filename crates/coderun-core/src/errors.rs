//! Error types for the execution-session lifecycle
//!
//! Failures are grouped by the lifecycle step that produced them so the
//! transports can pick a status code (synchronous callers) or a short close
//! phrase (streaming callers) without inspecting messages. Runtime client
//! failures are wrapped rather than flattened so the original cause stays
//! available in logs.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`RuntimeClient`](crate::runtime::RuntimeClient).
#[derive(Error, Debug)]
pub enum RuntimeClientError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Runtime stream ended unexpectedly: {0}")]
    StreamEnded(String),
    #[error("Runtime call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl RuntimeClientError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Terminal failure of one execution session.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to package source: {0}")]
    Packaging(#[from] std::io::Error),
    #[error("Failed to create container: {0}")]
    EnvironmentCreate(#[source] RuntimeClientError),
    #[error("Failed to copy files to container: {0}")]
    Injection(#[source] RuntimeClientError),
    #[error("Failed to start container: {0}")]
    Start(#[source] RuntimeClientError),
    #[error("Container wait error: {0}")]
    RuntimeWait(#[source] RuntimeClientError),
    #[error("Failed to decode container output: {0}")]
    StreamDecode(String),
    #[error("Execution exceeded the {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("Client disconnected before execution finished")]
    ClientDisconnected,
    #[error("Failed to remove container: {0}")]
    Cleanup(#[source] RuntimeClientError),
}

impl ExecutionError {
    /// HTTP status used by the synchronous transport.
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutionError::DeadlineExceeded(_) => 408,
            // Client closed request; nobody is left to read it.
            ExecutionError::ClientDisconnected => 499,
            ExecutionError::Packaging(_)
            | ExecutionError::EnvironmentCreate(_)
            | ExecutionError::Injection(_)
            | ExecutionError::Start(_)
            | ExecutionError::RuntimeWait(_)
            | ExecutionError::StreamDecode(_)
            | ExecutionError::Cleanup(_) => 500,
        }
    }

    /// Short phrase carried by the streaming close frame. Detailed error text
    /// never goes onto the stream.
    pub fn close_reason(&self) -> &'static str {
        match self.status_code() {
            408 => "Request Timeout",
            _ => "Internal Server Error",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ExecutionError::Packaging(_) => "packaging_error",
            ExecutionError::EnvironmentCreate(_) => "environment_create_error",
            ExecutionError::Injection(_) => "injection_error",
            ExecutionError::Start(_) => "start_error",
            ExecutionError::RuntimeWait(_) => "runtime_wait_error",
            ExecutionError::StreamDecode(_) => "stream_decode_error",
            ExecutionError::DeadlineExceeded(_) => "deadline_exceeded",
            ExecutionError::ClientDisconnected => "client_disconnected",
            ExecutionError::Cleanup(_) => "cleanup_error",
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Environment variable '{0}' is referenced by the configuration but not set")]
    MissingEnvVar(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            ExecutionError::DeadlineExceeded(Duration::from_secs(1)).status_code(),
            408
        );
        assert_eq!(
            ExecutionError::EnvironmentCreate(RuntimeClientError::other("boom")).status_code(),
            500
        );
        assert_eq!(ExecutionError::ClientDisconnected.status_code(), 499);
    }

    #[test]
    fn test_close_reason_does_not_leak_details() {
        let err = ExecutionError::Injection(RuntimeClientError::other("/var/lib/docker is full"));
        assert_eq!(err.close_reason(), "Internal Server Error");
        assert_eq!(
            ExecutionError::DeadlineExceeded(Duration::from_secs(3)).close_reason(),
            "Request Timeout"
        );
    }

    #[test]
    fn test_create_error_message() {
        let err = ExecutionError::EnvironmentCreate(RuntimeClientError::other("no such image"));
        assert_eq!(err.to_string(), "Failed to create container: no such image");
    }
}
