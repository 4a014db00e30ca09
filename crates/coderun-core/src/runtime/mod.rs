//! Container runtime facade.
//!
//! The orchestrator never talks to a container engine directly; it goes
//! through [`RuntimeClient`], constructed once at startup and shared by all
//! sessions. Every call is independent of other sessions, so one client can
//! serve any number of concurrent requests.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;

use crate::errors::RuntimeClientError;

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

pub use docker::DockerRuntime;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{RuntimeCall, ScriptedExit, ScriptedRuntime};

/// Everything needed to allocate one isolated environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSpec {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub tty: bool,
    pub auto_remove: bool,
    pub labels: HashMap<String, String>,
}

/// One frame of the runtime's combined output stream, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    StdOut(Bytes),
    StdErr(Bytes),
    StdIn(Bytes),
    /// Undifferentiated output produced when a TTY is attached
    Console(Bytes),
}

/// Exit status of the process running in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn new(code: i64) -> Self {
        Self { code }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

pub type LogStream<'a> = Pin<Box<dyn Stream<Item = Result<LogFrame, RuntimeClientError>> + Send + 'a>>;

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Allocate an environment and return its runtime-assigned id.
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<String, RuntimeClientError>;

    /// Extract a tar archive into the environment's filesystem at `path`.
    async fn copy_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeClientError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeClientError>;

    /// Combined stdout/stderr stream. With `follow` the stream stays open
    /// until the process exits.
    fn logs<'a>(&'a self, container_id: &'a str, follow: bool) -> LogStream<'a>;

    /// Resolve once the process is no longer running.
    async fn wait(&self, container_id: &str) -> Result<ExitStatus, RuntimeClientError>;

    /// Remove the environment. Removing an environment that is already gone
    /// is not an error.
    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeClientError>;
}
