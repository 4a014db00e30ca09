//! Programmable in-memory runtime used by tests.
//!
//! Each call is recorded so tests can assert on the exact sequence of runtime
//! operations, e.g. that a container was removed exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EnvironmentSpec, ExitStatus, LogFrame, LogStream, RuntimeClient};
use crate::errors::RuntimeClientError;

/// A runtime operation as observed by [`ScriptedRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Create(EnvironmentSpec),
    CopyArchive { container_id: String, path: String, archive: Bytes },
    Start(String),
    Logs { container_id: String, follow: bool },
    Wait(String),
    Remove { container_id: String, force: bool },
}

/// How the scripted process finishes.
#[derive(Debug, Clone)]
pub enum ScriptedExit {
    Code(i64),
    /// Never exits; output stays open after the scripted frames.
    Hang,
    /// The wait call itself fails.
    WaitError(String),
}

#[derive(Clone)]
pub struct ScriptedRuntime {
    container_id: String,
    fail_create: Option<String>,
    fail_copy: Option<String>,
    fail_start: Option<String>,
    fail_remove: Option<String>,
    frames: Vec<Result<LogFrame, String>>,
    frame_delay: Duration,
    exit: ScriptedExit,
    exit_delay: Duration,
    calls: Arc<Mutex<Vec<RuntimeCall>>>,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            container_id: "scripted-container".to_string(),
            fail_create: None,
            fail_copy: None,
            fail_start: None,
            fail_remove: None,
            frames: Vec::new(),
            frame_delay: Duration::ZERO,
            exit: ScriptedExit::Code(0),
            exit_delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_stdout(mut self, text: &str) -> Self {
        self.frames.push(Ok(LogFrame::StdOut(Bytes::copy_from_slice(text.as_bytes()))));
        self
    }

    pub fn with_stderr(mut self, text: &str) -> Self {
        self.frames.push(Ok(LogFrame::StdErr(Bytes::copy_from_slice(text.as_bytes()))));
        self
    }

    pub fn with_frame(mut self, frame: LogFrame) -> Self {
        self.frames.push(Ok(frame));
        self
    }

    /// Make the output stream yield an error at this point.
    pub fn with_stream_error(mut self, message: &str) -> Self {
        self.frames.push(Err(message.to_string()));
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn with_exit(mut self, exit: ScriptedExit) -> Self {
        self.exit = exit;
        self
    }

    pub fn with_exit_delay(mut self, delay: Duration) -> Self {
        self.exit_delay = delay;
        self
    }

    pub fn failing_create(mut self, message: &str) -> Self {
        self.fail_create = Some(message.to_string());
        self
    }

    pub fn failing_copy(mut self, message: &str) -> Self {
        self.fail_copy = Some(message.to_string());
        self
    }

    pub fn failing_start(mut self, message: &str) -> Self {
        self.fail_start = Some(message.to_string());
        self
    }

    pub fn failing_remove(mut self, message: &str) -> Self {
        self.fail_remove = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn remove_calls(&self) -> Vec<RuntimeCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, RuntimeCall::Remove { .. }))
            .collect()
    }

    pub fn copied_archive(&self) -> Option<Bytes> {
        self.calls().into_iter().find_map(|call| match call {
            RuntimeCall::CopyArchive { archive, .. } => Some(archive),
            _ => None,
        })
    }

    fn record(&self, call: RuntimeCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn scripted_failure(failure: &Option<String>) -> Result<(), RuntimeClientError> {
        match failure {
            Some(message) => Err(RuntimeClientError::other(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RuntimeClient for ScriptedRuntime {
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<String, RuntimeClientError> {
        self.record(RuntimeCall::Create(spec.clone()));
        Self::scripted_failure(&self.fail_create)?;
        Ok(self.container_id.clone())
    }

    async fn copy_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeClientError> {
        self.record(RuntimeCall::CopyArchive {
            container_id: container_id.to_string(),
            path: path.to_string(),
            archive,
        });
        Self::scripted_failure(&self.fail_copy)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeClientError> {
        self.record(RuntimeCall::Start(container_id.to_string()));
        Self::scripted_failure(&self.fail_start)
    }

    fn logs<'a>(&'a self, container_id: &'a str, follow: bool) -> LogStream<'a> {
        self.record(RuntimeCall::Logs {
            container_id: container_id.to_string(),
            follow,
        });

        let delay = self.frame_delay;
        let frames = stream::iter(self.frames.clone()).then(move |frame| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            frame.map_err(RuntimeClientError::Other)
        });

        if matches!(self.exit, ScriptedExit::Hang) && follow {
            Box::pin(frames.chain(stream::pending()))
        } else {
            Box::pin(frames)
        }
    }

    async fn wait(&self, container_id: &str) -> Result<ExitStatus, RuntimeClientError> {
        self.record(RuntimeCall::Wait(container_id.to_string()));
        if !self.exit_delay.is_zero() {
            tokio::time::sleep(self.exit_delay).await;
        }
        match &self.exit {
            ScriptedExit::Code(code) => Ok(ExitStatus::new(*code)),
            ScriptedExit::Hang => std::future::pending().await,
            ScriptedExit::WaitError(message) => Err(RuntimeClientError::other(message.clone())),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<(), RuntimeClientError> {
        self.record(RuntimeCall::Remove {
            container_id: container_id.to_string(),
            force,
        });
        Self::scripted_failure(&self.fail_remove)
    }
}
