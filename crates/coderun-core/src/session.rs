//! Session state and the scoped container handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::demux::CollectedOutput;
use crate::errors::{ExecutionError, RuntimeClientError};
use crate::runtime::RuntimeClient;

/// Source text submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionRequest {
    #[serde(rename = "text")]
    source_text: String,
}

impl ExecutionRequest {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
        }
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// What the caller gets back once a session has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Injected,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded
                | SessionState::Failed
                | SessionState::TimedOut
                | SessionState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Created, Injected) | (Injected, Running) | (Running, Succeeded) => true,
            (current, Failed | TimedOut | Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Owns the runtime-side container for the lifetime of one session.
///
/// [`release`](Self::release) removes the container and is idempotent. If the
/// guard is dropped without being released (the owning future was cancelled
/// or panicked), a forced removal is spawned on the current Tokio runtime.
pub struct ContainerGuard {
    runtime: Arc<dyn RuntimeClient>,
    container_id: String,
    released: bool,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn RuntimeClient>, container_id: String) -> Self {
        Self {
            runtime,
            container_id,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.container_id
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Force-remove the container. Calls after the first are no-ops.
    pub async fn release(&mut self, timeout: Duration) -> Result<(), ExecutionError> {
        if self.released {
            return Ok(());
        }
        let outcome = tokio::time::timeout(timeout, self.runtime.remove(&self.container_id, true)).await;
        // Marked only after the call returns so a cancelled release still
        // leaves the drop backstop armed.
        self.released = true;
        match outcome {
            Ok(result) => result.map_err(ExecutionError::Cleanup),
            Err(_) => Err(ExecutionError::Cleanup(RuntimeClientError::Timeout(timeout))),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let container_id = std::mem::take(&mut self.container_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!(
                    "Session abandoned before cleanup; force-removing container {}",
                    container_id
                );
                let runtime = self.runtime.clone();
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&container_id, true).await {
                        log::warn!("Failed to remove abandoned container {}: {}", container_id, e);
                    }
                });
            }
            Err(_) => log::error!(
                "Container {} leaked: no async runtime available to remove it",
                container_id
            ),
        }
    }
}

/// One execution session. Exclusively owned by the orchestrator driving it.
pub struct Session {
    id: Uuid,
    container: ContainerGuard,
    created_at: DateTime<Utc>,
    deadline: Instant,
    state: SessionState,
}

impl Session {
    pub fn new(id: Uuid, container: ContainerGuard, deadline: Instant) -> Self {
        Self {
            id,
            container,
            created_at: Utc::now(),
            deadline,
            state: SessionState::Created,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next` if the state machine allows it. Returns whether the
    /// transition happened.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "Session {} ignoring illegal transition {} -> {}",
                self.id,
                self.state,
                next
            );
            return false;
        }
        log::debug!("Session {} {} -> {}", self.id, self.state, next);
        self.state = next;
        true
    }

    pub(crate) fn container_mut(&mut self) -> &mut ContainerGuard {
        &mut self.container
    }
}

/// Everything known about a session once it has finished.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: Uuid,
    /// Present when an environment was created
    pub container_id: Option<String>,
    pub state: SessionState,
    pub exit_code: Option<i64>,
    /// Output retained by the sink; partial when the session did not succeed
    pub output: CollectedOutput,
    pub error: Option<ExecutionError>,
    pub elapsed: Duration,
}

impl SessionReport {
    /// Collapse the report into the caller-facing result. A timed-out session
    /// still yields a result so partial output is not lost.
    pub fn into_result(self) -> Result<ExecutionResult, ExecutionError> {
        let status = match (self.state, self.error) {
            (SessionState::TimedOut, _) => ExecutionStatus::Timeout,
            (_, Some(error)) => return Err(error),
            (SessionState::Succeeded, None) => ExecutionStatus::Success,
            (_, None) => ExecutionStatus::Error,
        };
        Ok(ExecutionResult {
            status,
            output: self.output.text,
            exit_code: self.exit_code,
            truncated: self.output.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeCall, ScriptedRuntime};

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        assert!(Created.can_transition_to(Injected));
        assert!(Injected.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(!Created.can_transition_to(Running));
        assert!(!Injected.can_transition_to(Succeeded));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use SessionState::*;
        for terminal in [Succeeded, Failed, TimedOut, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Created, Injected, Running, Succeeded, Failed, TimedOut, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(Created.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn test_request_deserializes_from_text_field() {
        let request: ExecutionRequest = serde_json::from_str(r#"{"text":"print(1)"}"#).unwrap();
        assert_eq!(request.source_text(), "print(1)");
        assert!(serde_json::from_str::<ExecutionRequest>(r#"{"code":"x"}"#).is_err());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let runtime = ScriptedRuntime::new();
        let mut guard = ContainerGuard::new(Arc::new(runtime.clone()), "c1".to_string());
        assert!(!guard.is_released());
        guard.release(Duration::from_secs(1)).await.unwrap();
        assert!(guard.is_released());
        guard.release(Duration::from_secs(1)).await.unwrap();
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(
            runtime.remove_calls(),
            vec![RuntimeCall::Remove {
                container_id: "c1".to_string(),
                force: true
            }]
        );
    }

    #[tokio::test]
    async fn test_dropped_guard_removes_container() {
        let runtime = ScriptedRuntime::new();
        let guard = ContainerGuard::new(Arc::new(runtime.clone()), "c2".to_string());
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(runtime.remove_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_release_is_not_retried() {
        let runtime = ScriptedRuntime::new().failing_remove("daemon gone");
        let mut guard = ContainerGuard::new(Arc::new(runtime.clone()), "c3".to_string());
        let err = guard.release(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cleanup(_)));
        assert!(guard.is_released());
        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.remove_calls().len(), 1);
    }

    #[test]
    fn test_timed_out_report_keeps_partial_output() {
        let report = SessionReport {
            session_id: Uuid::new_v4(),
            container_id: Some("c".into()),
            state: SessionState::TimedOut,
            exit_code: None,
            output: CollectedOutput {
                text: "tick\n".into(),
                truncated: false,
            },
            error: Some(ExecutionError::DeadlineExceeded(Duration::from_secs(1))),
            elapsed: Duration::from_secs(1),
        };
        let result = report.into_result().unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.output, "tick\n");
    }
}
