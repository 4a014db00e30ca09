//! Execution-session orchestration.
//!
//! [`SessionOrchestrator`] drives one session through
//! package → create → inject → start → stream + wait → cleanup. The deadline
//! is fixed when the session begins and bounds every runtime call after it;
//! a [`CancellationToken`] lets the transport abort the session when its
//! client goes away. Whatever happens, the container is removed exactly once.
//!
//! While the process runs, two tasks feed a controlling loop over channels:
//! one reads and demultiplexes output, the other waits for the process to
//! exit. The controller races process exit, the deadline and cancellation;
//! the first to fire decides the terminal state. Both helper tasks are
//! aborted and joined before the orchestrator returns, so nothing outlives
//! the session.

use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{CoderunConfig, ExecutionConfig, RuntimeConfig};
use crate::demux::{Demultiplexer, OutputChunk, OutputSink};
use crate::errors::{ExecutionError, RuntimeClientError};
use crate::packager::{PayloadArchive, PayloadPackager};
use crate::runtime::{EnvironmentSpec, ExitStatus, RuntimeClient};
use crate::session::{ContainerGuard, ExecutionRequest, Session, SessionReport, SessionState};

/// Label attached to every container so operators can trace it to a session.
pub const SESSION_LABEL: &str = "coderun.session";

type ChunkResult = Result<OutputChunk, ExecutionError>;

pub struct SessionOrchestrator {
    runtime: Arc<dyn RuntimeClient>,
    runtime_config: RuntimeConfig,
    execution: ExecutionConfig,
    packager: PayloadPackager,
}

impl SessionOrchestrator {
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: &CoderunConfig) -> Self {
        Self {
            runtime,
            packager: PayloadPackager::from_config(&config.runtime),
            runtime_config: config.runtime.clone(),
            execution: config.execution.clone(),
        }
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Run one session to completion, delivering output to `sink`.
    ///
    /// Never returns an error directly: the outcome, terminal state and any
    /// retained output are all in the [`SessionReport`].
    pub async fn execute<S: OutputSink>(
        &self,
        request: ExecutionRequest,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> SessionReport {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.execution.deadline();
        log::info!(
            "Session {} starting ({} bytes of source, deadline {:?})",
            session_id,
            request.source_text().len(),
            self.execution.deadline()
        );

        let archive = match self.packager.package(request.source_text()) {
            Ok(archive) => {
                log::debug!(
                    "Session {} packaged {} into a {} byte archive",
                    session_id,
                    archive.file_name(),
                    archive.len()
                );
                archive
            }
            Err(e) => {
                log::error!("Session {} failed to package source: {}", session_id, e);
                return self.report_without_session(session_id, started, e, sink);
            }
        };

        let mut session = match self.create_session(session_id, deadline, &cancel).await {
            Ok(session) => session,
            Err(e) => {
                log::error!("Session {}: {}", session_id, e);
                return self.report_without_session(session_id, started, e, sink);
            }
        };

        let outcome = self.drive(&mut session, archive, sink, &cancel).await;

        let (terminal, exit_code, error) = match outcome {
            Ok(status) if status.success() => (SessionState::Succeeded, Some(status.code), None),
            Ok(status) => (SessionState::Failed, Some(status.code), None),
            Err(e) => (terminal_state_for(&e), None, Some(e)),
        };
        session.advance(terminal);
        let state = session.state();
        match &error {
            Some(e) if state == SessionState::Failed => {
                log::error!("Session {} failed: {}", session_id, e)
            }
            Some(e) => log::warn!("Session {} ended {}: {}", session_id, state, e),
            None => log::info!(
                "Session {} (created {}) finished {} with exit code {:?} in {:?}",
                session_id,
                session.created_at().to_rfc3339(),
                state,
                exit_code,
                started.elapsed()
            ),
        }

        self.cleanup(&mut session).await;

        SessionReport {
            session_id,
            container_id: Some(session.container_id().to_string()),
            state,
            exit_code,
            output: sink.take_output(),
            error,
            elapsed: started.elapsed(),
        }
    }

    fn environment_spec(&self, session_id: Uuid) -> EnvironmentSpec {
        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());
        EnvironmentSpec {
            name: Some(format!("coderun-{}", session_id)),
            image: self.runtime_config.image.clone(),
            command: self.runtime_config.command.clone(),
            working_dir: self.runtime_config.working_dir.clone(),
            tty: self.runtime_config.tty,
            auto_remove: self.runtime_config.auto_remove,
            labels,
        }
    }

    /// Allocate the environment. On failure nothing exists to clean up.
    async fn create_session(
        &self,
        session_id: Uuid,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Session, ExecutionError> {
        let spec = self.environment_spec(session_id);
        let container_id = self
            .bounded(deadline, cancel, self.runtime.create_environment(&spec))
            .await?
            .map_err(ExecutionError::EnvironmentCreate)?;
        log::debug!("Session {} created container {}", session_id, container_id);

        let guard = ContainerGuard::new(self.runtime.clone(), container_id);
        Ok(Session::new(session_id, guard, deadline))
    }

    async fn drive<S: OutputSink>(
        &self,
        session: &mut Session,
        archive: PayloadArchive,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus, ExecutionError> {
        let deadline = session.deadline();
        let container_id = session.container_id().to_string();

        self.bounded(
            deadline,
            cancel,
            self.runtime.copy_archive(
                &container_id,
                &self.runtime_config.working_dir,
                archive.into_bytes(),
            ),
        )
        .await?
        .map_err(ExecutionError::Injection)?;
        session.advance(SessionState::Injected);

        self.bounded(deadline, cancel, self.runtime.start(&container_id))
            .await?
            .map_err(ExecutionError::Start)?;
        session.advance(SessionState::Running);

        self.run_and_collect(&container_id, deadline, sink, cancel).await
    }

    /// Race a single runtime call against the deadline and cancellation.
    async fn bounded<F, T>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        step: F,
    ) -> Result<T, ExecutionError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::ClientDisconnected),
            _ = sleep_until(deadline) => Err(ExecutionError::DeadlineExceeded(self.execution.deadline())),
            out = step => Ok(out),
        }
    }

    async fn run_and_collect<S: OutputSink>(
        &self,
        container_id: &str,
        deadline: Instant,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus, ExecutionError> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<ChunkResult>(self.execution.output_buffer);
        let (exit_tx, mut exit_rx) = oneshot::channel();

        let output_task = ScopedTask::spawn(pump_output(
            self.runtime.clone(),
            container_id.to_string(),
            chunk_tx,
        ));
        let wait_task = {
            let runtime = self.runtime.clone();
            let container_id = container_id.to_string();
            ScopedTask::spawn(async move {
                let _ = exit_tx.send(runtime.wait(&container_id).await);
            })
        };

        let mut exit: Option<ExitStatus> = None;
        let mut drain_until: Option<Instant> = None;
        let mut output_open = true;

        let outcome = loop {
            if let (Some(status), false) = (exit, output_open) {
                break Ok(status);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => match exit {
                    // Already exited: the caller leaving only cuts the drain short.
                    Some(status) => break Ok(status),
                    None => break Err(ExecutionError::ClientDisconnected),
                },
                _ = sleep_until(deadline), if exit.is_none() => {
                    break Err(ExecutionError::DeadlineExceeded(self.execution.deadline()));
                }
                _ = sleep_until(drain_until.unwrap_or(deadline)), if drain_until.is_some() => {
                    log::debug!("Container {} output still open after exit; not waiting further", container_id);
                    output_open = false;
                }
                waited = &mut exit_rx, if exit.is_none() => match waited {
                    Ok(Ok(status)) => {
                        log::debug!("Container {} exited with code {}", container_id, status.code);
                        exit = Some(status);
                        let grace = Instant::now() + self.execution.drain_grace();
                        drain_until = Some(grace.min(deadline));
                    }
                    Ok(Err(e)) => break Err(ExecutionError::RuntimeWait(e)),
                    Err(_) => {
                        break Err(ExecutionError::RuntimeWait(RuntimeClientError::StreamEnded(
                            "wait task ended without reporting an exit status".to_string(),
                        )))
                    }
                },
                item = chunk_rx.recv(), if output_open => match item {
                    Some(Ok(chunk)) => {
                        let until = drain_until.unwrap_or(deadline);
                        match (forward(chunk, sink, until, cancel).await, exit) {
                            (Delivery::Delivered, _) => {}
                            (_, Some(_)) => output_open = false,
                            (Delivery::Expired, None) => {
                                break Err(ExecutionError::DeadlineExceeded(self.execution.deadline()))
                            }
                            (Delivery::Closed | Delivery::Cancelled, None) => {
                                break Err(ExecutionError::ClientDisconnected)
                            }
                        }
                    }
                    Some(Err(e)) => match exit {
                        // The exit status alone decides the outcome once known.
                        Some(_) => {
                            log::warn!("Container {} output failed after exit: {}", container_id, e);
                            output_open = false;
                        }
                        None => break Err(e),
                    },
                    None => output_open = false,
                },
            }
        };

        // Whoever lost the race is abandoned; join so nothing logs afterwards.
        output_task.abort_and_join().await;
        wait_task.abort_and_join().await;

        outcome
    }

    /// Remove the container. Failures are logged, never surfaced: the
    /// session's outcome is already decided.
    async fn cleanup(&self, session: &mut Session) {
        let session_id = session.id();
        let container = session.container_mut();
        match container.release(self.execution.cleanup_timeout()).await {
            Ok(()) => log::debug!("Session {} removed container {}", session_id, container.id()),
            Err(e) => log::warn!("Session {} cleanup: {}", session_id, e),
        }
    }

    fn report_without_session<S: OutputSink>(
        &self,
        session_id: Uuid,
        started: Instant,
        error: ExecutionError,
        sink: &mut S,
    ) -> SessionReport {
        SessionReport {
            session_id,
            container_id: None,
            state: terminal_state_for(&error),
            exit_code: None,
            output: sink.take_output(),
            error: Some(error),
            elapsed: started.elapsed(),
        }
    }
}

enum Delivery {
    Delivered,
    Expired,
    Closed,
    Cancelled,
}

/// Deliver one chunk without letting a slow consumer hold the session past
/// `until` or ignore cancellation.
async fn forward<S: OutputSink>(
    chunk: OutputChunk,
    sink: &mut S,
    until: Instant,
    cancel: &CancellationToken,
) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        _ = sleep_until(until) => Delivery::Expired,
        delivered = sink.deliver(chunk) => match delivered {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Closed,
        },
    }
}

/// Helper task tied to the session: aborted if the session future is dropped
/// before it is joined.
struct ScopedTask(Option<JoinHandle<()>>);

impl ScopedTask {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(Some(tokio::spawn(future)))
    }

    async fn abort_and_join(mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

fn terminal_state_for(error: &ExecutionError) -> SessionState {
    match error {
        ExecutionError::DeadlineExceeded(_) => SessionState::TimedOut,
        ExecutionError::ClientDisconnected => SessionState::Cancelled,
        _ => SessionState::Failed,
    }
}

/// Read the combined output stream, demultiplex it and hand chunks to the
/// controller. Stops at end of stream, on the first decode error, or when the
/// controller stops listening.
async fn pump_output(
    runtime: Arc<dyn RuntimeClient>,
    container_id: String,
    tx: mpsc::Sender<ChunkResult>,
) {
    let mut demux = Demultiplexer::new();
    let mut frames = runtime.logs(&container_id, true);

    while let Some(frame) = frames.next().await {
        let decoded = frame
            .map_err(|e| ExecutionError::StreamDecode(e.to_string()))
            .and_then(|frame| demux.decode(frame));
        match decoded {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Container {} output stream: {}", container_id, e);
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    for chunk in demux.finish() {
        if tx.send(Ok(chunk)).await.is_err() {
            return;
        }
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("image", &self.runtime_config.image)
            .field("deadline", &self.execution.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::AccumulatingSink;
    use crate::runtime::ScriptedRuntime;
    use std::time::Duration;

    fn orchestrator(runtime: ScriptedRuntime) -> SessionOrchestrator {
        SessionOrchestrator::new(Arc::new(runtime), &CoderunConfig::default())
    }

    #[test]
    fn test_environment_spec_follows_config() {
        let orchestrator = orchestrator(ScriptedRuntime::new());
        let id = Uuid::new_v4();
        let spec = orchestrator.environment_spec(id);
        assert_eq!(spec.image, "golang:1.21");
        assert_eq!(spec.command, vec!["go", "run", "main.go"]);
        assert_eq!(spec.working_dir, "/app");
        assert!(spec.auto_remove);
        assert_eq!(spec.labels.get(SESSION_LABEL), Some(&id.to_string()));
        assert_eq!(spec.name, Some(format!("coderun-{}", id)));
    }

    #[tokio::test]
    async fn test_terminal_state_mapping() {
        assert_eq!(
            terminal_state_for(&ExecutionError::DeadlineExceeded(Duration::from_secs(1))),
            SessionState::TimedOut
        );
        assert_eq!(
            terminal_state_for(&ExecutionError::ClientDisconnected),
            SessionState::Cancelled
        );
        assert_eq!(
            terminal_state_for(&ExecutionError::StreamDecode("bad".into())),
            SessionState::Failed
        );
    }

    #[tokio::test]
    async fn test_pre_cancelled_session_never_creates() {
        let runtime = ScriptedRuntime::new().with_stdout("x");
        let orchestrator = orchestrator(runtime.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut sink = AccumulatingSink::new(1024);
        let report = orchestrator
            .execute(ExecutionRequest::new("print(1)"), &mut sink, cancel)
            .await;

        assert_eq!(report.state, SessionState::Cancelled);
        assert!(report.container_id.is_none());
        assert!(runtime.calls().is_empty());
    }
}
