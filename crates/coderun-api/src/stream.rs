//! Streaming transport over WebSocket.
//!
//! The client opens `GET /v1/execute` with an upgrade and sends one text
//! frame `{"text": "..."}`. Every output chunk then arrives as its own text
//! frame, in the order the program produced it. The server ends the
//! exchange with a close frame: code 1000 once the program has exited,
//! otherwise an application code carrying a short status phrase. Error
//! details stay in the server log.
//!
//! While the program runs, a close frame, a dropped connection or a text
//! frame reading `cancel` cancels the session. Once the deadline has passed
//! no further output frames are written, even ones already queued. A client
//! that stops reading gets at most `drain_grace` after the session ends
//! before the handler gives up on it.

use axum::extract::ws::{CloseFrame, Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use coderun_core::{
    CancellationToken, ChannelSink, ExecutionError, ExecutionRequest, OutputChunk,
    SessionOrchestrator, SessionReport, SessionState,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::AppState;

/// Text frame a client sends to abandon a running session.
pub const CANCEL_COMMAND: &str = "cancel";

const CLOSE_NORMAL: u16 = 1000;

/// Handler for `GET /v1/execute` with a WebSocket upgrade.
pub async fn stream_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let orchestrator = state.orchestrator.clone();
    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        run_stream_session(orchestrator, sender, receiver).await;
    })
}

enum FirstMessage {
    Malformed(String),
    Disconnected,
}

/// Drive one streaming session over an already-upgraded connection.
///
/// Returns the session report, or `None` when no session was started
/// because the client never sent a usable request.
pub async fn run_stream_session<Tx, Rx, E>(
    orchestrator: Arc<SessionOrchestrator>,
    mut sender: Tx,
    mut receiver: Rx,
) -> Option<SessionReport>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: fmt::Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let wait = orchestrator.execution_config().deadline();
    let grace = orchestrator.execution_config().drain_grace();
    let request = match tokio::time::timeout(wait, read_request(&mut receiver)).await {
        Ok(Ok(request)) => request,
        Ok(Err(FirstMessage::Malformed(reason))) => {
            log::warn!("Failed to read streaming request: {}", reason);
            close_with(&mut sender, 400, "Bad Request", grace).await;
            return None;
        }
        Ok(Err(FirstMessage::Disconnected)) => {
            log::info!("Streaming client left before sending a request");
            return None;
        }
        Err(_) => {
            log::warn!("No streaming request received within {:?}", wait);
            close_with(&mut sender, 408, "Request Timeout", grace).await;
            return None;
        }
    };

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_client(receiver, cancel.clone()));

    let (chunk_tx, mut chunk_rx) =
        mpsc::channel::<OutputChunk>(orchestrator.execution_config().output_buffer);

    let finished = CancellationToken::new();
    let expired = CancellationToken::new();

    let session = async {
        let mut sink = ChannelSink::new(chunk_tx);
        let report = orchestrator.execute(request, &mut sink, cancel.clone()).await;
        if report.state == SessionState::TimedOut {
            expired.cancel();
        }
        finished.cancel();
        report
    };
    let relay = async {
        let stalled = async {
            finished.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(stalled);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = expired.cancelled() => break,
                _ = cancel.cancelled() => break,
                chunk = chunk_rx.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            let text = chunk.text().into_owned();
            tokio::select! {
                biased;
                _ = expired.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = &mut stalled => {
                    log::warn!("Streaming client stopped reading; dropping remaining output");
                    break;
                }
                sent = sender.send(Message::Text(text.into())) => {
                    if let Err(e) = sent {
                        log::info!("Streaming client unreachable: {}", e);
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        drop(chunk_rx);
    };
    let (report, ()) = tokio::join!(session, relay);

    watcher.abort();

    match report.error.as_ref() {
        None => close_with(&mut sender, CLOSE_NORMAL, "", grace).await,
        Some(ExecutionError::ClientDisconnected) => {
            // Usually nobody is listening any more; try anyway.
            close_with(&mut sender, CLOSE_NORMAL, "", grace).await
        }
        Some(e) => close_with(&mut sender, e.status_code(), e.close_reason(), grace).await,
    }

    Some(report)
}

async fn read_request<Rx, E>(receiver: &mut Rx) -> Result<ExecutionRequest, FirstMessage>
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(message) = receiver.next().await {
        let parsed = match message {
            Ok(Message::Text(text)) => serde_json::from_str::<ExecutionRequest>(text.as_str()),
            Ok(Message::Binary(bytes)) => serde_json::from_slice::<ExecutionRequest>(&bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Err(FirstMessage::Disconnected),
            Err(e) => {
                log::debug!("Streaming client error before request: {}", e);
                return Err(FirstMessage::Disconnected);
            }
        };
        return parsed.map_err(|e| FirstMessage::Malformed(e.to_string()));
    }
    Err(FirstMessage::Disconnected)
}

/// Cancel the session once the client closes, errors out, hangs up or asks
/// for it. Other frames are ignored.
async fn watch_client<Rx, E>(mut receiver: Rx, cancel: CancellationToken)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) if text.as_str().trim() == CANCEL_COMMAND => {
                log::info!("Streaming client requested cancellation");
                break;
            }
            Ok(Message::Close(_)) => {
                log::info!("Streaming client closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::info!("Streaming client connection error: {}", e);
                break;
            }
        }
    }
    cancel.cancel();
}

/// Send a close frame, giving up after `limit`. Anything other than a normal
/// close maps the HTTP status into the application range (4000 + status).
async fn close_with<Tx>(sender: &mut Tx, status: u16, reason: &str, limit: Duration)
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    let code = if status == CLOSE_NORMAL {
        CLOSE_NORMAL
    } else {
        4000 + status
    };
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let closing = async {
        if let Err(e) = sender.send(Message::Close(Some(frame))).await {
            log::debug!("Failed to send close frame {}: {}", code, e);
        }
        let _ = sender.close().await;
    };
    if tokio::time::timeout(limit, closing).await.is_err() {
        log::warn!("Streaming client did not accept close frame {} within {:?}", code, limit);
    }
}
