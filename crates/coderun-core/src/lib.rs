//! Core of the coderun execution service.
//!
//! Runs one untrusted snippet per request inside a freshly created,
//! single-use container and relays its console output, either accumulated
//! into one result or chunk by chunk as it is produced.
//!
//! # Architecture Overview
//!
//! - **Payload packaging**: source text becomes a single-entry tar archive
//! - **Runtime facade**: the only code that talks to the container engine;
//!   injected as a trait object so tests can script it
//! - **Output demultiplexing**: tagged output frames become ordered chunks,
//!   handed to a sink that streams or accumulates them
//! - **Session orchestration**: the lifecycle state machine that owns the
//!   deadline, cancellation and guaranteed container removal
//! - **Configuration**: YAML-backed settings with environment placeholders

pub mod config;
pub mod demux;
pub mod errors;
pub mod orchestrator;
pub mod packager;
pub mod runtime;
pub mod session;

pub use config::{CoderunConfig, ConfigLoader};
pub use demux::{AccumulatingSink, ChannelSink, OutputChunk, OutputSink, StreamKind};
pub use errors::{ConfigError, ExecutionError, RuntimeClientError};
pub use orchestrator::SessionOrchestrator;
pub use runtime::{DockerRuntime, RuntimeClient};
pub use session::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, SessionReport, SessionState,
};
pub use tokio_util::sync::CancellationToken;
