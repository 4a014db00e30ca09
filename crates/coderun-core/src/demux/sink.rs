//! Destinations for demultiplexed output.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::OutputChunk;

/// The receiving side of a sink has gone away.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("output receiver closed")]
pub struct SinkClosed;

/// Output retained by a sink once the session is over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedOutput {
    pub text: String,
    pub truncated: bool,
}

#[async_trait]
pub trait OutputSink: Send {
    /// Hand one chunk to the caller. Chunks arrive in sequence order.
    async fn deliver(&mut self, chunk: OutputChunk) -> Result<(), SinkClosed>;

    /// Whatever the sink kept for the final result. Sinks that forward
    /// chunks as they arrive keep nothing.
    fn take_output(&mut self) -> CollectedOutput {
        CollectedOutput::default()
    }
}

/// Interleaves stdout and stderr into one buffer, the way a terminal would
/// show them.
#[derive(Debug)]
pub struct AccumulatingSink {
    buffer: String,
    limit: usize,
    truncated: bool,
}

impl AccumulatingSink {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
            truncated: false,
        }
    }
}

#[async_trait]
impl OutputSink for AccumulatingSink {
    async fn deliver(&mut self, chunk: OutputChunk) -> Result<(), SinkClosed> {
        if self.truncated {
            return Ok(());
        }
        let text = chunk.text();
        let room = self.limit.saturating_sub(self.buffer.len());
        if text.len() <= room {
            self.buffer.push_str(&text);
        } else {
            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.push_str(&text[..cut]);
            self.truncated = true;
            log::debug!("Output exceeded {} bytes; dropping the rest", self.limit);
        }
        Ok(())
    }

    fn take_output(&mut self) -> CollectedOutput {
        CollectedOutput {
            text: std::mem::take(&mut self.buffer),
            truncated: self.truncated,
        }
    }
}

/// Pushes each chunk to a bounded channel as soon as it is decoded. A full
/// channel applies backpressure; a dropped receiver means the caller is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutputChunk>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutputChunk>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn deliver(&mut self, chunk: OutputChunk) -> Result<(), SinkClosed> {
        self.tx.send(chunk).await.map_err(|_| SinkClosed)
    }
}
