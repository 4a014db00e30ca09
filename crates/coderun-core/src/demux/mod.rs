//! Output demultiplexing.
//!
//! The runtime delivers stdout and stderr interleaved on one stream, each frame
//! tagged with its origin. [`Demultiplexer`] turns those frames into
//! [`OutputChunk`]s carrying a monotonic sequence number, and keeps every
//! chunk on a UTF-8 character boundary: a multi-byte character split across
//! two frames is held back until its remaining bytes arrive, so transports
//! that emit text frames never have to cut a character in half.
//!
//! Where the chunks go is decided by an [`OutputSink`]: pushed to the caller
//! one by one ([`ChannelSink`]) or accumulated into one buffer
//! ([`AccumulatingSink`]).

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::borrow::Cow;

use crate::errors::ExecutionError;
use crate::runtime::LogFrame;

pub mod sink;

pub use sink::{AccumulatingSink, ChannelSink, CollectedOutput, OutputSink, SinkClosed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Bytes,
    /// Position across both streams; strictly increasing within each stream.
    pub sequence: u64,
}

impl OutputChunk {
    /// Chunk contents as text. Invalid sequences become U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug, Default)]
pub struct Demultiplexer {
    next_sequence: u64,
    stdout_carry: BytesMut,
    stderr_carry: BytesMut,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame. Returns `None` when the frame only contained the
    /// start of a character that continues in a later frame.
    pub fn decode(&mut self, frame: LogFrame) -> Result<Option<OutputChunk>, ExecutionError> {
        let (stream, payload) = match frame {
            LogFrame::StdOut(payload) | LogFrame::Console(payload) => (StreamKind::Stdout, payload),
            LogFrame::StdErr(payload) => (StreamKind::Stderr, payload),
            LogFrame::StdIn(payload) => {
                return Err(ExecutionError::StreamDecode(format!(
                    "unexpected stdin frame of {} bytes on output stream",
                    payload.len()
                )))
            }
        };

        let carry = self.carry_mut(stream);
        let bytes = if carry.is_empty() {
            let tail = incomplete_utf8_tail(&payload);
            let complete = payload.len() - tail;
            carry.extend_from_slice(&payload[complete..]);
            payload.slice(..complete)
        } else {
            carry.extend_from_slice(&payload);
            let tail = incomplete_utf8_tail(&carry[..]);
            let complete = carry.len() - tail;
            carry.split_to(complete).freeze()
        };

        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.chunk(stream, bytes)))
    }

    /// Flush bytes still held back at end of stream.
    pub fn finish(&mut self) -> Vec<OutputChunk> {
        let mut remaining = Vec::new();
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let carry = self.carry_mut(stream);
            if !carry.is_empty() {
                let bytes = carry.split().freeze();
                remaining.push(self.chunk(stream, bytes));
            }
        }
        remaining
    }

    fn carry_mut(&mut self, stream: StreamKind) -> &mut BytesMut {
        match stream {
            StreamKind::Stdout => &mut self.stdout_carry,
            StreamKind::Stderr => &mut self.stderr_carry,
        }
    }

    fn chunk(&mut self, stream: StreamKind, bytes: Bytes) -> OutputChunk {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        OutputChunk {
            stream,
            bytes,
            sequence,
        }
    }
}

/// Number of trailing bytes forming the unfinished start of a UTF-8 character.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    // A character is at most four bytes, so only the last three can be an
    // unfinished prefix.
    let window = bytes.len().min(3);
    for back in 1..=window {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let expected = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => 1,
        };
        return if expected > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout(bytes: &[u8]) -> LogFrame {
        LogFrame::StdOut(Bytes::copy_from_slice(bytes))
    }

    fn stderr(bytes: &[u8]) -> LogFrame {
        LogFrame::StdErr(Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn test_frames_are_tagged_and_sequenced() {
        let mut demux = Demultiplexer::new();
        let a = demux.decode(stdout(b"one\n")).unwrap().unwrap();
        let b = demux.decode(stderr(b"oops\n")).unwrap().unwrap();
        let c = demux.decode(stdout(b"two\n")).unwrap().unwrap();

        assert_eq!(a.stream, StreamKind::Stdout);
        assert_eq!(b.stream, StreamKind::Stderr);
        assert_eq!(c.stream, StreamKind::Stdout);
        assert!(a.sequence < b.sequence && b.sequence < c.sequence);
        assert_eq!(c.text(), "two\n");
    }

    #[test]
    fn test_console_frames_count_as_stdout() {
        let mut demux = Demultiplexer::new();
        let chunk = demux
            .decode(LogFrame::Console(Bytes::from_static(b"tty output")))
            .unwrap()
            .unwrap();
        assert_eq!(chunk.stream, StreamKind::Stdout);
    }

    #[test]
    fn test_split_character_is_held_back() {
        let snowman = "☃".as_bytes(); // e2 98 83
        let mut demux = Demultiplexer::new();

        let mut first = b"a".to_vec();
        first.extend_from_slice(&snowman[..2]);
        let chunk = demux.decode(stdout(&first)).unwrap().unwrap();
        assert_eq!(chunk.text(), "a");

        let mut second = snowman[2..].to_vec();
        second.extend_from_slice(b"b");
        let chunk = demux.decode(stdout(&second)).unwrap().unwrap();
        assert_eq!(chunk.text(), "☃b");
    }

    #[test]
    fn test_partial_character_alone_yields_nothing() {
        let mut demux = Demultiplexer::new();
        let emoji = "🦀".as_bytes();
        assert!(demux.decode(stdout(&emoji[..1])).unwrap().is_none());
        assert!(demux.decode(stdout(&emoji[1..3])).unwrap().is_none());
        let chunk = demux.decode(stdout(&emoji[3..])).unwrap().unwrap();
        assert_eq!(chunk.text(), "🦀");
        assert_eq!(chunk.sequence, 0);
    }

    #[test]
    fn test_streams_keep_separate_carries() {
        let mut demux = Demultiplexer::new();
        let e_acute = "é".as_bytes();
        assert!(demux.decode(stdout(&e_acute[..1])).unwrap().is_none());
        let err = demux.decode(stderr(b"warn")).unwrap().unwrap();
        assert_eq!(err.text(), "warn");
        let out = demux.decode(stdout(&e_acute[1..])).unwrap().unwrap();
        assert_eq!(out.text(), "é");
    }

    #[test]
    fn test_finish_flushes_dangling_bytes() {
        let mut demux = Demultiplexer::new();
        assert!(demux.decode(stderr(&[0xe2, 0x98])).unwrap().is_none());
        let rest = demux.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].stream, StreamKind::Stderr);
        assert_eq!(rest[0].bytes.as_ref(), &[0xe2, 0x98]);
        assert!(demux.finish().is_empty());
    }

    #[test]
    fn test_stdin_frame_is_a_decode_error() {
        let mut demux = Demultiplexer::new();
        let err = demux
            .decode(LogFrame::StdIn(Bytes::from_static(b"x")))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::StreamDecode(_)));
    }

    #[test]
    fn test_invalid_bytes_pass_through() {
        let mut demux = Demultiplexer::new();
        let chunk = demux.decode(stdout(&[0xff, b'o', b'k'])).unwrap().unwrap();
        assert_eq!(chunk.text(), "\u{fffd}ok");
    }

    #[test]
    fn test_incomplete_tail_detection() {
        assert_eq!(incomplete_utf8_tail(b"plain"), 0);
        assert_eq!(incomplete_utf8_tail("☃".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(&"☃".as_bytes()[..1]), 1);
        assert_eq!(incomplete_utf8_tail(&"🦀".as_bytes()[..3]), 3);
        assert_eq!(incomplete_utf8_tail(b""), 0);
    }
}
