//! Reassembly of terminator-delimited protocol messages from socket reads.
//!
//! A read may end anywhere, including inside a message or between the two
//! bytes of the terminator. Everything after the last complete terminator is
//! held back and prefixed to the next read, so the sequence of frames does
//! not depend on how the byte stream was chunked.

use simd_json::serde::from_slice;
use thiserror::Error;
use tracing::error;

use crate::events::{StreamMessage, TERMINATOR};

/// Upper bound on buffered bytes without a terminator. A peer that never
/// terminates a message would otherwise grow the buffer without limit.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("segment is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("segment is not a protocol message: {0}")]
    Json(#[from] simd_json::Error),
}

/// One complete inbound message tagged with its local receive time.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Wall-clock receive time in epoch milliseconds.
    pub received_at: u64,
    pub raw: String,
    pub message: StreamMessage,
}

/// Parse one terminated segment (without its terminator).
pub fn parse_segment(segment: &[u8], received_at: u64) -> Result<Frame, FrameError> {
    let raw = std::str::from_utf8(segment)?.to_string();
    let mut bytes = segment.to_vec();
    let message = from_slice::<StreamMessage>(&mut bytes)?;
    Ok(Frame {
        received_at,
        raw,
        message,
    })
}

#[derive(Debug, Default)]
pub struct FrameReassembler {
    pending: Vec<u8>,
    parse_errors: u64,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a socket read and iterate the complete messages now available,
    /// in arrival order. Frames not pulled from the iterator stay buffered.
    pub fn push(&mut self, chunk: &[u8], received_at: u64) -> Frames<'_> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > MAX_PENDING_BYTES
            && find_terminator(&self.pending).is_none()
        {
            error!(
                pending = self.pending.len(),
                "discarding unterminated data over the buffer limit"
            );
            self.parse_errors += 1;
            self.pending.clear();
        }
        Frames {
            owner: self,
            received_at,
            consumed: 0,
        }
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Number of terminated segments that failed to parse.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Drop any partial fragment. Used when the socket is replaced, since a
    /// fragment never continues across connections.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}

/// Lazy iterator over the frames completed by one [`FrameReassembler::push`].
pub struct Frames<'a> {
    owner: &'a mut FrameReassembler,
    received_at: u64,
    consumed: usize,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            let rest = &self.owner.pending[self.consumed..];
            let end = find_terminator(rest)?;
            let segment = &rest[..end];
            let start = self.consumed;
            self.consumed += end + TERMINATOR.len();
            if segment.is_empty() {
                continue;
            }
            match parse_segment(segment, self.received_at) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    self.owner.parse_errors += 1;
                    let offending =
                        String::from_utf8_lossy(&self.owner.pending[start..start + end]);
                    error!(error = %e, segment = %offending, "failed to parse stream message");
                    if crate::config::metrics_enabled() {
                        metrics::counter!("stream_parse_errors_total").increment(1);
                    }
                }
            }
        }
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        self.owner.pending.drain(..self.consumed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_split_across_reads_is_rejoined() {
        let mut r = FrameReassembler::new();
        assert_eq!(r.push(b"{\"op\":\"connection\"}\r", 1).count(), 0);
        let frames: Vec<_> = r.push(b"\n", 2).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].received_at, 2);
        assert!(r.pending().is_empty());
    }

    #[test]
    fn unpulled_frames_stay_buffered() {
        let mut r = FrameReassembler::new();
        let data = b"{\"op\":\"connection\"}\r\n{\"op\":\"status\"}\r\n";
        {
            let mut frames = r.push(data, 1);
            assert!(frames.next().is_some());
        }
        let rest: Vec<_> = r.push(b"", 2).collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message.op(), "status");
    }

    #[test]
    fn oversized_unterminated_data_is_dropped() {
        let mut r = FrameReassembler::new();
        let big = vec![b'x'; MAX_PENDING_BYTES + 1];
        assert_eq!(r.push(&big, 1).count(), 0);
        assert!(r.pending().is_empty());
        assert_eq!(r.parse_errors(), 1);
    }
}
