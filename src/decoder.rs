//! ==============================================================================
//! decoder.rs - brace-delimited frame decoder for the device byte stream
//! ==============================================================================
//!
//! purpose:
//!     the firmware prints one json object per message with no length prefix.
//!     this decoder accumulates whatever bytes the serial port hands us and
//!     cuts `{ ... }` frames out of them, in arrival order.
//!
//! wire format:
//!
//! ```text
//!     ...noise {"ph":7.2,"tds":320}\r\n{"servo":1}\r\n{"tur
//!              └──────── frame ───────┘    └ frame ─┘    └ kept for next feed
//! ```
//!
//! ```text
//!     a frame ends at the first `}` and starts at the nearest `{` before
//!     it; an unclosed `{` earlier in the buffer is treated as noise. values
//!     containing braces and nested objects are not supported.
//! ```
//!
//! self-healing:
//!     - candidates under MIN_FRAME_LEN or over MAX_FRAME_LEN bytes are dropped
//!     - malformed json is counted; the count is logged every ERROR_LOG_EVERY
//!       failures and the buffer is flushed past ERROR_FLUSH_THRESHOLD
//!     - an open frame that grows past MAX_FRAME_LEN without closing can
//!       never be accepted, so it is truncated to its last `{` or cleared
//!
//! the buffer holds raw bytes rather than text so a frame split in the middle
//! of a multi-byte character decodes the same as one delivered whole.
//!
//! ==============================================================================

use crate::status::Frame;

/// shortest candidate worth parsing, e.g. `{"a":1}` is 7
pub const MIN_FRAME_LEN: usize = 5;
/// longer candidates are assumed to be two frames glued by line noise
pub const MAX_FRAME_LEN: usize = 500;
/// total leftover tolerance after extraction
pub const MAX_BUFFER_LEN: usize = 500;
pub const ERROR_LOG_EVERY: u64 = 1000;
pub const ERROR_FLUSH_THRESHOLD: u64 = 10_000;

/// streaming frame decoder
///
/// one instance lives for as long as the stream it reads from.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    error_count: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// feed freshly read bytes; returns every frame completed by them
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        if data.is_empty() {
            return frames;
        }
        self.buffer.extend_from_slice(data);

        if self.is_stalled() {
            self.truncate_stalled();
            return frames;
        }

        while let Some((start, end)) = find_frame(&self.buffer) {
            let candidate: Vec<u8> = self.buffer.drain(..=end).skip(start).collect();

            if candidate.len() < MIN_FRAME_LEN || candidate.len() > MAX_FRAME_LEN {
                continue;
            }

            match Frame::parse(&candidate) {
                Ok(frame) => {
                    self.error_count = 0;
                    frames.push(frame);
                }
                Err(e) => {
                    self.error_count += 1;
                    if self.error_count % ERROR_LOG_EVERY == 0 {
                        tracing::warn!(
                            "json parsing errors detected: {} so far (last: {})",
                            self.error_count,
                            e
                        );
                    }
                    if self.error_count > ERROR_FLUSH_THRESHOLD {
                        tracing::warn!("flushing frame buffer after {} parse errors", self.error_count);
                        self.buffer.clear();
                        self.error_count = 0;
                        break;
                    }
                }
            }
        }

        // leftover noise; only a trailing open frame is worth keeping
        if self.buffer.len() > MAX_BUFFER_LEN {
            match rfind(&self.buffer, b'{') {
                Some(last_open) => {
                    self.buffer.drain(..last_open);
                }
                None => self.buffer.clear(),
            }
        }

        frames
    }

    /// drop any partial frame, e.g. after the port was reopened
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    // an open frame with no `}` yet that is already too long to be accepted
    fn is_stalled(&self) -> bool {
        match self.buffer.iter().position(|&b| b == b'{') {
            Some(start) => {
                self.buffer.len() - start > MAX_FRAME_LEN && !self.buffer[start..].contains(&b'}')
            }
            None => false,
        }
    }

    fn truncate_stalled(&mut self) {
        if let Some(last_open) = rfind(&self.buffer, b'{') {
            self.buffer.drain(..last_open);
        }
        if self.buffer.len() > MAX_FRAME_LEN {
            self.buffer.clear();
        }
    }
}

/// locate the first complete `{...}` in `bytes`
///
/// returns inclusive `(start, end)` indices. `start` is the last `{` before
/// `end`, so a dangling `{` ahead of a real frame does not swallow it.
pub fn find_frame(bytes: &[u8]) -> Option<(usize, usize)> {
    let first_open = bytes.iter().position(|&b| b == b'{')?;
    let end = bytes[first_open..].iter().position(|&b| b == b'}')? + first_open;
    let start = rfind(&bytes[..end], b'{')?;
    Some((start, end))
}

fn rfind(bytes: &[u8], needle: u8) -> Option<usize> {
    bytes.iter().rposition(|&b| b == needle)
}
