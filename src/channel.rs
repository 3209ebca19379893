//! ==============================================================================
//! channel.rs - actuator commands to the device, with bounded ack wait
//! ==============================================================================
//!
//! purpose:
//!     writes one `ControlCommand` as a json line and waits a bounded time for
//!     the firmware to answer with a `{...}` frame. the answer is merged into
//!     the status store as device-confirmed state.
//!
//! sequence (all under the device link lock):
//!
//! ```text
//!     drain stale input -> write line -> flush -> settle -> poll for `{...}`
//!                                                           (until ack_timeout)
//! ```
//!
//! a missing ack is logged but the send still counts as successful; only a
//! closed stream or a failed write/flush is an error.
//!
//! ==============================================================================

use crate::command::ControlCommand;
use crate::decoder::FrameDecoder;
use crate::status::{Frame, StatusStore};
use crate::stream::{self, ByteStream, DeviceLink, StreamError, StreamResult};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no valid actuator keys in command")]
    Empty,
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// ack wait timing
#[derive(Debug, Clone, Copy)]
pub struct AckTiming {
    /// total time budget for the ack, settle included
    pub timeout: Duration,
    /// pause before the first read so the firmware can act on the command
    pub settle: Duration,
    pub poll: Duration,
}

impl Default for AckTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            settle: Duration::from_millis(500),
            poll: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct CommandChannel {
    link: DeviceLink,
    status: StatusStore,
    timing: AckTiming,
}

impl CommandChannel {
    pub fn new(link: DeviceLink, status: StatusStore, timing: AckTiming) -> Self {
        Self { link, status, timing }
    }

    /// send `command` and wait for the device's answer
    ///
    /// every frame in the answer is merged into the status store; the first
    /// one is returned as the ack.
    pub async fn send(&self, command: &ControlCommand) -> Result<Option<Frame>, CommandError> {
        if command.is_empty() {
            tracing::warn!("no valid commands to send");
            return Err(CommandError::Empty);
        }

        let guard = stream::lock(&self.link).await;
        if !guard.is_open() {
            tracing::error!("serial connection is not open, dropping command {}", command);
            return Err(StreamError::NotOpen.into());
        }

        let line = command.to_line();
        let (mut guard, ()) = match stream::blocking(guard, move |s| write_line(s, &line)).await {
            Ok(held) => held,
            Err(e) => {
                tracing::error!("error sending command {} to device: {}", command, e);
                return Err(e.into());
            }
        };
        tracing::info!("sent command to device: {}", command);

        let frames = self.await_frames(&mut **guard).await;
        drop(guard);

        if frames.is_empty() {
            tracing::warn!("no valid json response from device after command {}", command);
            return Ok(None);
        }
        tracing::debug!("parsed response: {:?}", frames);
        self.status.apply_all(&frames).await;
        Ok(frames.into_iter().next())
    }

    async fn await_frames(&self, stream: &mut dyn ByteStream) -> Vec<Frame> {
        let deadline = Instant::now() + self.timing.timeout;
        tokio::time::sleep(self.timing.settle.min(self.timing.timeout)).await;

        // same framing rules as telemetry
        let mut decoder = FrameDecoder::new();
        loop {
            match stream.read_available() {
                Ok(bytes) if !bytes.is_empty() => {
                    tracing::debug!("received from device: {}", String::from_utf8_lossy(&bytes).trim());
                    let frames = decoder.feed(&bytes);
                    if !frames.is_empty() {
                        if decoder.buffered() > 0 {
                            tracing::debug!("dropped {} bytes of a partial frame after the response", decoder.buffered());
                        }
                        return frames;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("error reading response: {}", e),
            }

            if Instant::now() >= deadline {
                return Vec::new();
            }
            tokio::time::sleep(self.timing.poll).await;
        }
    }
}

fn write_line(stream: &mut dyn ByteStream, line: &str) -> StreamResult<()> {
    // stale telemetry in the input buffer would be mistaken for the ack
    if stream.bytes_available()? > 0 {
        let stale = stream.read_available()?;
        tracing::debug!("discarded {} stale bytes before command", stale.len());
    }

    tracing::debug!("writing to serial: {}", line.trim_end());
    stream.write_all(line.as_bytes())?;
    stream.flush()
}
