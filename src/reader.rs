//! ==============================================================================
//! reader.rs - telemetry read loop
//! ==============================================================================
//!
//! purpose:
//!     every tick, take the device link, pull whatever bytes are waiting, run
//!     them through the frame decoder and merge the frames into the status
//!     store. read failures feed `LinkHealth`, which decides when the port is
//!     cycled (close, pause, reopen, settle).
//!
//! relationships:
//!     - uses: decoder.rs, link.rs, stream.rs, status.rs
//!     - shares the device link lock with: channel.rs
//!
//! ==============================================================================

use crate::decoder::FrameDecoder;
use crate::link::LinkHealth;
use crate::shutdown::Shutdown;
use crate::status::StatusStore;
use crate::stream::{self, DeviceLink, StreamError, StreamResult};
use std::time::{Duration, Instant};

/// pauses around a port reset
#[derive(Debug, Clone, Copy)]
pub struct ResetTiming {
    /// after close, before reopen
    pub pause: Duration,
    /// after reopen, while the microcontroller reboots
    pub settle: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(1),
            settle: Duration::from_secs(2),
        }
    }
}

pub struct DeviceReader {
    link: DeviceLink,
    status: StatusStore,
    decoder: FrameDecoder,
    health: LinkHealth,
    reset_timing: ResetTiming,
    /// keep retrying a port that failed to reopen
    reconnect: bool,
}

impl DeviceReader {
    pub fn new(link: DeviceLink, status: StatusStore, health: LinkHealth, reset_timing: ResetTiming, reconnect: bool) -> Self {
        Self {
            link,
            status,
            decoder: FrameDecoder::new(),
            health,
            reset_timing,
            reconnect,
        }
    }

    /// read once; returns how many frames were applied
    pub async fn poll_once(&mut self) -> StreamResult<usize> {
        let bytes = {
            let mut stream = self.link.lock().await;
            if !stream.is_open() {
                return Err(StreamError::NotOpen);
            }
            stream.read_available()?
        };

        let frames = self.decoder.feed(&bytes);
        self.status.apply_all(&frames).await;
        Ok(frames.len())
    }

    /// one loop iteration: reset if due, then read
    ///
    /// returns `false` when the reader should stop.
    pub async fn tick(&mut self, now: Instant) -> bool {
        if self.health.should_reset(now) {
            tracing::warn!(
                "too many serial errors ({}), attempting to reset serial connection...",
                self.health.failures()
            );
            let reset = self.reset().await;
            self.health.mark_reset(now, reset.is_ok());
            match reset {
                Ok(()) => tracing::info!("serial port reset successful"),
                Err(e) if self.reconnect => {
                    tracing::error!("serial port reset failed: {}; retrying after cooldown", e)
                }
                Err(e) => {
                    tracing::error!("serial port reset failed: {}; reconnect disabled, stopping", e);
                    return false;
                }
            }
        }

        match self.poll_once().await {
            Ok(_) => self.health.record_success(),
            Err(e) => {
                self.health.record_failure();
                tracing::debug!("error processing serial data: {}", e);
            }
        }
        true
    }

    /// read until shutdown; the stream is left for the owner to close
    ///
    /// an error means the link was lost for good; shutdown has been
    /// triggered for the other tasks by then.
    pub async fn run(mut self, tick: Duration, shutdown: Shutdown) -> anyhow::Result<()> {
        tracing::info!("device reader started ({}ms tick)", tick.as_millis());
        let mut lost = false;
        while !shutdown.is_triggered() {
            if !self.tick(Instant::now()).await {
                lost = true;
                shutdown.trigger();
                break;
            }
            if !shutdown.sleep(tick).await {
                break;
            }
        }
        tracing::info!("device reader stopped");

        if lost {
            anyhow::bail!("serial link lost and reconnect is disabled");
        }
        Ok(())
    }

    /// close, pause, reopen, settle; holds the link for the whole sequence
    async fn reset(&mut self) -> StreamResult<()> {
        let mut guard = stream::lock(&self.link).await;
        guard.close();
        tokio::time::sleep(self.reset_timing.pause).await;
        let (guard, ()) = stream::blocking(guard, |s| s.reopen()).await?;
        tokio::time::sleep(self.reset_timing.settle).await;
        self.decoder.reset();
        drop(guard);
        Ok(())
    }

    #[cfg(test)]
    pub fn health(&self) -> &LinkHealth {
        &self.health
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::MemoryStream;
    use crate::stream::shared;

    const COOLDOWN: Duration = Duration::from_secs(60);

    fn no_pause() -> ResetTiming {
        ResetTiming { pause: Duration::ZERO, settle: Duration::ZERO }
    }

    fn reader(stream: &MemoryStream, start: Instant, reconnect: bool) -> (DeviceReader, StatusStore) {
        let status = StatusStore::new();
        let health = LinkHealth::new(100, COOLDOWN, start);
        let reader = DeviceReader::new(shared(stream.clone()), status.clone(), health, no_pause(), reconnect);
        (reader, status)
    }

    #[tokio::test]
    async fn test_telemetry_reaches_status() {
        let stream = MemoryStream::new();
        let (mut reader, status) = reader(&stream, Instant::now(), false);

        stream.push(br#"{"ph":7.2,"tds":320}{"ser"#);
        assert_eq!(reader.poll_once().await.unwrap(), 1);
        stream.push(br#"vo":1}"#);
        assert_eq!(reader.poll_once().await.unwrap(), 1);

        let snapshot = status.snapshot().await;
        assert_eq!(snapshot.ph, 7.2);
        assert_eq!(snapshot.tds, 320.0);
        assert!(snapshot.servo_state);
    }

    #[tokio::test]
    async fn test_failures_trigger_one_reset_per_cooldown() {
        let stream = MemoryStream::new();
        let start = Instant::now();
        let (mut reader, _) = reader(&stream, start, false);
        stream.set(|w| w.fail_reads = true);

        for _ in 0..101 {
            assert!(reader.tick(start).await);
        }
        assert_eq!(stream.get(|w| w.reopens), 0);

        // first reset once the cooldown since startup has passed
        let first = start + COOLDOWN;
        assert!(reader.tick(first).await);
        assert_eq!(stream.get(|w| w.reopens), 1);

        // the device keeps failing: 150 errors inside 10 seconds
        stream.set(|w| w.fail_reads = true);
        for i in 0..150u64 {
            reader.tick(first + Duration::from_millis(i * 66)).await;
        }
        assert_eq!(stream.get(|w| w.reopens), 1);

        reader.tick(first + COOLDOWN).await;
        assert_eq!(stream.get(|w| w.reopens), 2);
    }

    #[tokio::test]
    async fn test_failed_reset_stops_without_reconnect() {
        let stream = MemoryStream::new();
        let start = Instant::now();
        let (mut reader, _) = reader(&stream, start, false);
        stream.set(|w| {
            w.fail_reads = true;
            w.fail_reopen = true;
        });
        for _ in 0..101 {
            reader.tick(start).await;
        }
        assert!(!reader.tick(start + COOLDOWN).await);
    }

    #[tokio::test]
    async fn test_failed_reset_retried_with_reconnect() {
        let stream = MemoryStream::new();
        let start = Instant::now();
        let (mut reader, _) = reader(&stream, start, true);
        stream.set(|w| {
            w.fail_reads = true;
            w.fail_reopen = true;
        });
        for _ in 0..101 {
            reader.tick(start).await;
        }
        assert!(reader.tick(start + COOLDOWN).await);
        assert!(reader.tick(start + COOLDOWN + Duration::from_secs(1)).await);
        assert_eq!(stream.get(|w| w.reopens), 1);

        stream.set(|w| w.fail_reopen = false);
        assert!(reader.tick(start + COOLDOWN * 2).await);
        assert_eq!(stream.get(|w| w.reopens), 2);
        assert!(stream.get(|w| w.open));
        assert_eq!(reader.health().failures(), 0);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let stream = MemoryStream::new();
        let (reader, _) = reader(&stream, Instant::now(), false);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(reader.run(Duration::from_millis(5), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
