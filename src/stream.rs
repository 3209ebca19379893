//! ==============================================================================
//! stream.rs - byte stream abstraction over the serial link
//! ==============================================================================
//!
//! purpose:
//!     the core only needs "how many bytes are waiting", "give me them",
//!     "write these", "flush" and a way to close and reopen the link.
//!     `SerialStream` provides that on top of the `serialport` crate; tests use
//!     an in-memory stream instead.
//!
//! relationships:
//!     - used by: reader.rs (telemetry), channel.rs (commands)
//!     - shared as: `DeviceLink` (one tokio mutex around the stream)
//!
//! ==============================================================================

use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("serial connection is not open")]
    NotOpen,
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking serial task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// minimal byte stream the bridge core runs on
///
/// `read_available` must not block waiting for data that has not arrived.
pub trait ByteStream: Send {
    fn is_open(&self) -> bool;
    fn bytes_available(&mut self) -> StreamResult<usize>;
    fn read_available(&mut self) -> StreamResult<Vec<u8>>;
    fn write_all(&mut self, bytes: &[u8]) -> StreamResult<()>;
    fn flush(&mut self) -> StreamResult<()>;
    fn close(&mut self);
    /// open again with the same path and baud rate
    fn reopen(&mut self) -> StreamResult<()>;
}

/// the device stream shared by the reader and the command channel
///
/// holding the lock gives exclusive use of the link, which is what keeps a
/// command's ack from being swallowed by the telemetry reader.
pub type DeviceLink = Arc<Mutex<Box<dyn ByteStream>>>;

pub fn shared(stream: impl ByteStream + 'static) -> DeviceLink {
    Arc::new(Mutex::new(Box::new(stream)))
}

/// exclusive, owned hold on the device link
pub type LinkGuard = OwnedMutexGuard<Box<dyn ByteStream>>;

pub async fn lock(link: &DeviceLink) -> LinkGuard {
    link.clone().lock_owned().await
}

/// run a blocking stream call (open, write, flush) on the blocking pool
///
/// the link stays locked for the duration and the guard is handed back.
pub async fn blocking<T, F>(mut guard: LinkGuard, op: F) -> StreamResult<(LinkGuard, T)>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn ByteStream) -> StreamResult<T> + Send + 'static,
{
    let (guard, result) = tokio::task::spawn_blocking(move || {
        let result = op(&mut **guard);
        (guard, result)
    })
    .await?;
    Ok((guard, result?))
}

/// serial port backed stream
pub struct SerialStream {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialStream {
    /// port read timeout; reads are sized to what is available so this only
    /// bounds a misbehaving driver
    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn open(path: &str, baud_rate: u32) -> StreamResult<Self> {
        let mut stream = Self {
            path: path.to_string(),
            baud_rate,
            port: None,
        };
        stream.reopen()?;
        Ok(stream)
    }

    fn port(&mut self) -> StreamResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(StreamError::NotOpen)
    }
}

impl ByteStream for SerialStream {
    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn bytes_available(&mut self) -> StreamResult<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn read_available(&mut self) -> StreamResult<Vec<u8>> {
        let available = self.bytes_available()?;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; available];
        let n = self.port()?.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> StreamResult<()> {
        self.port()?.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        self.port()?.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("serial connection {} closed", self.path);
        }
    }

    fn reopen(&mut self) -> StreamResult<()> {
        self.port = None;
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Self::READ_TIMEOUT)
            .open()?;
        self.port = Some(port);
        tracing::info!("connected to {} at {} baud", self.path, self.baud_rate);
        Ok(())
    }
}


// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::memory::MemoryStream;
    use super::*;

    #[tokio::test]
    async fn test_blocking_write_keeps_link_locked() {
        let stream = MemoryStream::new();
        let link = shared(stream.clone());

        let guard = lock(&link).await;
        let (guard, ()) = blocking(guard, |s| {
            s.write_all(b"{\"servo\":1}\n")?;
            s.flush()
        })
        .await
        .unwrap();

        assert!(link.try_lock().is_err());
        drop(guard);
        assert!(link.try_lock().is_ok());
        assert_eq!(stream.written(), "{\"servo\":1}\n");
        assert_eq!(stream.get(|w| w.flushes), 1);
    }

    #[tokio::test]
    async fn test_blocking_error_releases_link() {
        let stream = MemoryStream::new();
        stream.set(|w| w.open = false);
        let link = shared(stream);

        let result = blocking(lock(&link).await, |s| s.write_all(b"x")).await;

        assert!(matches!(result, Err(StreamError::NotOpen)));
        assert!(link.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let result = tokio::task::spawn_blocking(|| SerialStream::open("/nonexistent/ttyRIG0", 9600))
            .await
            .unwrap();

        assert!(result.is_err());
    }
}
