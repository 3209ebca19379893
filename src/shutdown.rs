//! Process-wide shutdown flag.
//!
//! Setting it never logs or does I/O, so it is safe to call from a signal
//! task; every loop checks it at the top of an iteration and races it against
//! its sleeps.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// resolves once the flag is set
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // the sender lives in `self`, so wait_for cannot see a closed channel
        let _ = rx.wait_for(|&stop| stop).await;
    }

    /// sleep for `duration` unless shutdown comes first
    ///
    /// returns `false` when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
