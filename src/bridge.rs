//! ==============================================================================
//! bridge.rs - wires the three loops together
//! ==============================================================================
//!
//! purpose:
//!     owns one device link, one status store and one remote store handle,
//!     and runs the loops that share them:
//!
//! ```text
//!     ┌────────────────────────────────────────────────────────────┐
//!     │                          bridge                            │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//!     │  │ device reader│  │  reconciler  │  │     uploader     │  │
//!     │  │ (50ms tick)  │  │ (2s poll)    │  │  (1s interval)   │  │
//!     │  └──────┬───────┘  └──┬────────┬──┘  └────────┬─────────┘  │
//!     │         │ telemetry   │ cmds   │ intent       │ snapshots  │
//!     │         ▼             ▼        ▼              ▼            │
//!     │    status store <- device link    remote store (firebase)  │
//!     └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```text
//!     the reader runs on the calling task; the other two are spawned.
//!     everything stops on the shared shutdown flag, then the link is closed.
//! ```
//!
//! ==============================================================================

use crate::channel::CommandChannel;
use crate::config::BridgeConfig;
use crate::link::LinkHealth;
use crate::reader::{DeviceReader, ResetTiming};
use crate::reconciler::Reconciler;
use crate::remote::RemoteStore;
use crate::shutdown::Shutdown;
use crate::status::StatusStore;
use crate::stream::DeviceLink;
use crate::uploader::Uploader;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Bridge {
    link: DeviceLink,
    status: StatusStore,
    reader: DeviceReader,
    reconciler: Reconciler,
    uploader: Uploader,
    read_tick: Duration,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, remote: Arc<dyn RemoteStore>, link: DeviceLink) -> Self {
        let status = StatusStore::new();

        let health = LinkHealth::new(
            config.link.error_threshold,
            Duration::from_secs(config.link.reset_cooldown_seconds),
            Instant::now(),
        );
        let reader = DeviceReader::new(
            link.clone(),
            status.clone(),
            health,
            ResetTiming {
                settle: Duration::from_millis(config.serial.settle_ms),
                ..ResetTiming::default()
            },
            config.serial.reconnect,
        );

        let channel = CommandChannel::new(link.clone(), status.clone(), config.ack_timing());
        let reconciler = Reconciler::new(
            remote.clone(),
            channel,
            status.clone(),
            config.firebase.control_path.clone(),
            config.reconcile_timing(),
        );

        let uploader = Uploader::new(
            remote,
            status.clone(),
            config.firebase.sensor_path.clone(),
            Duration::from_secs(config.polling.upload_interval_seconds),
            config.logging.show_sensor_data,
        );

        Self {
            link,
            status,
            reader,
            reconciler,
            uploader,
            read_tick: Duration::from_millis(config.polling.read_tick_ms),
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> StatusStore {
        self.status.clone()
    }

    /// run until `shutdown` is triggered or the device link is lost
    pub async fn run(self, shutdown: Shutdown) -> anyhow::Result<()> {
        let reconciler = tokio::spawn(self.reconciler.run(shutdown.clone()));
        let uploader = tokio::spawn(self.uploader.run(shutdown.clone()));

        let result = self.reader.run(self.read_tick, shutdown.clone()).await;
        shutdown.trigger();

        for (name, task) in [("control polling", reconciler), ("sensor upload", uploader)] {
            if let Err(e) = task.await {
                tracing::error!("{} task ended abnormally: {}", name, e);
            }
        }

        self.link.lock().await.close();
        tracing::info!("serial connection closed");
        result
    }
}
