//! ==============================================================================
//! uploader.rs - periodic sensor snapshots to the remote store
//! ==============================================================================
//!
//! purpose:
//!     once per upload interval, copy the latest ph/tds/turbidity out of the
//!     status store and append it under the sensor path, keyed by local time:
//!
//! ```text
//!         /tetracycle_sensor_data/20260314093015 = {ph, tds, turbidity}
//! ```
//!
//! ```text
//!     keys have one-second resolution. records are never overwritten: a tick
//!     that lands in the same second as the last stored record is skipped.
//! ```
//!
//! ==============================================================================

use crate::remote::{child, RemoteStore};
use crate::shutdown::Shutdown;
use crate::status::{DeviceStatus, StatusStore};
use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// `YYYYMMDDHHMMSS`, local time
pub fn record_key() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

pub struct Uploader {
    remote: Arc<dyn RemoteStore>,
    status: StatusStore,
    sensor_path: String,
    interval: Duration,
    show_sensor_data: bool,
    last_key: Option<String>,
}

impl Uploader {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        status: StatusStore,
        sensor_path: impl Into<String>,
        interval: Duration,
        show_sensor_data: bool,
    ) -> Self {
        Self {
            remote,
            status,
            sensor_path: sensor_path.into(),
            interval,
            show_sensor_data,
            last_key: None,
        }
    }

    /// write one snapshot; returns the key it was stored under, or `None`
    /// when a record for this second already exists
    pub async fn upload_once(&mut self) -> Result<Option<String>> {
        self.upload_at(record_key()).await
    }

    async fn upload_at(&mut self, key: String) -> Result<Option<String>> {
        if self.last_key.as_deref() == Some(key.as_str()) {
            tracing::debug!("record {} already uploaded, skipping", key);
            return Ok(None);
        }

        let status = self.status.snapshot().await;
        let record = status.sensor_record();
        let document = serde_json::to_value(record).context("failed to encode sensor record")?;

        self.remote
            .set(&child(&self.sensor_path, &key), &document)
            .await
            .context("error uploading to firebase")?;

        if self.show_sensor_data {
            log_record(&key, &status);
        }
        self.last_key = Some(key.clone());
        Ok(Some(key))
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        tracing::info!("sensor upload started (every {}s)", self.interval.as_secs_f32());

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.triggered() => break,
            }
            if let Err(e) = self.upload_once().await {
                tracing::warn!("{:#}", e);
            }
        }
        tracing::info!("sensor upload stopped");
    }
}

fn log_record(key: &str, status: &DeviceStatus) {
    tracing::info!(
        "uploaded {}: ph={:.2} tds={:.1} turbidity={:.2} | pump1={} pump2={} servo={} system={}",
        key,
        status.ph,
        status.tds,
        status.turbidity,
        u8::from(status.pump_state[0]),
        u8::from(status.pump_state[1]),
        u8::from(status.servo_state),
        u8::from(status.system_enabled)
    );
}
