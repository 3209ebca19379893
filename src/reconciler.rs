//! ==============================================================================
//! reconciler.rs - remote actuator intent -> device, confirmed state -> remote
//! ==============================================================================
//!
//! purpose:
//!     polls the control document, works out which actuator values changed
//!     since they were last forwarded, and sends only those to the device.
//!     every few seconds it also writes the device-confirmed actuator state
//!     back so dashboards show what the rig actually did.
//!
//! cycle:
//!
//! ```text
//!     get control doc -> coerce + diff vs last_forwarded -> send delta
//!          -> write back last_updated (+ sent values) -> [mirror if due]
//!          -> sleep poll_interval   (error_backoff after a failed cycle)
//! ```
//!
//! last_forwarded starts unset for every actuator, so the first cycle
//! forwards every key present in the document, zeros included.
//!
//! polling is deliberate: the store's streaming endpoint is not used.
//!
//! ==============================================================================

use crate::channel::CommandChannel;
use crate::command::{Actuator, ControlCommand};
use crate::remote::{now_string, RemoteStore};
use crate::shutdown::Shutdown;
use crate::status::StatusStore;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct ReconcileTiming {
    pub poll_interval: Duration,
    /// `None` disables mirroring
    pub mirror_interval: Option<Duration>,
    pub error_backoff: Duration,
}

impl Default for ReconcileTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            mirror_interval: Some(Duration::from_secs(5)),
            error_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Reconciler {
    remote: Arc<dyn RemoteStore>,
    channel: CommandChannel,
    status: StatusStore,
    control_path: String,
    timing: ReconcileTiming,
    /// `None` is the unset sentinel
    last_forwarded: [Option<u8>; 4],
    last_mirror: Instant,
}

impl Reconciler {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        channel: CommandChannel,
        status: StatusStore,
        control_path: impl Into<String>,
        timing: ReconcileTiming,
    ) -> Self {
        Self {
            remote,
            channel,
            status,
            control_path: control_path.into(),
            timing,
            last_forwarded: [None; 4],
            last_mirror: Instant::now(),
        }
    }

    /// keys of `document` whose coerced value differs from what was last
    /// forwarded; the cache is updated as a side effect
    pub fn diff(&mut self, document: &Map<String, Value>) -> ControlCommand {
        let intent = ControlCommand::from_map(document);
        let mut command = ControlCommand::new();
        for (actuator, value) in intent.iter() {
            let slot = &mut self.last_forwarded[actuator.index()];
            if *slot != Some(value) {
                *slot = Some(value);
                command.set(actuator, value);
                tracing::debug!("value changed: {}={}", actuator, value);
            }
        }
        command
    }

    #[cfg(test)]
    pub fn last_forwarded(&self, actuator: Actuator) -> Option<u8> {
        self.last_forwarded[actuator.index()]
    }

    /// one poll: fetch, diff, forward, confirm
    ///
    /// returns the command that was forwarded, if any.
    pub async fn sync_once(&mut self) -> Result<Option<ControlCommand>> {
        let document = self
            .remote
            .get(&self.control_path)
            .await
            .context("failed to read control document")?;

        let Some(Value::Object(document)) = document else {
            return Ok(None);
        };

        let command = self.diff(&document);
        if command.is_empty() {
            return Ok(None);
        }
        tracing::info!("control change detected: {}", command);

        if let Err(e) = self.channel.send(&command).await {
            // forget what we claimed to forward so the next poll tries again
            for (actuator, _) in command.iter() {
                self.last_forwarded[actuator.index()] = None;
            }
            return Err(e).context("failed to forward command to device");
        }

        self.log_confirmation(&command).await;

        let mut updates = command.to_json();
        updates.insert("last_updated".into(), Value::from(now_string()));
        self.remote
            .update(&self.control_path, &updates)
            .await
            .context("failed to confirm command in control document")?;

        Ok(Some(command))
    }

    /// write the device-confirmed actuator state into the control document
    pub async fn mirror_confirmed_state(&mut self) -> Result<()> {
        let status = self.status.snapshot().await;
        let mut updates = status.actuator_document();
        updates.insert("last_updated".into(), Value::from(now_string()));

        self.remote
            .update(&self.control_path, &updates)
            .await
            .context("error syncing control values")?;
        let synced = Value::Object(updates);
        tracing::info!("synced control values to firebase: {}", synced);
        Ok(())
    }

    async fn cycle(&mut self) -> Result<()> {
        self.sync_once().await?;

        if let Some(interval) = self.timing.mirror_interval {
            if self.last_mirror.elapsed() >= interval {
                self.last_mirror = Instant::now();
                self.mirror_confirmed_state().await?;
            }
        }
        Ok(())
    }

    pub async fn run(mut self, shutdown: Shutdown) {
        tracing::info!(
            "firebase control polling started (checking for changes every {}s)",
            self.timing.poll_interval.as_secs_f32()
        );

        while !shutdown.is_triggered() {
            let wait = match self.cycle().await {
                Ok(()) => self.timing.poll_interval,
                Err(e) => {
                    tracing::warn!("error in control polling: {:#}", e);
                    self.timing.error_backoff
                }
            };
            if !shutdown.sleep(wait).await {
                break;
            }
        }
        tracing::info!("control polling stopped");
    }

    async fn log_confirmation(&self, command: &ControlCommand) {
        let status = self.status.snapshot().await;
        let report: Vec<String> = command
            .iter()
            .map(|(actuator, sent)| {
                format!("{}: sent={}, current={}", actuator, sent, u8::from(status.actuator(actuator)))
            })
            .collect();
        tracing::info!("status after command: {}", report.join(", "));
    }
}

/// create the control document, or fill in keys it is missing
///
/// existing actuator values are never overwritten; `last_updated` is
/// always refreshed.
pub async fn ensure_control_document(remote: &dyn RemoteStore, path: &str) -> Result<()> {
    let existing = remote
        .get(path)
        .await
        .context("failed to read control document")?;

    match existing {
        Some(Value::Object(document)) if !document.is_empty() => {
            let mut updates: Map<String, Value> = Actuator::ALL
                .into_iter()
                .filter(|a| !document.contains_key(a.key()))
                .map(|a| (a.key().to_string(), Value::from(0)))
                .collect();
            if !updates.is_empty() {
                let filled = Value::Object(updates.clone());
                tracing::info!("updated missing control values in firebase: {}", filled);
            }
            updates.insert("last_updated".into(), Value::from(now_string()));
            remote
                .update(path, &updates)
                .await
                .context("failed to update control document")?;
        }
        _ => {
            let mut defaults: Map<String, Value> = Actuator::ALL
                .into_iter()
                .map(|a| (a.key().to_string(), Value::from(0)))
                .collect();
            defaults.insert("last_updated".into(), Value::from(now_string()));
            remote
                .set(path, &Value::Object(defaults))
                .await
                .context("failed to initialize control document")?;
            tracing::info!("initialized control values in firebase");
        }
    }
    Ok(())
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::AckTiming;
    use crate::remote::memory::MemoryStore;
    use crate::stream::memory::MemoryStream;
    use crate::stream::shared;
    use serde_json::json;

    const CONTROL: &str = "/tetracycle_control";

    struct Rig {
        remote: Arc<MemoryStore>,
        stream: MemoryStream,
        status: StatusStore,
        reconciler: Reconciler,
    }

    fn rig(document: Value) -> Rig {
        rig_with(
            document,
            ReconcileTiming {
                poll_interval: Duration::from_millis(10),
                mirror_interval: Some(Duration::from_secs(3600)),
                error_backoff: Duration::from_millis(10),
            },
        )
    }

    fn rig_with(document: Value, reconcile: ReconcileTiming) -> Rig {
        let remote = Arc::new(MemoryStore::with(CONTROL, document));
        let stream = MemoryStream::new();
        let status = StatusStore::new();
        let timing = AckTiming {
            timeout: Duration::from_millis(30),
            settle: Duration::ZERO,
            poll: Duration::from_millis(5),
        };
        let channel = CommandChannel::new(shared(stream.clone()), status.clone(), timing);
        let reconciler = Reconciler::new(remote.clone(), channel, status.clone(), CONTROL, reconcile);
        Rig { remote, stream, status, reconciler }
    }

    fn control_reads(remote: &MemoryStore) -> usize {
        remote.calls().iter().filter(|c| *c == "get /tetracycle_control").count()
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_delta_only() {
        let mut r = rig(json!(null)).reconciler;
        r.diff(&object(json!({"pump1": 0, "pump2": 0, "servo": 0, "system": 0})));

        let command = r.diff(&object(json!({"pump1": 1, "pump2": 0, "servo": 0, "system": 0})));

        assert_eq!(command.len(), 1);
        assert_eq!(command.get(Actuator::Pump1), Some(1));
    }

    #[test]
    fn test_diff_coerces_before_comparing() {
        let mut r = rig(json!(null)).reconciler;
        r.diff(&object(json!({"servo": 1})));
        assert!(r.diff(&object(json!({"servo": true}))).is_empty());
        assert!(r.diff(&object(json!({"servo": "1"}))).is_empty());
        assert_eq!(r.diff(&object(json!({"servo": null}))).get(Actuator::Servo), Some(0));
    }

    #[tokio::test]
    async fn test_unset_forwards_first_zero_once() {
        let mut rig = rig(json!({"pump1": 0}));

        let sent = rig.reconciler.sync_once().await.unwrap();
        assert_eq!(sent.and_then(|c| c.get(Actuator::Pump1)), Some(0));
        assert_eq!(rig.stream.written(), "{\"pump1\":0}\n");

        assert!(rig.reconciler.sync_once().await.unwrap().is_none());
        assert_eq!(rig.stream.written(), "{\"pump1\":0}\n");
    }

    #[tokio::test]
    async fn test_startup_forwards_all_present_keys() {
        let mut rig = rig(json!({"pump1": 1, "pump2": 0, "servo": 0, "system": 1, "last_updated": "x"}));
        rig.stream.reply_with(br#"{"pump1":1,"pump2":0,"servo":0,"system":1}"#);

        rig.reconciler.sync_once().await.unwrap();

        assert_eq!(rig.stream.written(), "{\"pump1\":1,\"pump2\":0,\"servo\":0,\"system\":1}\n");
        let status = rig.status.snapshot().await;
        assert_eq!(status.pump_state, [true, false]);
        assert!(status.system_enabled);
        assert_ne!(rig.remote.read("/tetracycle_control/last_updated"), json!("x"));
    }

    #[tokio::test]
    async fn test_change_is_forwarded_and_confirmed() {
        let mut rig = rig(json!({"pump1": 0, "pump2": 0, "servo": 0, "system": 0}));
        rig.reconciler.sync_once().await.unwrap();

        rig.remote.put("/tetracycle_control/servo", json!(1));
        let sent = rig.reconciler.sync_once().await.unwrap().unwrap();

        assert_eq!(sent.len(), 1);
        assert!(rig.stream.written().ends_with("{\"servo\":1}\n"));
        assert_eq!(rig.remote.read("/tetracycle_control/servo"), json!(1));
        assert!(rig.remote.read("/tetracycle_control/last_updated").is_string());
    }

    #[tokio::test]
    async fn test_failed_send_is_retried() {
        let mut rig = rig(json!({"pump2": 1}));
        rig.stream.set(|w| w.open = false);

        assert!(rig.reconciler.sync_once().await.is_err());
        assert_eq!(rig.reconciler.last_forwarded(Actuator::Pump2), None);

        rig.stream.set(|w| w.open = true);
        let sent = rig.reconciler.sync_once().await.unwrap();
        assert_eq!(sent.and_then(|c| c.get(Actuator::Pump2)), Some(1));
    }

    #[tokio::test]
    async fn test_missing_document_is_quiet() {
        let mut rig = rig(json!(null));
        assert!(rig.reconciler.sync_once().await.unwrap().is_none());
        assert_eq!(rig.stream.written(), "");
    }

    #[tokio::test]
    async fn test_mirror_writes_confirmed_state() {
        let mut rig = rig(json!({"pump1": 1, "pump2": 1, "servo": 1, "system": 1}));
        rig.status
            .apply(&crate::status::Frame { pump1: Some(true), system: Some(true), ..Default::default() })
            .await;

        rig.reconciler.mirror_confirmed_state().await.unwrap();

        let doc = rig.remote.read(CONTROL);
        assert_eq!(doc["pump1"], 1);
        assert_eq!(doc["pump2"], 0);
        assert_eq!(doc["servo"], 0);
        assert_eq!(doc["system"], 1);
    }

    #[tokio::test]
    async fn test_run_survives_remote_errors_and_stops() {
        let rig = rig(json!({"pump1": 1}));
        rig.remote.set_failing(true);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(rig.reconciler.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert!(rig.remote.calls().len() >= 2);
        assert_eq!(rig.stream.written(), "");
    }

    #[tokio::test]
    async fn test_failed_cycle_waits_for_backoff() {
        let rig = rig_with(
            json!({"pump1": 1}),
            ReconcileTiming {
                poll_interval: Duration::from_millis(5),
                mirror_interval: None,
                error_backoff: Duration::from_millis(200),
            },
        );
        rig.remote.set_failing(true);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(rig.reconciler.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        // one attempt, then the backoff; the 5ms poll interval is not used
        assert_eq!(control_reads(&rig.remote), 1);
    }

    #[tokio::test]
    async fn test_healthy_cycle_uses_poll_interval() {
        let rig = rig_with(
            json!(null),
            ReconcileTiming {
                poll_interval: Duration::from_millis(5),
                mirror_interval: None,
                error_backoff: Duration::from_millis(200),
            },
        );
        let shutdown = Shutdown::new();

        let task = tokio::spawn(rig.reconciler.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert!(control_reads(&rig.remote) >= 3);
    }

    #[tokio::test]
    async fn test_cycle_mirrors_once_per_interval() {
        let mut rig = rig_with(
            json!({"pump1": 0, "pump2": 0, "servo": 0, "system": 0}),
            ReconcileTiming {
                poll_interval: Duration::from_millis(5),
                mirror_interval: Some(Duration::from_millis(200)),
                error_backoff: Duration::from_millis(5),
            },
        );
        rig.reconciler.sync_once().await.unwrap();
        // the device reports pump2 running on its own
        rig.status
            .apply(&crate::status::Frame { pump2: Some(true), ..Default::default() })
            .await;

        // not due yet
        rig.reconciler.cycle().await.unwrap();
        assert_eq!(rig.remote.read("/tetracycle_control/pump2"), json!(0));

        tokio::time::sleep(Duration::from_millis(210)).await;
        rig.reconciler.cycle().await.unwrap();
        assert_eq!(rig.remote.read("/tetracycle_control/pump2"), json!(1));

        // the mirror clock restarted, so an immediate cycle only polls
        let updates_before = rig.remote.calls().iter().filter(|c| c.starts_with("update")).count();
        rig.reconciler.cycle().await.unwrap();
        let updates_after = rig.remote.calls().iter().filter(|c| c.starts_with("update")).count();
        // the poll forwards pump2=1 and confirms it; no extra mirror write
        assert_eq!(updates_after, updates_before + 1);
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_document() {
        let remote = MemoryStore::new();
        ensure_control_document(&remote, CONTROL).await.unwrap();

        let doc = remote.read(CONTROL);
        for key in ["pump1", "pump2", "servo", "system"] {
            assert_eq!(doc[key], 0);
        }
        assert!(doc["last_updated"].is_string());
    }

    #[tokio::test]
    async fn test_ensure_fills_gaps_without_overwriting() {
        let remote = MemoryStore::with(CONTROL, json!({"pump1": 1, "servo": 1}));
        ensure_control_document(&remote, CONTROL).await.unwrap();

        let doc = remote.read(CONTROL);
        assert_eq!(doc["pump1"], 1);
        assert_eq!(doc["servo"], 1);
        assert_eq!(doc["pump2"], 0);
        assert_eq!(doc["system"], 0);
        assert!(doc["last_updated"].is_string());
    }
}
