//! ==============================================================================
//! status.rs - last confirmed device state
//! ==============================================================================
//!
//! purpose:
//!     holds what the rig last *reported*: sensor readings plus the actuator
//!     states it confirmed. values we merely sent are never written here.
//!
//! concurrency:
//!     one `StatusStore` is created at startup and cloned into every task.
//!     every frame is merged inside a single lock acquisition, so readers
//!     never see half of a frame applied.
//!
//! relationships:
//!     - written by: reader.rs (telemetry), channel.rs (command acks)
//!     - read by: uploader.rs, reconciler.rs
//!
//! ==============================================================================

use crate::command::{coerce, Actuator};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// snapshot of the rig as last reported by the microcontroller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub ph: f64,
    pub turbidity: f64,
    pub tds: f64,
    /// pump 1 and pump 2
    pub pump_state: [bool; 2],
    pub servo_state: bool,
    pub system_enabled: bool,
}

impl DeviceStatus {
    /// merge one parsed frame; fields absent from the frame are left alone
    ///
    /// a `pumps` array is applied before `pump1`/`pump2`, so the individual
    /// keys win when both appear in the same frame.
    pub fn apply(&mut self, frame: &Frame) {
        if let Some(ph) = frame.ph {
            self.ph = ph;
        }
        if let Some(turbidity) = frame.turbidity {
            self.turbidity = turbidity;
        }
        if let Some(tds) = frame.tds {
            self.tds = tds;
        }
        if let Some(pumps) = frame.pumps {
            for (slot, value) in self.pump_state.iter_mut().zip(pumps) {
                if let Some(on) = value {
                    *slot = on;
                }
            }
        }
        if let Some(on) = frame.pump1 {
            self.pump_state[0] = on;
        }
        if let Some(on) = frame.pump2 {
            self.pump_state[1] = on;
        }
        if let Some(on) = frame.servo {
            self.servo_state = on;
        }
        if let Some(on) = frame.system {
            self.system_enabled = on;
        }
    }

    pub fn actuator(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Pump1 => self.pump_state[0],
            Actuator::Pump2 => self.pump_state[1],
            Actuator::Servo => self.servo_state,
            Actuator::System => self.system_enabled,
        }
    }

    /// actuator fields as they appear in the remote control document
    pub fn actuator_document(&self) -> Map<String, Value> {
        Actuator::ALL
            .into_iter()
            .map(|a| (a.key().to_string(), Value::from(u8::from(self.actuator(a)))))
            .collect()
    }

    pub fn sensor_record(&self) -> SensorRecord {
        SensorRecord {
            ph: self.ph,
            tds: self.tds,
            turbidity: self.turbidity,
        }
    }
}

/// the sensor half of the status, as uploaded to the time-series path
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorRecord {
    pub ph: f64,
    pub tds: f64,
    pub turbidity: f64,
}

/// one decoded device message with its recognized fields
///
/// every field is optional; a frame carrying only `ph` is complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub ph: Option<f64>,
    pub turbidity: Option<f64>,
    pub tds: Option<f64>,
    pub pumps: Option<[Option<bool>; 2]>,
    pub pump1: Option<bool>,
    pub pump2: Option<bool>,
    pub servo: Option<bool>,
    pub system: Option<bool>,
}

impl Frame {
    /// pick recognized keys out of a json object
    ///
    /// unknown keys are ignored. sensor values that are not numbers are
    /// skipped rather than failing the whole frame.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let number = |key: &str| object.get(key).and_then(as_number);
        let switch = |key: &str| object.get(key).map(|v| coerce(v) == 1);

        let pumps = object.get("pumps").and_then(Value::as_array).map(|items| {
            let mut slots = [None; 2];
            for (slot, item) in slots.iter_mut().zip(items) {
                *slot = Some(coerce(item) == 1);
            }
            slots
        });

        Self {
            ph: number("ph"),
            turbidity: number("turbidity"),
            tds: number("tds"),
            pumps,
            pump1: switch("pump1"),
            pump2: switch("pump2"),
            servo: switch("servo"),
            system: switch("system"),
        }
    }

    /// parse raw `{...}` bytes; non-object json is an error
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let object: Map<String, Value> = serde_json::from_slice(bytes)?;
        Ok(Self::from_object(&object))
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// shared, lock-guarded handle to the one `DeviceStatus`
#[derive(Clone, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<DeviceStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, frame: &Frame) {
        self.inner.lock().await.apply(frame);
    }

    pub async fn apply_all(&self, frames: &[Frame]) {
        if frames.is_empty() {
            return;
        }
        let mut status = self.inner.lock().await;
        for frame in frames {
            status.apply(frame);
        }
    }

    pub async fn snapshot(&self) -> DeviceStatus {
        self.inner.lock().await.clone()
    }
}
