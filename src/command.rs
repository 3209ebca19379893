//! ==============================================================================
//! command.rs - actuator keys, value coercion and control commands
//! ==============================================================================
//!
//! purpose:
//!     the device understands four actuator keys (pump1, pump2, servo, system)
//!     and only ever the integers 0 or 1 for them. everything arriving from the
//!     remote store or a device frame goes through `coerce` before it is used.
//!
//! relationships:
//!     - used by: status.rs (frame merge), channel.rs (wire line),
//!       reconciler.rs (delta detection)
//!
//! ==============================================================================

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// one of the four actuator lines on the rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Actuator {
    Pump1,
    Pump2,
    Servo,
    System,
}

impl Actuator {
    /// wire / document order
    pub const ALL: [Actuator; 4] = [Actuator::Pump1, Actuator::Pump2, Actuator::Servo, Actuator::System];

    pub fn key(self) -> &'static str {
        match self {
            Actuator::Pump1 => "pump1",
            Actuator::Pump2 => "pump2",
            Actuator::Servo => "servo",
            Actuator::System => "system",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// position in fixed-size per-actuator tables
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// map any json value to a strict 0/1
///
/// null, false, zero, empty strings/arrays/objects and the words
/// "false"/"off" are 0; everything else is 1. numeric strings are read as
/// numbers so "0" is 0. the result fed back in yields itself.
pub fn coerce(value: &Value) -> u8 {
    let on = match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(f) => f != 0.0,
                Err(_) => !(s.is_empty() || s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("off")),
            }
        }
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    };
    u8::from(on)
}

/// a set of actuator writes destined for the device
///
/// holds only the keys that should change, never the full rig state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlCommand {
    values: BTreeMap<Actuator, u8>,
}

impl ControlCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// build from an arbitrary json object, keeping recognized keys only
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut command = Self::new();
        for (key, value) in map {
            if let Some(actuator) = Actuator::from_key(key) {
                command.set(actuator, coerce(value));
            }
        }
        command
    }

    /// any nonzero value is stored as 1
    pub fn set(&mut self, actuator: Actuator, value: u8) {
        self.values.insert(actuator, u8::from(value != 0));
    }

    pub fn get(&self, actuator: Actuator) -> Option<u8> {
        self.values.get(&actuator).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Actuator, u8)> + '_ {
        self.values.iter().map(|(a, v)| (*a, *v))
    }

    /// json object form, e.g. `{"pump1":1,"servo":0}`
    pub fn to_json(&self) -> Map<String, Value> {
        self.iter()
            .map(|(a, v)| (a.key().to_string(), Value::from(v)))
            .collect()
    }

    /// single-line json terminated by a newline, as the firmware reads it
    pub fn to_line(&self) -> String {
        let mut line = Value::Object(self.to_json()).to_string();
        line.push('\n');
        line
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.to_json()))
    }
}
