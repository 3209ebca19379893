//! ==============================================================================
//! rigbridge - serial water rig <-> firebase realtime database
//! ==============================================================================
//!
//! modules, leaf first:
//!     - command.rs:    actuator keys, value coercion, control commands
//!     - status.rs:     device frames and the last confirmed device state
//!     - decoder.rs:    brace-matched frame extraction from raw bytes
//!     - stream.rs:     byte stream trait + serial implementation
//!     - link.rs:       failure counting and reset cooldown
//!     - shutdown.rs:   process-wide stop flag
//!     - remote.rs:     document store trait + firebase REST client
//!     - channel.rs:    command write + ack wait
//!     - reader.rs:     telemetry loop
//!     - reconciler.rs: control document -> device, device -> control document
//!     - uploader.rs:   sensor snapshots -> time-series path
//!     - config.rs:     bridge.toml
//!     - bridge.rs:     runs the loops together
//!
//! ==============================================================================

pub mod bridge;
pub mod channel;
pub mod command;
pub mod config;
pub mod decoder;
pub mod link;
pub mod reader;
pub mod reconciler;
pub mod remote;
pub mod shutdown;
pub mod status;
pub mod stream;
pub mod uploader;
