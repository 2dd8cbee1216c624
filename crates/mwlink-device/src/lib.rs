//! Typed MultiWii message catalog and the device facade built on it.
//!
//! The catalog maps each command code to a concrete record type with a
//! byte-level decoder (reads, codes 100–120) or payload encoder (writes,
//! codes 200–212). The facade wires the catalog to a session's
//! pending-request table and runs the background polling loop that keeps
//! a telemetry history per device.

pub mod catalog;
pub mod device;

pub use catalog::{
    codes, Altitude, Analog, Attitude, CatalogError, CompGps, GpsUpdate, Ident, Misc, Pid,
    PidTriplet, RawGps, RawImu, RcChannels, RcTuning, ServoConfEntry, Status, Vector3, Waypoint,
};
pub use device::{Device, Snapshot};
