//! Transport plumbing for mwlink.
//!
//! The network side is plain TCP; the serial side is a `serialport`
//! handle. Both are raw byte streams — framing lives in `mwlink-frame`,
//! reconnection policy in the components that own the connections.

pub mod error;
pub mod serial;
pub mod tcp;

pub use error::{Result, TransportError};
pub use serial::{open_serial, SerialConfig};
pub use tcp::{bind, connect, Redial};
