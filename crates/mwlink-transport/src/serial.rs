use std::time::Duration;

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Serial port parameters.
///
/// 8N1 framing; the read timeout bounds how long a reader blocks before
/// it gets a chance to observe shutdown.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Open a serial port for the device link.
pub fn open_serial(port: &str, config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
    let handle = serialport::new(port, config.baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .timeout(config.read_timeout)
        .open()
        .map_err(|source| TransportError::SerialOpen {
            port: port.to_string(),
            source,
        })?;
    debug!(port, baud = config.baud_rate, "serial port open");
    Ok(handle)
}
