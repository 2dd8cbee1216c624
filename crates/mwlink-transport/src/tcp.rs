use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Bind a TCP listening socket.
pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<TcpListener> {
    let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    debug!(%addr, "listening");
    Ok(listener)
}

/// Connect to a remote TCP endpoint.
pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<TcpStream> {
    let stream = TcpStream::connect(&addr).map_err(|source| TransportError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    stream.set_nodelay(true)?;
    debug!(%addr, "connected");
    Ok(stream)
}

/// Dials a remote endpoint until a connection is established.
///
/// Used by the link bridge's network side, which must survive server
/// restarts with no caller-visible interruption beyond in-flight request
/// failures.
#[derive(Debug, Clone)]
pub struct Redial {
    addr: String,
    delay: Duration,
}

impl Redial {
    /// Create a redialer for `addr` with a fixed delay between attempts.
    pub fn new(addr: impl Into<String>, delay: Duration) -> Self {
        Self {
            addr: addr.into(),
            delay,
        }
    }

    /// The endpoint this redialer targets.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Block until a connection succeeds, retrying indefinitely.
    pub fn connect(&self) -> TcpStream {
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match connect(&self.addr) {
                Ok(stream) => {
                    info!(addr = %self.addr, attempt, "connected");
                    return stream;
                }
                Err(err) => {
                    warn!(addr = %self.addr, attempt, error = %err, "connect failed, retrying");
                    thread::sleep(self.delay);
                }
            }
        }
    }
}
