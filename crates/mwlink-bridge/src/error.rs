/// Errors that can occur while starting the link bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Transport-level error (serial open, TCP setup).
    #[error("transport error: {0}")]
    Transport(#[from] mwlink_transport::TransportError),

    /// An I/O error occurred while wiring up the bridge.
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
