use std::time::Duration;

/// Errors delivered to individual callers of the pending-request table.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// All 256 correlation ids are simultaneously pending on this table.
    #[error("correlation id space exhausted (256 requests pending)")]
    IdSpaceExhausted,

    /// No matching response arrived within the round-trip deadline.
    #[error("request timed out after {timeout:?} (id {id}, code {code})")]
    Timeout { id: u8, code: u8, timeout: Duration },

    /// The transport closed while the request was pending.
    #[error("link closed")]
    LinkClosed,

    /// The request could not be framed.
    #[error("frame error: {0}")]
    Frame(#[from] mwlink_frame::FrameError),

    /// The supplied decoder rejected the response payload.
    #[error("response decode failed for code {code}: {source}")]
    Decode {
        code: u8,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RequestError {
    /// Wrap a decoder failure for `code`.
    pub fn decode(code: u8, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Decode {
            code,
            source: source.into(),
        }
    }
}

/// Errors that can occur in the session manager itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] mwlink_transport::TransportError),

    /// An I/O error occurred on a session stream.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
