/// Errors that can occur during frame encoding.
///
/// Decoding never errors: corrupt input is recovered by resynchronization
/// inside the decoder and only counted.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the single-byte length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
