//! Error types for the device-management protocol.

use thiserror::Error;

/// Errors raised while encoding, decoding or exchanging protocol messages.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A header or payload does not have the expected shape.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The (request kind, device kind) pair is not served.
    #[error("Unsupported request: kind={kind} device={device}")]
    Unsupported { kind: i32, device: i32 },

    /// Declared payload length exceeds the accepted maximum.
    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),

    /// The daemon answered with a non-zero error code.
    #[error("Request rejected by xendevd with error code {0}")]
    Rejected(i32),
}

impl ProtoError {
    /// OS error code reported to the peer for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            ProtoError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ProtoError::Malformed(_) | ProtoError::Unsupported { .. } => libc::EINVAL,
            ProtoError::TooLarge(_) => libc::EMSGSIZE,
            ProtoError::Rejected(code) => *code,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
