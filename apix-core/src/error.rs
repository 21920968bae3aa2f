//! Runtime error types.

use crate::config::ConfigError;
use crate::descriptor::Descriptor;
use apix_srrp::SrrpError;
use thiserror::Error;

/// Errors returned by [`crate::Context`] operations.
#[derive(Debug, Error)]
pub enum ApixError {
    #[error("invalid address {addr:?}: {reason}")]
    AddressInvalid { addr: String, reason: String },

    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(Descriptor),

    #[error("buffer overflow: {len} bytes would exceed the {max} byte limit")]
    BufferOverflow { len: usize, max: usize },

    #[error("operation would block")]
    WouldBlock,

    #[error("descriptor {0} was closed by the peer")]
    Disconnected(Descriptor),

    #[error("context destroyed")]
    ContextDestroyed,

    #[error("unknown transport kind: {0}")]
    UnknownTransport(String),

    #[error("transport kind already enabled: {0}")]
    TransportExists(String),

    #[error("{operation} is not supported on {kind} descriptor {descriptor}")]
    Unsupported {
        descriptor: Descriptor,
        kind: String,
        operation: &'static str,
    },

    #[error("descriptor handles exhausted")]
    HandlesExhausted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SRRP error: {0}")]
    Srrp(#[from] SrrpError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ApixError {
    /// Returns true if the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApixError::WouldBlock | ApixError::BufferOverflow { .. } => true,
            ApixError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns true if the error means the handle no longer refers to a live
    /// descriptor.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ApixError::InvalidDescriptor(_) | ApixError::Disconnected(_)
        )
    }
}
