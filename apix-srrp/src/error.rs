//! Codec error types.

use thiserror::Error;

/// Errors raised while building or parsing SRRP frames.
///
/// Every parse error means the input is malformed. An incomplete frame is not
/// an error: [`crate::parse`] reports it as `Ok(None)`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SrrpError {
    #[error("invalid frame marker: expected 'SRRP', got {0:02x?}")]
    InvalidMagic(Vec<u8>),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid packet category: {0:#04x}")]
    InvalidCategory(u8),

    #[error("invalid packet flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("anchor too long: {len} bytes (max {max})")]
    AnchorTooLong { len: usize, max: usize },

    #[error("invalid anchor {anchor:?}: {reason}")]
    InvalidAnchor {
        anchor: String,
        reason: &'static str,
        frame_len: Option<usize>,
    },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch {
        expected: u32,
        actual: u32,
        frame_len: usize,
    },

    #[error("fragment does not continue the pending packet: {0}")]
    FragmentMismatch(&'static str),

    #[error("fragment limit must be greater than zero")]
    ZeroFragmentLimit,
}

impl SrrpError {
    /// Returns whether the error describes bytes received off the wire, as
    /// opposed to a bad argument passed to a constructor.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, SrrpError::ZeroFragmentLimit | SrrpError::FragmentMismatch(_))
    }

    /// Length of the offending frame, when its boundary could be determined.
    ///
    /// `None` means the header itself was unusable and the caller has to scan
    /// for the next frame marker instead.
    pub fn frame_len(&self) -> Option<usize> {
        match self {
            SrrpError::CrcMismatch { frame_len, .. } => Some(*frame_len),
            SrrpError::InvalidAnchor { frame_len, .. } => *frame_len,
            _ => None,
        }
    }
}
