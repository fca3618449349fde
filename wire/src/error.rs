//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
///
/// `Size` and `Malformed` are fatal to the link: once the length prefix is
/// untrustworthy the byte stream cannot be resynchronised. `Kind` and
/// `Truncated` concern a single well-delimited frame, which the receiver
/// drops before continuing.
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame length exceeds the frame limit
    #[error("frame length {0} exceeds limit")]
    Size(usize),

    /// Zero-length frame
    #[error("malformed frame")]
    Malformed,

    /// Unknown frame kind
    #[error("unknown frame kind {0:#04x}")]
    Kind(u8),

    /// Payload too short for the declared kind
    #[error("truncated payload for kind {kind:#04x}: {len} bytes")]
    Truncated {
        /// Frame kind tag
        kind: u8,
        /// Actual payload length
        len: usize,
    },
}

impl WireError {
    /// Whether this error poisons the whole byte stream.
    ///
    /// A non-fatal error drops one frame; a fatal one must close the link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::Size(_) | WireError::Malformed)
    }
}
