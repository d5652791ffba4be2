//! Parse errors for the binary protocol.

/// Error type for response parsing.
///
/// Short buffers are not errors: [`crate::Response::parse`] signals "need
/// more bytes" with `Ok(None)`. `ParseError` always means the stream is
/// unrecoverable and the connection should be torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The first byte of a frame was not the response magic.
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// The opcode byte does not name a known operation.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// Header length fields are inconsistent with each other.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}
