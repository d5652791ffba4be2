//! Error types for the memring client.

use std::io;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Empty key, forbidden bytes, or a key that stays over the wire limit
    /// even after digesting.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encoded value exceeds `value_max_bytes`.
    #[error("value too large: {0} bytes")]
    ValueTooLarge(usize),

    /// A fetched value failed to decompress or deserialize.
    #[error("failed to decode cached value: {0}")]
    Unmarshal(String),

    /// Connect, read, or write failure, timeout, or authentication failure.
    /// Triggers exactly one retry through the ring at the chokepoint.
    #[error("network error on {server}: {message}")]
    Network { server: String, message: String },

    /// No live server owns the key (or the ring is empty).
    #[error("no server available: {0}")]
    Ring(String),

    /// Malformed or unexpected response from a server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bad caller input, e.g. a server list entry that does not parse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn network(server: &str, message: impl Into<String>) -> Self {
        Error::Network {
            server: server.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn network_io(server: &str, err: &io::Error) -> Self {
        Self::network(server, err.to_string())
    }

    /// True for failures the chokepoint is allowed to retry once.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

impl From<memring_wire::ParseError> for Error {
    fn from(err: memring_wire::ParseError) -> Self {
        Error::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_retriable() {
        assert!(Error::network("host:11211", "timed out").is_network());
        assert!(!Error::Ring("all servers down".into()).is_network());
        assert!(!Error::InvalidKey("empty".into()).is_network());
    }

    #[test]
    fn display_includes_server() {
        let err = Error::network("cache-1:11211", "connection refused");
        assert_eq!(
            err.to_string(),
            "network error on cache-1:11211: connection refused"
        );
    }

    #[test]
    fn parse_error_maps_to_protocol() {
        let err: Error = memring_wire::ParseError::InvalidMagic(0x12).into();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
