//! Error types for decoding Keyline records.

/// Errors that can occur while decoding wire records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The encoded record was empty.
    #[error("empty encoding")]
    Empty,

    /// The leading format byte is not one this build understands.
    #[error("unsupported entry format version {0}")]
    UnsupportedVersion(u8),

    /// The body could not be parsed.
    #[error("malformed encoding: {0}")]
    Malformed(String),

    /// The body parsed but bytes were left over.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// An identity key had the wrong length.
    #[error("identity key must be {expected} bytes, got {actual}")]
    KeyLength {
        /// Required key length.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },
}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
