use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding wire messages.
///
/// These are all protocol-bucket errors (malformed frame); there is no
/// transport or configuration concern in this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer too short: needed at least {needed} bytes, had {available}")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("length-prefixed field exceeds the {limit} byte limit ({actual} bytes)")]
    FieldTooLarge { actual: usize, limit: usize },

    #[error("unknown topic-list compression format: {0:#04x}")]
    UnknownTopicListFormat(u8),

    #[error("topic list is not valid UTF-8 after decompression")]
    InvalidTopicListUtf8,

    #[error("gzip decompression failed: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("topic name contains the reserved separator byte")]
    TopicContainsSeparator,

    #[error("unknown peer role: {0}")]
    UnknownRole(u8),
}

impl Error {
    /// Malformed wire data is always a protocol error: never fatal to the
    /// component, always fatal to the frame (and, per the authentication
    /// and fan-out state machines, usually fatal to the sending peer).
    pub fn is_fatal(&self) -> bool {
        false
    }
}
