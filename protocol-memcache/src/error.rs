//! Error types for Memcache command building and response parsing.

/// A response line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Invalid protocol format.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Invalid number format.
    #[error("invalid number")]
    InvalidNumber,

    /// Payload framing is broken. Nothing after this point in the stream can
    /// be matched to a command.
    #[error("stream out of frame: {0}")]
    OutOfFrame(&'static str),
}

/// A command was rejected before anything was written to a server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("key is empty")]
    EmptyKey,

    #[error("key {key:?} contains whitespace or control characters")]
    InvalidKey { key: String },

    #[error("key is {len} bytes, maximum is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("value is {len} bytes, maximum is {max}")]
    ValueTooLarge { len: usize, max: usize },

    #[error("expiration {exptime}s exceeds maximum of {max}s")]
    ExpirationTooLarge { exptime: u32, max: u32 },

    #[error("no keys given")]
    NoKeys,
}

/// A server reply that resolves its command with a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    /// `ERROR`: the server did not understand the command.
    #[error("server replied ERROR")]
    Error,

    /// `CLIENT_ERROR <msg>`
    #[error("CLIENT_ERROR {0}")]
    ClientError(String),

    /// `SERVER_ERROR <msg>`
    #[error("SERVER_ERROR {0}")]
    ServerError(String),

    /// A line that matches no known response keyword.
    #[error("unknown server response: {0}")]
    Unknown(String),

    /// A known keyword with a malformed body.
    #[error("malformed response: {0}")]
    Malformed(#[from] ParseError),

    /// A well-formed reply of the wrong shape for the command that was issued.
    #[error("unexpected response to {0}")]
    Unexpected(&'static str),
}

impl ReplyError {
    /// `SERVER_ERROR` counts against the server's health; other replies do not.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ReplyError::ServerError(_))
    }

    /// The connection that produced this reply can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplyError::Malformed(ParseError::OutOfFrame(_)))
    }
}
