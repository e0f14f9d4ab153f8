//! Error types for the multiplexing stream.

/// Errors produced by the multiplexing stream and its channels.
///
/// The enum is `Clone` so a single fatal transport error can fan out to
/// every live channel's acceptance and completion signals; I/O errors are
/// stringified for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    #[error("handshake failed: remote peer did not send the protocol magic")]
    ProtocolMismatch,

    #[error("handshake collision: both peers sent identical random bytes")]
    HandshakeCollision,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("remote accepted unknown channel {0}")]
    UnexpectedChannel(u32),

    #[error("channel name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("no channel with id {0}")]
    UnknownChannel(u32),

    #[error("channel {0} is already accepted")]
    AlreadyAccepted(u32),

    #[error("channel {0} is no longer available")]
    NoLongerAvailable(u32),

    #[error("channel {0} was not offered by the remote peer")]
    NotAcceptable(u32),

    #[error("offer was rejected by the remote peer")]
    OfferRejected,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("multiplexing stream is disposed")]
    AlreadyDisposed,

    #[error("multiplexing stream closed: {0}")]
    StreamClosed(String),

    #[error("channel is closed for writing")]
    ChannelClosed,

    #[error("channel id space exhausted")]
    IdExhausted,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        MuxError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
