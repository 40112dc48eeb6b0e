/// Errors that can occur on the remote stream protocol.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// An I/O error on the socket.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame header does not start with the protocol magic.
    #[error("invalid frame magic")]
    InvalidMagic,

    /// A frame larger than the protocol allows.
    #[error("frame payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// A session control message that did not parse.
    #[error("session message error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer broke the session protocol.
    #[error("session protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;
