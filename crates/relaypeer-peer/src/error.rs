use std::time::Duration;

/// Errors that can occur in peer session operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Relay link error.
    #[error("transport error: {0}")]
    Transport(#[from] relaypeer_transport::TransportError),

    /// Malformed relay payload or reply.
    #[error("wire error: {0}")]
    Wire(#[from] relaypeer_wire::WireError),

    /// The peer id names this session.
    #[error("a session cannot target its own client id")]
    SelfTarget,

    /// The peer id is empty or too long.
    #[error("invalid peer id")]
    InvalidTarget,

    /// Exclusive session is not idle.
    #[error("exclusive session is already bound or binding")]
    AlreadyBound,

    /// The peer did not accept the request.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// Event name is empty.
    #[error("event name must not be empty")]
    InvalidEvent,

    /// The peer declined a stream-open request.
    #[error("stream rejected: {0}")]
    StreamRejected(String),

    /// Exclusive session has no bound target.
    #[error("exclusive session is not bound to a target")]
    NotBound,

    /// The stream was already closed.
    #[error("stream is closed")]
    StreamClosed,

    /// Local I/O failure, such as spawning a stream pump.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiver dropped the acknowledgement without answering.
    #[error("request was dropped without a reply")]
    NoReply,

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, PeerError>;
