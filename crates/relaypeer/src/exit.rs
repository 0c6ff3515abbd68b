use std::fmt;
use std::io;

use relaypeer_peer::PeerError;
use relaypeer_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
}

pub fn peer_error(context: &str, err: PeerError) -> CliError {
    match err {
        PeerError::Transport(err) => transport_error(context, err),
        PeerError::Io(source) => io_error(context, source),
        PeerError::Wire(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        PeerError::Timeout(_) | PeerError::NoReply => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        PeerError::SelfTarget | PeerError::InvalidTarget | PeerError::InvalidEvent => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        PeerError::TargetUnavailable(_)
        | PeerError::StreamRejected(_)
        | PeerError::StreamClosed
        | PeerError::NotBound
        | PeerError::AlreadyBound => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}
