/// Errors that can occur while decoding wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A required argument is missing.
    #[error("missing argument {index} ({expected})")]
    MissingArg { index: usize, expected: &'static str },

    /// An argument has the wrong shape.
    #[error("argument {index} is not {expected}")]
    UnexpectedArg { index: usize, expected: &'static str },

    /// A structured argument failed to deserialize.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope names no event.
    #[error("envelope event name is empty")]
    EmptyEvent,
}

pub type Result<T> = std::result::Result<T, WireError>;
