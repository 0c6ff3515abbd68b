/// Errors that can occur in relay link operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link is not connected to the relay.
    #[error("relay link is disconnected")]
    Disconnected,

    /// The relay refused the connection.
    #[error("failed to connect client {client_id}: {reason}")]
    Connect { client_id: String, reason: String },

    /// The event could not be handed to the relay.
    #[error("failed to emit {event}: {reason}")]
    Emit { event: String, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;
