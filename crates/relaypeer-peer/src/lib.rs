//! Peer sessions over a relay.
//!
//! A [`Session`] binds a local client id to one relay link. On top of it:
//! - [`AddressedMessaging`] sends events to peers by id and scopes
//!   subscriptions per peer, purging them when the peer goes away
//! - [`StreamMultiplexer`] opens and accepts [`Duplex`] byte streams with one
//!   chunk in flight at a time
//!
//! [`ExclusiveSession`] is the single-peer mode, bound through a register
//! handshake.

mod bridge;
pub mod config;
pub mod duplex;
pub mod error;
pub mod exclusive;
pub mod messaging;
pub mod multiplexer;
pub mod session;
mod shared;

pub use config::{SessionConfig, DEFAULT_CHUNK_SIZE, DEFAULT_REQUEST_TIMEOUT};
pub use duplex::{Duplex, SinkId};
pub use error::{PeerError, Result};
pub use exclusive::{ExclusiveSession, HandshakeState};
pub use messaging::{
    AddressedMessaging, EventHandler, PeerScope, SubscriptionId, TargetAddedHandler,
};
pub use multiplexer::{StreamMultiplexer, StreamRequestHandler, NOT_LISTENING};
pub use session::Session;
