//! Relay link abstraction.
//!
//! A relay link is a single persistent publish/subscribe connection to a
//! central relay: emit an event with arguments (optionally acknowledged),
//! subscribe and unsubscribe listeners, observe disconnect.
//!
//! This is the lowest layer of relaypeer. Everything else builds on top of
//! the [`RelayLink`] trait provided here.

pub mod emitter;
pub mod error;
pub mod traits;

pub use emitter::EventEmitter;
pub use error::{Result, TransportError};
pub use traits::{Ack, Arg, Event, Listener, ListenerId, RelayLink, DISCONNECT};
