//! Peer-addressed messaging and duplex streams over a publish/subscribe relay.
//!
//! relaypeer lets clients of a central relay address each other by id,
//! hold exclusive one-to-one bindings, and run any number of chunked,
//! acknowledged byte streams per peer pair.
//!
//! # Crate Structure
//!
//! - [`transport`]: the relay link abstraction and event dispatch
//! - [`wire`]: event names and payload shapes exchanged with the relay
//! - [`relay`]: an in-process relay for tests and demos
//! - [`peer`]: sessions, addressed messaging, duplex streams

/// Re-export transport types.
pub mod transport {
    pub use relaypeer_transport::*;
}

/// Re-export wire types.
pub mod wire {
    pub use relaypeer_wire::*;
}

/// Re-export the in-process relay.
pub mod relay {
    pub use relaypeer_relay::*;
}

/// Re-export peer types.
pub mod peer {
    pub use relaypeer_peer::*;
}
