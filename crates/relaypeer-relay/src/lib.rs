//! In-process relay.
//!
//! [`MemoryRelay`] routes events between [`MemoryLink`]s the way a hosted
//! relay server would: unicast envelopes, add-target and register
//! handshakes, stream-open requests, client listing, and disconnect
//! notices. Each link delivers its events on its own I/O thread.

pub mod link;
pub mod relay;

pub use link::MemoryLink;
pub use relay::MemoryRelay;
