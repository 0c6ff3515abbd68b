//! Wire contract between peers sharing one relay.
//!
//! Every multiplexed event travels inside an [`Envelope`]:
//! - a JSON header naming the target client and the event
//! - the event arguments, sender id first
//!
//! Reserved event names live in [`events`]; request payloads and
//! acknowledgement reply shapes live in [`control`].

pub mod control;
pub mod envelope;
pub mod error;
pub mod events;

pub use control::{
    decode_client_list, decode_register_reply, decode_status_reply, status_reply,
    StreamOpenRequest,
};
pub use envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeHeader};
pub use error::{Result, WireError};
pub use events::{
    chunk_event, is_relay_event, is_reserved, ADD_TARGET, CREATE_STREAM, EMIT, EMIT_ACKNOWLEDGE, LIST_CLIENTS,
    PEER_STREAM_DESTROYED, REGISTER, REMOVE_TARGET, SERVER_ERROR, STREAM_EVENT_PREFIX,
    TARGET_DISCONNECT, UNREGISTER,
};
