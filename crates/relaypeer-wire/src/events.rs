//! Reserved relay event names.
//!
//! Every peer on a relay must use the same strings. Application events must
//! not collide with these names.

/// Ask the relay to announce this session to a target (multiplexed mode).
pub const ADD_TARGET: &str = "MULTI_API_ADD_TARGET";

/// Tell the relay (and through it, the target) that a binding was dropped.
pub const REMOVE_TARGET: &str = "MULTI_API_REMOVE_TARGET";

/// Relay notice: a peer identity disconnected. Argument: the peer id.
pub const TARGET_DISCONNECT: &str = "MULTI_API_TARGET_DISCONNECT";

/// Exclusive-mode register request.
pub const REGISTER: &str = "P2P_REGISTER";

/// Exclusive-mode unregister notice.
pub const UNREGISTER: &str = "P2P_UNREGISTER";

/// Unicast envelope, fire-and-forget.
pub const EMIT: &str = "P2P_EMIT";

/// Unicast envelope with acknowledgement.
pub const EMIT_ACKNOWLEDGE: &str = "P2P_EMIT_ACKNOWLEDGE";

/// Stream-open request; accept or reject travels back in the ack.
pub const CREATE_STREAM: &str = "MULTI_API_CREATE_STREAM";

/// Prefix of per-stream chunk events.
pub const STREAM_EVENT_PREFIX: &str = "P2P_EMIT_STREAM-from-stream-";

/// Peer notice: the stream whose id is the argument was closed.
pub const PEER_STREAM_DESTROYED: &str = "PEER_STREAM_DESTROYED";

/// Ask the relay for the connected client ids.
pub const LIST_CLIENTS: &str = "LIST_CLIENTS";

/// Relay-side error report. Argument: a message string.
pub const SERVER_ERROR: &str = "SERVER_ERROR";

/// Chunk event carrying data sent by the stream identified by `stream_id`.
pub fn chunk_event(stream_id: &str) -> String {
    format!("{STREAM_EVENT_PREFIX}{stream_id}")
}

/// Returns true if `event` is part of the wire contract.
pub fn is_reserved(event: &str) -> bool {
    matches!(
        event,
        ADD_TARGET
            | REMOVE_TARGET
            | TARGET_DISCONNECT
            | REGISTER
            | UNREGISTER
            | EMIT
            | EMIT_ACKNOWLEDGE
            | CREATE_STREAM
            | PEER_STREAM_DESTROYED
            | LIST_CLIENTS
            | SERVER_ERROR
            | relaypeer_transport::DISCONNECT
    ) || event.starts_with(STREAM_EVENT_PREFIX)
}

/// Returns true if `event` is produced or consumed by the relay or the link
/// itself. Such names never travel inside an envelope; peer-to-peer stream
/// traffic is the only reserved traffic a relay forwards.
pub fn is_relay_event(event: &str) -> bool {
    is_reserved(event) && event != PEER_STREAM_DESTROYED && !event.starts_with(STREAM_EVENT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_event_is_namespaced_per_stream() {
        assert_eq!(chunk_event("abc"), "P2P_EMIT_STREAM-from-stream-abc");
        assert_ne!(chunk_event("a"), chunk_event("b"));
    }

    #[test]
    fn stream_traffic_is_forwardable() {
        assert!(is_relay_event("disconnect"));
        assert!(is_relay_event(REGISTER));
        assert!(is_relay_event(TARGET_DISCONNECT));
        assert!(!is_relay_event(PEER_STREAM_DESTROYED));
        assert!(!is_relay_event(&chunk_event("s-1")));
        assert!(!is_relay_event("status"));
    }

    #[test]
    fn reserved_names() {
        assert!(is_reserved(ADD_TARGET));
        assert!(is_reserved("disconnect"));
        assert!(is_reserved(&chunk_event("s-1")));
        assert!(!is_reserved("chat-message"));
    }
}
