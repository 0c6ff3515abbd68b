use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relaypeer_transport::{Ack, Arg, Event, Result, TransportError};
use relaypeer_wire::{
    decode_envelope, decode_register_reply, events, is_relay_event, status_reply,
    StreamOpenRequest,
};
use tracing::{debug, warn};

use crate::link::{Delivery, LinkShared, MemoryLink};

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, Arc<LinkShared>>,
    /// Exclusive-mode bindings, stored in both directions.
    exclusive: HashMap<String, String>,
    /// Register requests awaiting the target's verdict, source to target.
    pending_register: HashMap<String, String>,
}

pub(crate) struct RelayShared {
    state: Mutex<RelayState>,
}

/// In-process relay.
///
/// Cloning yields another handle to the same relay.
#[derive(Clone)]
pub struct MemoryRelay {
    shared: Arc<RelayShared>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RelayShared {
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    /// Connect a client under `client_id`.
    ///
    /// Fails if the id is empty or already connected.
    pub fn connect(&self, client_id: &str) -> Result<Arc<MemoryLink>> {
        MemoryLink::open(self.shared.clone(), client_id)
    }

    /// Ids of connected clients, sorted.
    pub fn clients(&self) -> Vec<String> {
        self.shared.client_ids()
    }

    /// Whether `client_id` is connected.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.shared.lock().clients.contains_key(client_id)
    }

    /// Exclusive-mode partner of `client_id`, if bound.
    pub fn exclusive_partner(&self, client_id: &str) -> Option<String> {
        self.shared.lock().exclusive.get(client_id).cloned()
    }
}

impl RelayShared {
    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self, client_id: &str) -> Option<Arc<LinkShared>> {
        self.lock().clients.get(client_id).cloned()
    }

    fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn admit(&self, link: Arc<LinkShared>) -> Result<()> {
        let mut state = self.lock();
        if link.client_id.is_empty() {
            return Err(TransportError::Connect {
                client_id: String::new(),
                reason: "client id must not be empty".to_string(),
            });
        }
        if state.clients.contains_key(&link.client_id) {
            return Err(TransportError::Connect {
                client_id: link.client_id.clone(),
                reason: "client id already connected".to_string(),
            });
        }
        state.clients.insert(link.client_id.clone(), link);
        Ok(())
    }

    /// Drop a client and tell every remaining client it is gone.
    pub(crate) fn remove(&self, client_id: &str) {
        let others: Vec<Arc<LinkShared>> = {
            let mut state = self.lock();
            if state.clients.remove(client_id).is_none() {
                return;
            }
            if let Some(partner) = state.exclusive.remove(client_id) {
                state.exclusive.remove(&partner);
            }
            state.pending_register.remove(client_id);
            state.clients.values().cloned().collect()
        };

        debug!(client_id, notified = others.len(), "client left relay");
        for other in others {
            other.deliver_event(
                events::TARGET_DISCONNECT,
                vec![Arg::text(client_id)],
                None,
            );
        }
    }

    pub(crate) fn route(self: &Arc<Self>, from: &str, event: &str, args: Vec<Arg>, ack: Option<Ack>) {
        match event {
            events::ADD_TARGET => self.route_add_target(from, &args, ack),
            events::REMOVE_TARGET => self.route_remove_target(from, &args, ack),
            events::REGISTER => self.route_register(from, &args, ack),
            events::UNREGISTER => self.route_unregister(from, ack),
            events::EMIT | events::EMIT_ACKNOWLEDGE => self.route_envelope(from, args, ack),
            events::CREATE_STREAM => self.route_create_stream(from, &args, ack),
            events::LIST_CLIENTS => reply(ack, vec![Arg::Json(serde_json::json!(self.client_ids()))]),
            other => {
                warn!(from, event = other, "unsupported relay event");
                self.server_error(from, format!("unsupported relay event '{other}'"));
            }
        }
    }

    fn route_add_target(&self, from: &str, args: &[Arg], ack: Option<Ack>) {
        let target = match target_arg(from, args) {
            Ok(target) => target,
            Err(reason) => return reply(ack, status_reply(Err(reason))),
        };
        let Some(link) = self.client(&target) else {
            return reply(
                ack,
                status_reply(Err(format!("target client {target} is not connected"))),
            );
        };
        link.deliver(Delivery::Event {
            name: events::ADD_TARGET.to_string(),
            event: Event {
                args: vec![Arg::text(from)],
                ack,
            },
            unhandled: Some(status_reply(Err(format!(
                "target client {target} is not accepting targets"
            )))),
        });
    }

    fn route_remove_target(&self, from: &str, args: &[Arg], ack: Option<Ack>) {
        if let Ok(target) = target_arg(from, args) {
            if let Some(link) = self.client(&target) {
                link.deliver_event(events::TARGET_DISCONNECT, vec![Arg::text(from)], None);
            }
        }
        reply(ack, Vec::new());
    }

    fn route_register(self: &Arc<Self>, from: &str, args: &[Arg], ack: Option<Ack>) {
        let target = match target_arg(from, args) {
            Ok(target) => target,
            Err(_) => return reply(ack, vec![Arg::from(false)]),
        };
        let Some(link) = self.client(&target) else {
            return reply(ack, vec![Arg::from(false)]);
        };

        self.lock()
            .pending_register
            .insert(from.to_string(), target.clone());

        let relay = Arc::downgrade(self);
        let source = from.to_string();
        let bound_target = target.clone();
        let forward = Ack::new(move |verdict| {
            let accepted = decode_register_reply(&verdict).unwrap_or(false);
            let bound = relay
                .upgrade()
                .is_some_and(|relay| relay.finish_register(&source, &bound_target, accepted));
            reply(ack, vec![Arg::from(bound)]);
        });

        link.deliver(Delivery::Event {
            name: events::REGISTER.to_string(),
            event: Event::with_ack(vec![Arg::text(from)], forward),
            unhandled: Some(vec![Arg::from(false)]),
        });
    }

    fn route_unregister(&self, from: &str, ack: Option<Ack>) {
        let partner = {
            let mut state = self.lock();
            // A request still in flight is withdrawn; its target may have
            // accepted already and is told to let go.
            let withdrawn = state.pending_register.remove(from);
            let partner = state.exclusive.remove(from);
            if let Some(partner) = &partner {
                if state.exclusive.get(partner).map(String::as_str) == Some(from) {
                    state.exclusive.remove(partner);
                }
            }
            partner.or(withdrawn)
        };
        if let Some(partner) = partner.and_then(|id| self.client(&id)) {
            partner.deliver_event(events::UNREGISTER, vec![Arg::text(from)], None);
        }
        reply(ack, Vec::new());
    }

    fn route_envelope(&self, from: &str, args: Vec<Arg>, ack: Option<Ack>) {
        let envelope = match decode_envelope(args) {
            Ok(envelope) => envelope,
            Err(err) => return self.server_error(from, format!("malformed envelope: {err}")),
        };
        if is_relay_event(&envelope.event) {
            return self.server_error(
                from,
                format!("event name '{}' is reserved", envelope.event),
            );
        }
        match self.client(&envelope.target_client_id) {
            Some(link) => {
                link.deliver_event(&envelope.event, envelope.args, ack);
            }
            None => self.server_error(
                from,
                format!(
                    "target client {} is not connected",
                    envelope.target_client_id
                ),
            ),
        }
    }

    fn route_create_stream(&self, from: &str, args: &[Arg], ack: Option<Ack>) {
        let mut request = match StreamOpenRequest::from_args(args) {
            Ok(request) => request,
            Err(err) => {
                return reply(
                    ack,
                    status_reply(Err(format!("malformed stream-open request: {err}"))),
                )
            }
        };
        request.source_client_id = Some(from.to_string());

        let Some(link) = self.client(&request.target_client_id) else {
            return reply(
                ack,
                status_reply(Err(format!(
                    "target client {} is not connected",
                    request.target_client_id
                ))),
            );
        };
        let arg = match request.to_arg() {
            Ok(arg) => arg,
            Err(err) => return reply(ack, status_reply(Err(err.to_string()))),
        };
        link.deliver(Delivery::Event {
            name: events::CREATE_STREAM.to_string(),
            event: Event {
                args: vec![arg],
                ack,
            },
            unhandled: Some(status_reply(Err(
                "client is not listening to create stream event".to_string(),
            ))),
        });
    }

    /// Settle a register request. Binds only if the target accepted and the
    /// source has not withdrawn in the meantime.
    fn finish_register(&self, source: &str, target: &str, accepted: bool) -> bool {
        let mut state = self.lock();
        if state.pending_register.get(source).map(String::as_str) != Some(target) {
            debug!(source, target, "register settled after withdrawal");
            return false;
        }
        state.pending_register.remove(source);
        if !accepted {
            return false;
        }
        for id in [source, target] {
            if let Some(stale) = state.exclusive.remove(id) {
                state.exclusive.remove(&stale);
            }
        }
        state
            .exclusive
            .insert(source.to_string(), target.to_string());
        state
            .exclusive
            .insert(target.to_string(), source.to_string());
        true
    }

    fn server_error(&self, to: &str, message: String) {
        if let Some(link) = self.client(to) {
            link.deliver_event(events::SERVER_ERROR, vec![Arg::text(message)], None);
        }
    }
}

fn target_arg(from: &str, args: &[Arg]) -> std::result::Result<String, String> {
    let target = args
        .first()
        .and_then(Arg::as_str)
        .filter(|target| !target.is_empty())
        .ok_or_else(|| "request names no target client".to_string())?;
    if target == from {
        return Err("client cannot target itself".to_string());
    }
    Ok(target.to_string())
}

fn reply(ack: Option<Ack>, args: Vec<Arg>) {
    if let Some(ack) = ack {
        ack.call(args);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use relaypeer_transport::RelayLink;
    use relaypeer_wire::{decode_client_list, decode_status_reply, encode_envelope, Envelope};

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    fn ack_channel() -> (Ack, mpsc::Receiver<Vec<Arg>>) {
        let (tx, rx) = mpsc::channel();
        let ack = Ack::new(move |args| {
            let _ = tx.send(args);
        });
        (ack, rx)
    }

    #[test]
    fn duplicate_client_id_rejected() {
        let relay = MemoryRelay::new();
        let _a = relay.connect("A").expect("first connect should succeed");
        let err = relay.connect("A").expect_err("duplicate id should fail");
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(relay.connect("").is_err());
    }

    #[test]
    fn envelope_reaches_target_listener() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");

        let (tx, rx) = mpsc::channel();
        b.on(
            "greet",
            Arc::new(move |event: Event| {
                let _ = tx.send(event.args);
            }),
        );

        let envelope = Envelope::from_sender("A", "B", "greet", vec![Arg::text("hi")]);
        a.emit(events::EMIT, encode_envelope(envelope).expect("encode should work"))
            .expect("emit should succeed");

        let args = rx.recv_timeout(WAIT).expect("B should receive greet");
        assert_eq!(args[0].as_str(), Some("A"));
        assert_eq!(args[1].as_str(), Some("hi"));
    }

    #[test]
    fn acknowledged_envelope_round_trips() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");
        b.on(
            "ping",
            Arc::new(|event: Event| event.acknowledge(vec![Arg::text("pong")])),
        );

        let (ack, rx) = ack_channel();
        let envelope = Envelope::from_sender("A", "B", "ping", vec![]);
        a.emit_with_ack(
            events::EMIT_ACKNOWLEDGE,
            encode_envelope(envelope).expect("encode should work"),
            ack,
        )
        .expect("emit should succeed");

        let reply = rx.recv_timeout(WAIT).expect("ack should arrive");
        assert_eq!(reply[0].as_str(), Some("pong"));
    }

    #[test]
    fn add_target_without_listener_is_rejected() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let _b = relay.connect("B").expect("B should connect");

        let (ack, rx) = ack_channel();
        a.emit_with_ack(events::ADD_TARGET, vec![Arg::text("B")], ack)
            .expect("emit should succeed");
        let reply = rx.recv_timeout(WAIT).expect("relay should answer");
        assert!(decode_status_reply(&reply).is_some());

        let (ack, rx) = ack_channel();
        a.emit_with_ack(events::ADD_TARGET, vec![Arg::text("nobody")], ack)
            .expect("emit should succeed");
        let reply = rx.recv_timeout(WAIT).expect("relay should answer");
        assert!(decode_status_reply(&reply)
            .expect("missing target should be rejected")
            .contains("not connected"));
    }

    #[test]
    fn disconnect_notifies_remaining_clients() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");

        let (tx, rx) = mpsc::channel();
        b.on(
            events::TARGET_DISCONNECT,
            Arc::new(move |event: Event| {
                let _ = tx.send(event.args[0].as_str().map(str::to_string));
            }),
        );

        let (local_tx, local_rx) = mpsc::channel();
        a.on(
            relaypeer_transport::DISCONNECT,
            Arc::new(move |_| {
                let _ = local_tx.send(());
            }),
        );

        a.disconnect();
        assert!(!a.is_connected());
        assert_eq!(
            rx.recv_timeout(WAIT).expect("B should be notified"),
            Some("A".to_string())
        );
        local_rx
            .recv_timeout(WAIT)
            .expect("A should see its own disconnect");
        assert_eq!(relay.clients(), vec!["B".to_string()]);
        assert!(matches!(
            a.emit("anything", vec![]),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn list_clients_replies_sorted_ids() {
        let relay = MemoryRelay::new();
        let b = relay.connect("B").expect("B should connect");
        let _a = relay.connect("A").expect("A should connect");

        let (ack, rx) = ack_channel();
        b.emit_with_ack(events::LIST_CLIENTS, vec![], ack)
            .expect("emit should succeed");
        let reply = rx.recv_timeout(WAIT).expect("relay should answer");
        assert_eq!(
            decode_client_list(&reply).expect("list should decode"),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[test]
    fn register_accept_binds_both_sides() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");
        b.on(
            events::REGISTER,
            Arc::new(|event: Event| event.acknowledge(vec![Arg::from(true)])),
        );

        let (ack, rx) = ack_channel();
        a.emit_with_ack(events::REGISTER, vec![Arg::text("B")], ack)
            .expect("emit should succeed");
        let reply = rx.recv_timeout(WAIT).expect("register should be answered");
        assert_eq!(reply[0].as_bool(), Some(true));
        assert_eq!(relay.exclusive_partner("A").as_deref(), Some("B"));
        assert_eq!(relay.exclusive_partner("B").as_deref(), Some("A"));

        a.emit(events::UNREGISTER, vec![]).expect("emit should succeed");
        assert_eq!(relay.exclusive_partner("A"), None);
        assert_eq!(relay.exclusive_partner("B"), None);
    }

    #[test]
    fn reserved_envelope_event_is_refused() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");

        let (b_tx, b_rx) = mpsc::channel();
        b.on(
            relaypeer_transport::DISCONNECT,
            Arc::new(move |_| {
                let _ = b_tx.send(());
            }),
        );
        let (tx, rx) = mpsc::channel();
        a.on(
            events::SERVER_ERROR,
            Arc::new(move |event: Event| {
                let _ = tx.send(event.args[0].as_str().map(str::to_string));
            }),
        );

        let envelope = Envelope::from_sender("A", "B", "disconnect", vec![]);
        a.emit(events::EMIT, encode_envelope(envelope).expect("encode should work"))
            .expect("emit should succeed");

        let message = rx
            .recv_timeout(WAIT)
            .expect("server error should arrive")
            .expect("message should be a string");
        assert!(message.contains("reserved"));
        assert!(b_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(b.is_connected());
    }

    #[test]
    fn withdrawn_register_does_not_bind() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let b = relay.connect("B").expect("B should connect");

        let (held_tx, held_rx) = mpsc::channel();
        b.on(
            events::REGISTER,
            Arc::new(move |event: Event| {
                let _ = held_tx.send(event);
            }),
        );
        let (unregister_tx, unregister_rx) = mpsc::channel();
        b.on(
            events::UNREGISTER,
            Arc::new(move |event: Event| {
                let _ = unregister_tx.send(event.args[0].as_str().map(str::to_string));
            }),
        );

        let (ack, rx) = ack_channel();
        a.emit_with_ack(events::REGISTER, vec![Arg::text("B")], ack)
            .expect("emit should succeed");
        let request = held_rx.recv_timeout(WAIT).expect("B should see the request");

        a.emit(events::UNREGISTER, vec![]).expect("emit should succeed");
        assert_eq!(
            unregister_rx.recv_timeout(WAIT).expect("B should be released"),
            Some("A".to_string())
        );

        request.acknowledge(vec![Arg::from(true)]);
        let reply = rx.recv_timeout(WAIT).expect("register should be answered");
        assert_eq!(reply[0].as_bool(), Some(false));
        assert_eq!(relay.exclusive_partner("A"), None);
        assert_eq!(relay.exclusive_partner("B"), None);
    }

    #[test]
    fn unknown_event_reports_server_error() {
        let relay = MemoryRelay::new();
        let a = relay.connect("A").expect("A should connect");
        let (tx, rx) = mpsc::channel();
        a.on(
            events::SERVER_ERROR,
            Arc::new(move |event: Event| {
                let _ = tx.send(event.args[0].as_str().map(str::to_string));
            }),
        );

        a.emit("NOT_A_RELAY_EVENT", vec![]).expect("emit should succeed");
        let message = rx
            .recv_timeout(WAIT)
            .expect("server error should arrive")
            .expect("message should be a string");
        assert!(message.contains("NOT_A_RELAY_EVENT"));
    }
}
