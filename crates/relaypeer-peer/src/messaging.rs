use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use relaypeer_transport::{Ack, Arg, Event, Listener, ListenerId, DISCONNECT};
use relaypeer_wire::{decode_status_reply, encode_envelope, events, status_reply, Envelope};
use tracing::{debug, trace, warn};

use crate::bridge;
use crate::error::{PeerError, Result};
use crate::shared::{sender_of, strip_sender, validate_app_event, validate_peer_id, Core};

/// Listener for events delivered through the session. The sender id has
/// already been removed from the arguments.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Decides whether a remote peer may add this session as a target.
pub type TargetAddedHandler = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Handle for one subscription made through [`AddressedMessaging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Why a peer binding went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
    /// Local `remove_target`.
    Removed,
    /// The relay reported the peer gone, or the local link dropped.
    Disconnected,
}

pub(crate) type DepartureHook = Arc<dyn Fn(&str, Departure) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    event: String,
    listener: ListenerId,
}

#[derive(Default)]
struct MessagingState {
    targets: BTreeSet<String>,
    /// Peer-scoped subscriptions, indexed by owning peer.
    scoped: HashMap<String, Vec<Subscription>>,
    any: Vec<Subscription>,
    target_added: Option<ListenerId>,
    departure_hooks: Vec<DepartureHook>,
}

struct MessagingInner {
    core: Arc<Core>,
    state: Mutex<MessagingState>,
    lifecycle: Mutex<Vec<(&'static str, ListenerId)>>,
    next_id: AtomicU64,
}

/// Peer-addressed events over one shared relay link.
///
/// Every subscription is owned by a peer (or is sender-agnostic). When the
/// relay reports a peer gone, every subscription owned by that peer is
/// removed from the link and the binding is forgotten.
///
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct AddressedMessaging {
    inner: Arc<MessagingInner>,
}

/// Binder returned by [`AddressedMessaging::from`], carrying the peer id for
/// the calls that follow.
pub struct PeerScope<'a> {
    messaging: &'a AddressedMessaging,
    peer: String,
}

impl AddressedMessaging {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        let inner = Arc::new(MessagingInner {
            core,
            state: Mutex::new(MessagingState::default()),
            lifecycle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let link = inner.core.link.clone();
        let weak = Arc::downgrade(&inner);
        let peer_gone: Listener = Arc::new(move |event: Event| {
            let (Some(inner), Some(peer)) = (weak.upgrade(), sender_of(&event)) else {
                return;
            };
            inner.forget_peer(peer, Departure::Disconnected);
        });

        let weak = Arc::downgrade(&inner);
        let link_down: Listener = Arc::new(move |_event: Event| {
            if let Some(inner) = weak.upgrade() {
                inner.forget_everything();
            }
        });

        let client_id = inner.core.client_id.clone();
        let server_error: Listener = Arc::new(move |event: Event| {
            let message = event
                .args
                .first()
                .map(|arg| match arg.as_str() {
                    Some(text) => text.to_string(),
                    None => format!("{arg:?}"),
                })
                .unwrap_or_default();
            warn!(client_id = %client_id, %message, "relay reported an error");
        });

        *inner.lock_lifecycle() = vec![
            (
                events::TARGET_DISCONNECT,
                link.on(events::TARGET_DISCONNECT, peer_gone),
            ),
            (DISCONNECT, link.on(DISCONNECT, link_down)),
            (events::SERVER_ERROR, link.on(events::SERVER_ERROR, server_error)),
        ];

        Self { inner }
    }

    /// Local client id.
    pub fn client_id(&self) -> &str {
        &self.inner.core.client_id
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.inner.core
    }

    /// Ask the relay to announce this session to `peer` and wait for the
    /// peer's answer, bounded by the configured request timeout.
    pub fn add_target(&self, peer: &str) -> Result<()> {
        self.add_target_with_timeout(peer, self.inner.core.config.request_timeout)
    }

    /// [`AddressedMessaging::add_target`] with an explicit timeout.
    pub fn add_target_with_timeout(&self, peer: &str, timeout: Option<Duration>) -> Result<()> {
        self.inner.core.check_target(peer)?;
        let reply = bridge::request(
            self.inner.core.link.as_ref(),
            events::ADD_TARGET,
            vec![Arg::text(peer)],
            timeout,
        )
        .inspect_err(|err| self.withdraw_add_target(peer, err))?;
        self.finish_add_target(peer, &reply)
    }

    /// Async variant of [`AddressedMessaging::add_target`].
    #[cfg(feature = "async")]
    pub async fn add_target_async(&self, peer: &str) -> Result<()> {
        self.inner.core.check_target(peer)?;
        let reply = bridge::request_async(
            self.inner.core.link.as_ref(),
            events::ADD_TARGET,
            vec![Arg::text(peer)],
            self.inner.core.config.request_timeout,
        )
        .await
        .inspect_err(|err| self.withdraw_add_target(peer, err))?;
        self.finish_add_target(peer, &reply)
    }

    /// The peer may still accept after a timeout; tell it to let go.
    fn withdraw_add_target(&self, peer: &str, err: &PeerError) {
        if !matches!(err, PeerError::Timeout(_)) {
            return;
        }
        if let Err(err) = self
            .inner
            .core
            .link
            .emit(events::REMOVE_TARGET, vec![Arg::text(peer)])
        {
            debug!(client_id = %self.client_id(), peer, error = %err, "withdrawal notice not sent");
        }
    }

    fn finish_add_target(&self, peer: &str, reply: &[Arg]) -> Result<()> {
        if let Some(reason) = decode_status_reply(reply) {
            debug!(client_id = %self.client_id(), peer, %reason, "add target refused");
            return Err(PeerError::TargetUnavailable(reason));
        }
        self.inner.lock().targets.insert(peer.to_string());
        debug!(client_id = %self.client_id(), peer, "target added");
        Ok(())
    }

    /// Drop the binding with `peer`: purge its subscriptions, close its
    /// streams and send a best-effort removal notice.
    pub fn remove_target(&self, peer: &str) -> Result<()> {
        validate_peer_id(peer)?;
        if let Err(err) = self
            .inner
            .core
            .link
            .emit(events::REMOVE_TARGET, vec![Arg::text(peer)])
        {
            debug!(client_id = %self.client_id(), peer, error = %err, "removal notice not sent");
        }
        self.inner.forget_peer(peer, Departure::Removed);
        Ok(())
    }

    /// Current bindings, sorted.
    pub fn targets(&self) -> Vec<String> {
        self.inner.lock().targets.iter().cloned().collect()
    }

    /// Whether `peer` is currently bound.
    pub fn has_target(&self, peer: &str) -> bool {
        self.inner.lock().targets.contains(peer)
    }

    /// Install the handler consulted when a remote peer adds this session.
    ///
    /// Replaces any previous handler. Returning `Ok(())` accepts and binds
    /// the peer; `Err(reason)` declines. Exactly one acknowledgement is sent
    /// per request.
    pub fn on_target_added(
        &self,
        handler: impl Fn(&str) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) {
        let handler: TargetAddedHandler = Arc::new(handler);
        let weak = Arc::downgrade(&self.inner);
        let listener: Listener = Arc::new(move |event: Event| {
            let Some(peer) = sender_of(&event).map(str::to_string) else {
                event.acknowledge(status_reply(Err(
                    "add-target request names no peer".to_string()
                )));
                return;
            };
            let Some(inner) = weak.upgrade() else {
                event.acknowledge(status_reply(Err("session closed".to_string())));
                return;
            };
            let outcome = handler(&peer);
            if outcome.is_ok() {
                inner.lock().targets.insert(peer.clone());
                debug!(client_id = %inner.core.client_id, peer = %peer, "accepted incoming target");
            }
            event.acknowledge(status_reply(outcome));
        });

        let link = &self.inner.core.link;
        let mut state = self.inner.lock();
        if let Some(previous) = state.target_added.take() {
            link.off(events::ADD_TARGET, previous);
        }
        state.target_added = Some(link.on(events::ADD_TARGET, listener));
    }

    /// Remove the add-target handler. Later requests are refused.
    pub fn off_target_added(&self) {
        let previous = self.inner.lock().target_added.take();
        if let Some(id) = previous {
            self.inner.core.link.off(events::ADD_TARGET, id);
        }
    }

    /// Scope the following subscription calls to `peer`.
    pub fn from(&self, peer: impl Into<String>) -> PeerScope<'_> {
        PeerScope {
            messaging: self,
            peer: peer.into(),
        }
    }

    /// Subscribe to `event` as sent by `peer`.
    pub fn on(
        &self,
        peer: &str,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribe(Some(peer), event, Arc::new(handler), false)
    }

    /// Subscribe to the next `event` sent by `peer`.
    pub fn once(
        &self,
        peer: &str,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribe(Some(peer), event, Arc::new(handler), true)
    }

    /// Remove `peer`'s subscription `id` on `event`, or every subscription
    /// of `peer` on `event` when `id` is `None`.
    pub fn off(&self, peer: &str, event: &str, id: Option<SubscriptionId>) {
        let removed = {
            let mut state = self.inner.lock();
            let Some(subscriptions) = state.scoped.get_mut(peer) else {
                return;
            };
            let removed = take_matching(subscriptions, Some(event), id);
            if subscriptions.is_empty() {
                state.scoped.remove(peer);
            }
            removed
        };
        self.inner.release(&removed);
    }

    /// Subscribe to `event` from any sender.
    pub fn on_any(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribe(None, event, Arc::new(handler), false)
    }

    /// Subscribe to the next `event` from any sender.
    pub fn once_any(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.subscribe(None, event, Arc::new(handler), true)
    }

    /// Remove sender-agnostic subscriptions.
    ///
    /// With both filters `None` every sender-agnostic subscription goes.
    pub fn off_any(&self, event: Option<&str>, id: Option<SubscriptionId>) {
        let removed = take_matching(&mut self.inner.lock().any, event, id);
        self.inner.release(&removed);
    }

    /// Number of subscriptions owned by `peer`.
    pub fn subscription_count(&self, peer: &str) -> usize {
        self.inner.lock().scoped.get(peer).map_or(0, Vec::len)
    }

    /// Number of sender-agnostic subscriptions.
    pub fn any_subscription_count(&self) -> usize {
        self.inner.lock().any.len()
    }

    /// Send `event` to `peer` without acknowledgement.
    ///
    /// The peer need not have been added first.
    /// Reserved wire names are refused with [`PeerError::InvalidEvent`].
    pub fn emit_to(&self, peer: &str, event: &str, args: Vec<Arg>) -> Result<()> {
        validate_app_event(event)?;
        self.inner.core.send_envelope(peer, event, args, None)
    }

    /// Send `event` to `peer`; `ack` runs with the peer's reply.
    pub fn emit_to_with_ack(
        &self,
        peer: &str,
        event: &str,
        args: Vec<Arg>,
        ack: impl FnOnce(Vec<Arg>) + Send + 'static,
    ) -> Result<()> {
        validate_app_event(event)?;
        self.inner
            .core
            .send_envelope(peer, event, args, Some(Ack::new(ack)))
    }

    /// Send `event` to `peer` and wait for its reply, bounded by the
    /// configured request timeout.
    pub fn request_to(&self, peer: &str, event: &str, args: Vec<Arg>) -> Result<Vec<Arg>> {
        validate_app_event(event)?;
        validate_peer_id(peer)?;
        let core = &self.inner.core;
        let envelope = Envelope::from_sender(&core.client_id, peer, event, args);
        bridge::request(
            core.link.as_ref(),
            events::EMIT_ACKNOWLEDGE,
            encode_envelope(envelope)?,
            core.config.request_timeout,
        )
    }

    /// Register a hook run after a peer's subscriptions are purged.
    pub(crate) fn on_departure(&self, hook: DepartureHook) {
        self.inner.lock().departure_hooks.push(hook);
    }
}

impl std::fmt::Debug for AddressedMessaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressedMessaging")
            .field("client_id", &self.inner.core.client_id)
            .field("targets", &self.targets())
            .finish()
    }
}

impl PeerScope<'_> {
    /// Peer this scope is bound to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// See [`AddressedMessaging::on`].
    pub fn on(&self, event: &str, handler: impl Fn(Event) + Send + Sync + 'static) -> SubscriptionId {
        self.messaging.on(&self.peer, event, handler)
    }

    /// See [`AddressedMessaging::once`].
    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.messaging.once(&self.peer, event, handler)
    }

    /// See [`AddressedMessaging::off`].
    pub fn off(&self, event: &str, id: Option<SubscriptionId>) {
        self.messaging.off(&self.peer, event, id);
    }

    /// See [`AddressedMessaging::emit_to`].
    pub fn emit(&self, event: &str, args: Vec<Arg>) -> Result<()> {
        self.messaging.emit_to(&self.peer, event, args)
    }
}

impl MessagingInner {
    fn lock(&self) -> MutexGuard<'_, MessagingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Vec<(&'static str, ListenerId)>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(
        self: &Arc<Self>,
        peer: Option<&str>,
        event: &str,
        handler: EventHandler,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = scoped_listener(
            Arc::downgrade(self),
            peer.map(str::to_string),
            id,
            handler,
            once,
        );

        // Index before the listener can fire, so a `once` listener always
        // finds itself when it unsubscribes.
        let mut state = self.lock();
        let subscription = Subscription {
            id,
            event: event.to_string(),
            listener: self.core.link.on(event, listener),
        };
        match peer {
            Some(peer) => state
                .scoped
                .entry(peer.to_string())
                .or_default()
                .push(subscription),
            None => state.any.push(subscription),
        }
        trace!(client_id = %self.core.client_id, peer, event, "subscribed");
        id
    }

    fn unsubscribe(&self, peer: Option<&str>, id: SubscriptionId) {
        let removed = {
            let mut state = self.lock();
            match peer {
                Some(peer) => {
                    let Some(subscriptions) = state.scoped.get_mut(peer) else {
                        return;
                    };
                    let removed = take_matching(subscriptions, None, Some(id));
                    if subscriptions.is_empty() {
                        state.scoped.remove(peer);
                    }
                    removed
                }
                None => take_matching(&mut state.any, None, Some(id)),
            }
        };
        self.release(&removed);
    }

    fn release(&self, removed: &[Subscription]) {
        for subscription in removed {
            self.core
                .link
                .off(&subscription.event, subscription.listener);
        }
    }

    fn forget_peer(&self, peer: &str, departure: Departure) {
        let (was_target, removed, hooks) = {
            let mut state = self.lock();
            (
                state.targets.remove(peer),
                state.scoped.remove(peer).unwrap_or_default(),
                state.departure_hooks.clone(),
            )
        };
        self.release(&removed);
        if was_target || !removed.is_empty() {
            debug!(
                client_id = %self.core.client_id,
                peer,
                subscriptions = removed.len(),
                ?departure,
                "peer departed"
            );
        }
        for hook in hooks {
            hook(peer, departure);
        }
    }

    fn forget_everything(&self) {
        let peers: BTreeSet<String> = {
            let state = self.lock();
            state
                .targets
                .iter()
                .chain(state.scoped.keys())
                .cloned()
                .collect()
        };
        for peer in peers {
            self.forget_peer(&peer, Departure::Disconnected);
        }
        let any = std::mem::take(&mut self.lock().any);
        self.release(&any);
    }
}

impl Drop for MessagingInner {
    fn drop(&mut self) {
        let link = self.core.link.clone();
        let lifecycle = std::mem::take(
            self.lifecycle
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (event, id) in lifecycle {
            link.off(event, id);
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = state.target_added.take() {
            link.off(events::ADD_TARGET, id);
        }
        for subscription in state
            .scoped
            .drain()
            .flat_map(|(_, subscriptions)| subscriptions)
            .chain(state.any.drain(..))
        {
            link.off(&subscription.event, subscription.listener);
        }
    }
}

fn scoped_listener(
    owner: Weak<MessagingInner>,
    peer: Option<String>,
    id: SubscriptionId,
    handler: EventHandler,
    once: bool,
) -> Listener {
    let fired = AtomicBool::new(false);
    Arc::new(move |event: Event| {
        if let Some(peer) = &peer {
            if sender_of(&event) != Some(peer.as_str()) {
                return;
            }
        }
        if once {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(owner) = owner.upgrade() {
                owner.unsubscribe(peer.as_deref(), id);
            }
        }
        handler(strip_sender(event));
    })
}

fn take_matching(
    subscriptions: &mut Vec<Subscription>,
    event: Option<&str>,
    id: Option<SubscriptionId>,
) -> Vec<Subscription> {
    let (removed, kept) = std::mem::take(subscriptions)
        .into_iter()
        .partition(|subscription: &Subscription| {
            event.is_none_or(|event| subscription.event == event)
                && id.is_none_or(|id| subscription.id == id)
        });
    *subscriptions = kept;
    removed
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use relaypeer_relay::MemoryRelay;
    use relaypeer_transport::RelayLink;

    use super::*;
    use crate::config::SessionConfig;

    const WAIT: Duration = Duration::from_secs(2);

    fn messaging(relay: &MemoryRelay, id: &str) -> AddressedMessaging {
        let link = relay.connect(id).expect("client should connect");
        let core = Core::new(link, id.to_string(), SessionConfig::default())
            .expect("client id should be valid");
        AddressedMessaging::new(core)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn add_target_binds_both_sides() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        b.on_target_added(|_| Ok(()));

        a.add_target("B").expect("B should accept");
        assert_eq!(a.targets(), vec!["B".to_string()]);
        assert!(b.has_target("A"));
    }

    #[test]
    fn add_target_refused_without_handler() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let _b = messaging(&relay, "B");

        let err = a.add_target("B").expect_err("B is not accepting targets");
        assert!(matches!(err, PeerError::TargetUnavailable(_)));
        assert!(a.targets().is_empty());
    }

    #[test]
    fn declining_handler_reason_reaches_requester() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        b.on_target_added(|peer| Err(format!("{peer} is not welcome")));

        match a.add_target("B") {
            Err(PeerError::TargetUnavailable(reason)) => assert_eq!(reason, "A is not welcome"),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(!b.has_target("A"));
    }

    #[test]
    fn self_and_empty_targets_rejected_locally() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        assert!(matches!(a.add_target("A"), Err(PeerError::SelfTarget)));
        assert!(matches!(a.add_target(""), Err(PeerError::InvalidTarget)));
        assert!(matches!(
            a.emit_to("B", "", vec![]),
            Err(PeerError::InvalidEvent)
        ));
    }

    #[test]
    fn scoped_listener_filters_by_sender() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        let c = messaging(&relay, "C");

        let (tx, rx) = mpsc::channel();
        b.from("A").on("evt", move |event| {
            let _ = tx.send(event.args[0].as_str().map(str::to_string));
        });

        c.emit_to("B", "evt", vec![Arg::text("from C")])
            .expect("C should emit");
        a.emit_to("B", "evt", vec![Arg::text("hello")])
            .expect("A should emit");

        assert_eq!(
            rx.recv_timeout(WAIT).expect("A's event should arrive"),
            Some("hello".to_string())
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn once_fires_a_single_time_and_unindexes() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");

        let (tx, rx) = mpsc::channel();
        b.from("A").once("tick", move |_| {
            let _ = tx.send(());
        });
        assert_eq!(b.subscription_count("A"), 1);

        a.emit_to("B", "tick", vec![]).expect("first emit");
        a.emit_to("B", "tick", vec![]).expect("second emit");

        rx.recv_timeout(WAIT).expect("first tick should arrive");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(wait_until(|| b.subscription_count("A") == 0));
    }

    #[test]
    fn off_removes_selected_subscriptions() {
        let relay = MemoryRelay::new();
        let b = messaging(&relay, "B");

        let first = b.on("A", "evt", |_| {});
        let _second = b.on("A", "evt", |_| {});
        let _other = b.on("A", "other", |_| {});
        assert_eq!(b.subscription_count("A"), 3);

        b.off("A", "evt", Some(first));
        assert_eq!(b.subscription_count("A"), 2);
        b.from("A").off("evt", None);
        assert_eq!(b.subscription_count("A"), 1);
        assert_eq!(b.core().link.listener_count("other"), 1);
    }

    #[test]
    fn any_listener_strips_sender() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");

        let (tx, rx) = mpsc::channel();
        b.on_any("evt", move |event| {
            let _ = tx.send(event.args);
        });
        a.emit_to("B", "evt", vec![Arg::from(true)])
            .expect("A should emit");

        let args = rx.recv_timeout(WAIT).expect("event should arrive");
        assert_eq!(args, vec![Arg::from(true)]);

        b.on_any("other", |_| {});
        b.off_any(Some("evt"), None);
        assert_eq!(b.any_subscription_count(), 1);
        b.off_any(None, None);
        assert_eq!(b.any_subscription_count(), 0);
    }

    #[test]
    fn request_to_returns_peer_reply() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        b.from("A").on("sum", |event| {
            let total: u64 = event
                .args
                .iter()
                .filter_map(|arg| arg.as_json().and_then(serde_json::Value::as_u64))
                .sum();
            event.acknowledge(vec![Arg::from(serde_json::json!(total))]);
        });

        let reply = a
            .request_to(
                "B",
                "sum",
                vec![serde_json::json!(2).into(), serde_json::json!(3).into()],
            )
            .expect("B should reply");
        assert_eq!(reply, vec![Arg::from(serde_json::json!(5))]);
    }

    #[test]
    fn peer_disconnect_purges_subscriptions_and_binding() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        b.on_target_added(|_| Ok(()));
        a.add_target("B").expect("B should accept");

        for event in ["one", "two", "three"] {
            b.from("A").on(event, |_| {});
        }
        assert_eq!(b.subscription_count("A"), 3);

        a.core().link.disconnect();
        assert!(wait_until(|| b.subscription_count("A") == 0 && !b.has_target("A")));
        assert_eq!(b.core().link.listener_count("one"), 0);
    }

    #[test]
    fn remove_target_notifies_peer() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A");
        let b = messaging(&relay, "B");
        b.on_target_added(|_| Ok(()));
        a.add_target("B").expect("B should accept");
        a.from("B").on("evt", |_| {});

        a.remove_target("B").expect("removal should succeed");
        assert!(a.targets().is_empty());
        assert_eq!(a.subscription_count("B"), 0);
        assert!(wait_until(|| !b.has_target("A")));
    }

    #[test]
    fn dropping_messaging_releases_link_listeners() {
        let relay = MemoryRelay::new();
        let link = relay.connect("A").expect("A should connect");
        let core = Core::new(link.clone(), "A".to_string(), SessionConfig::default())
            .expect("client id should be valid");
        let a = AddressedMessaging::new(core);
        a.from("B").on("evt", |_| {});
        a.on_target_added(|_| Ok(()));
        assert_eq!(link.listener_count("evt"), 1);

        drop(a);
        assert_eq!(link.listener_count("evt"), 0);
        assert_eq!(link.listener_count(events::ADD_TARGET), 0);
        assert_eq!(link.listener_count(events::TARGET_DISCONNECT), 0);
    }
}
