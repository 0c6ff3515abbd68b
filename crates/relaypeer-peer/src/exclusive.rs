//! Exclusive single-target mode.
//!
//! The session binds to at most one peer at a time through a register
//! handshake:
//!
//! ```text
//! Idle -> Registering -> Registered(target) -> Unregistering -> Idle
//! ```
//!
//! A rejected or timed-out register returns to `Idle`. Remote unregister,
//! remote disconnect of the bound peer and local disconnect force `Idle`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use relaypeer_transport::{Ack, Arg, Event, Listener, ListenerId, RelayLink, DISCONNECT};
use relaypeer_wire::{decode_register_reply, events};
use tracing::{debug, info};

use crate::bridge;
use crate::config::SessionConfig;
use crate::error::{PeerError, Result};
use crate::messaging::SubscriptionId;
use crate::shared::{sender_of, strip_sender, validate_app_event, Core};

/// Handshake state of an [`ExclusiveSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    /// Register request sent, awaiting the verdict.
    Registering(String),
    Registered(String),
    /// Unregister notice being sent.
    Unregistering(String),
}

impl HandshakeState {
    /// Peer involved in the current state, if any.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Registering(peer) | Self::Registered(peer) | Self::Unregistering(peer) => {
                Some(peer)
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

struct ExclusiveInner {
    core: Arc<Core>,
    state: Mutex<HandshakeState>,
    lifecycle: Mutex<Vec<(&'static str, ListenerId)>>,
    subscriptions: Mutex<Vec<(SubscriptionId, String, ListenerId)>>,
    next_id: AtomicU64,
}

/// A session bound to at most one peer at a time.
///
/// Cloning yields another handle to the same state machine.
#[derive(Clone)]
pub struct ExclusiveSession {
    inner: Arc<ExclusiveInner>,
}

impl ExclusiveSession {
    /// Bind `client_id` to `link` in exclusive mode.
    pub fn new(
        link: Arc<dyn RelayLink>,
        client_id: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self> {
        let core = Core::new(link, client_id.into(), config)?;
        let inner = Arc::new(ExclusiveInner {
            core,
            state: Mutex::new(HandshakeState::Idle),
            lifecycle: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });

        let link = inner.core.link.clone();
        let lifecycle = vec![
            (
                events::REGISTER,
                link.on(events::REGISTER, incoming_register(Arc::downgrade(&inner))),
            ),
            (
                events::UNREGISTER,
                link.on(
                    events::UNREGISTER,
                    release_on(Arc::downgrade(&inner), "peer unregistered"),
                ),
            ),
            (
                events::TARGET_DISCONNECT,
                link.on(
                    events::TARGET_DISCONNECT,
                    release_on(Arc::downgrade(&inner), "peer disconnected"),
                ),
            ),
            (DISCONNECT, {
                let weak = Arc::downgrade(&inner);
                link.on(
                    DISCONNECT,
                    Arc::new(move |_event: Event| {
                        if let Some(inner) = weak.upgrade() {
                            inner.release(None, "link down");
                        }
                    }),
                )
            }),
        ];
        *inner.lock_lifecycle() = lifecycle;

        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.core.client_id
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.inner.lock().clone()
    }

    /// Bound peer, only while `Registered`.
    pub fn target(&self) -> Option<String> {
        match &*self.inner.lock() {
            HandshakeState::Registered(target) => Some(target.clone()),
            _ => None,
        }
    }

    /// Register with `target`, bounded by the configured request timeout.
    pub fn register(&self, target: &str) -> Result<()> {
        self.register_with_timeout(target, self.inner.core.config.request_timeout)
    }

    /// [`ExclusiveSession::register`] with an explicit timeout.
    pub fn register_with_timeout(&self, target: &str, timeout: Option<Duration>) -> Result<()> {
        let core = &self.inner.core;
        core.check_target(target)?;
        {
            let mut state = self.inner.lock();
            if !state.is_idle() {
                return Err(PeerError::AlreadyBound);
            }
            *state = HandshakeState::Registering(target.to_string());
        }

        let verdict = bridge::request(
            core.link.as_ref(),
            events::REGISTER,
            vec![Arg::text(target)],
            timeout,
        )
        .and_then(|reply| Ok(decode_register_reply(&reply)?));

        let registering = HandshakeState::Registering(target.to_string());
        match verdict {
            Ok(true) => {
                let mut state = self.inner.lock();
                if *state == registering {
                    *state = HandshakeState::Registered(target.to_string());
                    drop(state);
                    info!(client_id = %core.client_id, target, "registered");
                    return Ok(());
                }
                drop(state);
                // Dropped while the request was in flight; undo on the relay.
                self.inner.send_unregister();
                Err(PeerError::TargetUnavailable(format!(
                    "registration with {target} was interrupted"
                )))
            }
            Ok(false) => {
                self.inner.reset_if(&registering);
                debug!(client_id = %core.client_id, target, "register refused");
                Err(PeerError::TargetUnavailable(format!(
                    "{target} refused registration"
                )))
            }
            Err(err) => {
                if matches!(err, PeerError::Timeout(_)) {
                    // A late accept would leave the relay paired.
                    self.inner.send_unregister();
                }
                self.inner.reset_if(&registering);
                Err(err)
            }
        }
    }

    /// Drop the binding. A no-op when idle.
    ///
    /// The notice is not acknowledged: local state returns to `Idle`
    /// immediately, even when sending fails.
    pub fn unregister(&self) -> Result<()> {
        let target = {
            let mut state = self.inner.lock();
            let Some(target) = state.peer().map(str::to_string) else {
                return Ok(());
            };
            *state = HandshakeState::Unregistering(target.clone());
            target
        };

        let sent = self.inner.core.link.emit(events::UNREGISTER, vec![]);
        self.inner
            .reset_if(&HandshakeState::Unregistering(target.clone()));
        info!(client_id = %self.inner.core.client_id, target = %target, "unregistered");
        sent.map_err(Into::into)
    }

    /// Send `event` to the bound peer. Reserved wire names are refused
    /// with [`PeerError::InvalidEvent`].
    pub fn emit(&self, event: &str, args: Vec<Arg>) -> Result<()> {
        validate_app_event(event)?;
        let target = self.target().ok_or(PeerError::NotBound)?;
        self.inner.core.send_envelope(&target, event, args, None)
    }

    /// Send `event` to the bound peer; `ack` runs with its reply.
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<Arg>,
        ack: impl FnOnce(Vec<Arg>) + Send + 'static,
    ) -> Result<()> {
        validate_app_event(event)?;
        let target = self.target().ok_or(PeerError::NotBound)?;
        self.inner
            .core
            .send_envelope(&target, event, args, Some(Ack::new(ack)))
    }

    /// Subscribe to `event` as sent by whichever peer is bound when it
    /// arrives. The sender id is removed from the arguments.
    pub fn on(
        &self,
        event: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(&self.inner);
        let listener: Listener = Arc::new(move |event: Event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let bound = matches!(
                (&*inner.lock(), sender_of(&event)),
                (HandshakeState::Registered(target), Some(sender)) if target == sender
            );
            if bound {
                handler(strip_sender(event));
            }
        });

        let mut subscriptions = self.inner.lock_subscriptions();
        let listener_id = self.inner.core.link.on(event, listener);
        subscriptions.push((id, event.to_string(), listener_id));
        id
    }

    /// Remove a subscription made with [`ExclusiveSession::on`].
    pub fn off(&self, id: SubscriptionId) {
        let removed = {
            let mut subscriptions = self.inner.lock_subscriptions();
            let Some(index) = subscriptions.iter().position(|(sub, _, _)| *sub == id) else {
                return;
            };
            subscriptions.remove(index)
        };
        self.inner.core.link.off(&removed.1, removed.2);
    }
}

impl std::fmt::Debug for ExclusiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveSession")
            .field("client_id", &self.inner.core.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ExclusiveInner {
    fn lock(&self) -> MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Vec<(&'static str, ListenerId)>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<(SubscriptionId, String, ListenerId)>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_if(&self, expected: &HandshakeState) {
        let mut state = self.lock();
        if *state == *expected {
            *state = HandshakeState::Idle;
        }
    }

    fn send_unregister(&self) {
        if let Err(err) = self.core.link.emit(events::UNREGISTER, vec![]) {
            debug!(client_id = %self.core.client_id, error = %err, "unregister notice not sent");
        }
    }

    /// Force `Idle` when `peer` (or anyone, for `None`) is the current peer.
    fn release(&self, peer: Option<&str>, cause: &str) {
        let released = {
            let mut state = self.lock();
            match state.peer().map(str::to_string) {
                Some(current) if peer.is_none_or(|peer| peer == current) => {
                    *state = HandshakeState::Idle;
                    Some(current)
                }
                _ => None,
            }
        };
        if let Some(target) = released {
            info!(client_id = %self.core.client_id, target = %target, cause, "binding released");
        }
    }
}

impl Drop for ExclusiveInner {
    fn drop(&mut self) {
        let link = self.core.link.clone();
        let bound = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .peer()
            .is_some();
        if bound && link.is_connected() {
            self.send_unregister();
        }

        let lifecycle = std::mem::take(
            self.lifecycle
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let subscriptions = std::mem::take(
            self.subscriptions
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (event, id) in lifecycle {
            link.off(event, id);
        }
        for (_, event, id) in subscriptions {
            link.off(&event, id);
        }
    }
}

fn incoming_register(owner: Weak<ExclusiveInner>) -> Listener {
    Arc::new(move |event: Event| {
        let (Some(inner), Some(peer)) = (owner.upgrade(), sender_of(&event).map(str::to_string))
        else {
            event.acknowledge(vec![Arg::from(false)]);
            return;
        };

        let accepted = {
            let mut state = inner.lock();
            let accepted = match &*state {
                HandshakeState::Idle => true,
                HandshakeState::Registered(bound) => *bound == peer,
                _ => false,
            };
            if state.is_idle() {
                *state = HandshakeState::Registered(peer.clone());
            }
            accepted
        };
        if accepted {
            info!(client_id = %inner.core.client_id, peer = %peer, "accepted register");
        } else {
            debug!(client_id = %inner.core.client_id, peer = %peer, "refused register: busy");
        }
        event.acknowledge(vec![Arg::from(accepted)]);
    })
}

fn release_on(owner: Weak<ExclusiveInner>, cause: &'static str) -> Listener {
    Arc::new(move |event: Event| {
        let (Some(inner), Some(peer)) = (owner.upgrade(), sender_of(&event)) else {
            return;
        };
        inner.release(Some(peer), cause);
    })
}
