use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use relaypeer_transport::{Arg, Event, Listener, ListenerId};
use relaypeer_wire::{decode_status_reply, events, status_reply, StreamOpenRequest};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge;
use crate::duplex::{CloseReason, Duplex};
use crate::error::{PeerError, Result};
use crate::messaging::{AddressedMessaging, Departure};

/// Reason sent back when no stream handler is installed.
pub const NOT_LISTENING: &str = "client is not listening to create stream event";

/// Decides whether to accept an incoming stream. The handler receives the
/// accepting end and returns `Err(reason)` to decline.
///
/// Runs on the link's I/O context: it may attach sinks or start an input,
/// but must not block on another relay round-trip.
pub type StreamRequestHandler =
    Arc<dyn Fn(Duplex) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default)]
struct MultiplexerState {
    active: Vec<Duplex>,
    request_listener: Option<ListenerId>,
}

struct MultiplexerInner {
    messaging: AddressedMessaging,
    state: Mutex<MultiplexerState>,
}

/// Opens and accepts [`Duplex`] streams over the session's messaging layer.
///
/// Any number of streams may be open at once, several per peer. Streams
/// leave the active set when destroyed.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<MultiplexerInner>,
}

impl StreamMultiplexer {
    pub(crate) fn new(messaging: AddressedMessaging) -> Self {
        let inner = Arc::new(MultiplexerInner {
            messaging,
            state: Mutex::new(MultiplexerState::default()),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .messaging
            .on_departure(Arc::new(move |peer: &str, departure: Departure| {
                if let Some(inner) = weak.upgrade() {
                    inner.close_peer_streams(peer, departure);
                }
            }));

        let multiplexer = Self { inner };
        multiplexer.install(None);
        multiplexer
    }

    /// Open a stream to `peer`, bounded by the configured request timeout.
    pub fn open_stream(&self, peer: &str) -> Result<Duplex> {
        self.open_stream_with_timeout(peer, self.inner.messaging.core().config.request_timeout)
    }

    /// [`StreamMultiplexer::open_stream`] with an explicit timeout.
    pub fn open_stream_with_timeout(&self, peer: &str, timeout: Option<Duration>) -> Result<Duplex> {
        let (duplex, request) = self.prepare(peer)?;
        let outcome = request.to_arg().map_err(PeerError::from).and_then(|arg| {
            bridge::request(
                self.inner.messaging.core().link.as_ref(),
                events::CREATE_STREAM,
                vec![arg],
                timeout,
            )
        });
        self.finish_open(duplex, outcome)
    }

    /// Async variant of [`StreamMultiplexer::open_stream`].
    #[cfg(feature = "async")]
    pub async fn open_stream_async(&self, peer: &str) -> Result<Duplex> {
        let (duplex, request) = self.prepare(peer)?;
        let outcome = match request.to_arg() {
            Ok(arg) => {
                let core = self.inner.messaging.core();
                bridge::request_async(
                    core.link.as_ref(),
                    events::CREATE_STREAM,
                    vec![arg],
                    core.config.request_timeout,
                )
                .await
            }
            Err(err) => Err(err.into()),
        };
        self.finish_open(duplex, outcome)
    }

    /// Build the requesting end before asking, so chunks sent by an eager
    /// acceptor are never missed.
    fn prepare(&self, peer: &str) -> Result<(Duplex, StreamOpenRequest)> {
        let core = self.inner.messaging.core();
        core.check_target(peer)?;

        let local = Uuid::new_v4().to_string();
        let remote = Uuid::new_v4().to_string();
        let duplex = Duplex::open(
            self.inner.messaging.clone(),
            peer,
            local.clone(),
            remote.clone(),
        );
        let request = StreamOpenRequest {
            source_stream_id: local,
            target_stream_id: remote,
            source_client_id: Some(core.client_id.clone()),
            target_client_id: peer.to_string(),
        };
        Ok((duplex, request))
    }

    fn finish_open(&self, duplex: Duplex, outcome: Result<Vec<Arg>>) -> Result<Duplex> {
        match outcome {
            Ok(reply) => match decode_status_reply(&reply) {
                None => {
                    self.inner.track(&duplex);
                    debug!(
                        peer = %duplex.peer_id(),
                        stream = %duplex.local_stream_id(),
                        "stream opened"
                    );
                    Ok(duplex)
                }
                Some(reason) => {
                    duplex.shutdown(CloseReason::Declined);
                    Err(PeerError::StreamRejected(reason))
                }
            },
            Err(err) => {
                // The peer may still accept late; tell it to let go.
                duplex.shutdown(CloseReason::Local);
                Err(err)
            }
        }
    }

    /// Install the handler for incoming stream requests, replacing any
    /// previous one.
    pub fn on_stream_requested(
        &self,
        handler: impl Fn(Duplex) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) {
        self.install(Some(Arc::new(handler)));
    }

    /// Remove the handler. Incoming requests are rejected again.
    pub fn off_stream_requested(&self) {
        self.install(None);
    }

    /// Live streams.
    pub fn streams(&self) -> Vec<Duplex> {
        self.inner.lock().active.clone()
    }

    /// Live streams bound to `peer`.
    pub fn streams_for(&self, peer: &str) -> Vec<Duplex> {
        self.inner
            .lock()
            .active
            .iter()
            .filter(|duplex| duplex.peer_id() == peer)
            .cloned()
            .collect()
    }

    fn install(&self, handler: Option<StreamRequestHandler>) {
        let listener = request_listener(Arc::downgrade(&self.inner), handler);
        let link = &self.inner.messaging.core().link;
        let mut state = self.inner.lock();
        if let Some(previous) = state.request_listener.take() {
            link.off(events::CREATE_STREAM, previous);
        }
        state.request_listener = Some(link.on(events::CREATE_STREAM, listener));
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("client_id", &self.inner.messaging.client_id())
            .field("streams", &self.inner.lock().active.len())
            .finish()
    }
}

impl MultiplexerInner {
    fn lock(&self) -> MutexGuard<'_, MultiplexerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(self: &Arc<Self>, duplex: &Duplex) {
        self.lock().active.push(duplex.clone());

        let weak = Arc::downgrade(self);
        let stream = duplex.local_stream_id().to_string();
        duplex.on_destroy(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .active
                    .retain(|duplex| duplex.local_stream_id() != stream);
            }
        });
    }

    fn close_peer_streams(&self, peer: &str, departure: Departure) {
        let streams: Vec<Duplex> = self
            .lock()
            .active
            .iter()
            .filter(|duplex| duplex.peer_id() == peer)
            .cloned()
            .collect();
        let reason = match departure {
            Departure::Removed => CloseReason::Removed,
            Departure::Disconnected => CloseReason::PeerGone,
        };
        for duplex in streams {
            duplex.shutdown(reason);
        }
    }
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = state.request_listener.take() {
            self.messaging.core().link.off(events::CREATE_STREAM, id);
        }
        for duplex in std::mem::take(&mut state.active) {
            duplex.close();
        }
    }
}

fn request_listener(
    owner: Weak<MultiplexerInner>,
    handler: Option<StreamRequestHandler>,
) -> Listener {
    Arc::new(move |event: Event| {
        let (Some(inner), Some(handler)) = (owner.upgrade(), handler.as_ref()) else {
            debug!("rejecting stream request: no handler installed");
            event.acknowledge(status_reply(Err(NOT_LISTENING.to_string())));
            return;
        };

        let request = match StreamOpenRequest::from_args(&event.args) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "malformed stream request");
                event.acknowledge(status_reply(Err(err.to_string())));
                return;
            }
        };
        let Some(peer) = request
            .source_client_id
            .clone()
            .filter(|peer| !peer.is_empty())
        else {
            event.acknowledge(status_reply(Err(
                "stream request names no source client".to_string()
            )));
            return;
        };

        // Ids swap: the requester's source is our remote.
        let duplex = Duplex::open(
            inner.messaging.clone(),
            &peer,
            request.target_stream_id,
            request.source_stream_id,
        );
        match handler(duplex.clone()) {
            Ok(()) => {
                inner.track(&duplex);
                debug!(peer = %peer, stream = %duplex.local_stream_id(), "stream accepted");
                event.acknowledge(status_reply(Ok(())));
            }
            Err(reason) => {
                debug!(peer = %peer, %reason, "stream declined");
                duplex.shutdown(CloseReason::Declined);
                event.acknowledge(status_reply(Err(reason)));
            }
        }
    })
}
