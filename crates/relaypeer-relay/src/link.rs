use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use relaypeer_transport::{
    Ack, Arg, Event, EventEmitter, Listener, ListenerId, RelayLink, Result, TransportError,
    DISCONNECT,
};
use tracing::{debug, trace};

use crate::relay::RelayShared;

/// Work item for a link's I/O thread.
pub(crate) enum Delivery {
    /// Raise `name` on local listeners. When nobody listens and the emitter
    /// asked for an ack, the relay answers with `unhandled`.
    Event {
        name: String,
        event: Event,
        unhandled: Option<Vec<Arg>>,
    },
    /// Run an acknowledgement callback registered by this link.
    Reply { ack: Ack, args: Vec<Arg> },
    /// Stop the I/O thread.
    Shutdown,
}

/// Relay-side view of one connected client.
pub(crate) struct LinkShared {
    pub(crate) client_id: String,
    emitter: EventEmitter,
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
    connected: AtomicBool,
}

impl LinkShared {
    /// Queue a delivery on this link's I/O thread. Returns false once the
    /// link is closed.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    pub(crate) fn deliver_event(&self, name: &str, args: Vec<Arg>, ack: Option<Ack>) -> bool {
        self.deliver(Delivery::Event {
            name: name.to_string(),
            event: Event { args, ack },
            unhandled: None,
        })
    }

    fn close(&self) {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Delivery::Event {
                name: DISCONNECT.to_string(),
                event: Event::new(Vec::new()),
                unhandled: None,
            });
            let _ = tx.send(Delivery::Shutdown);
        }
    }
}

/// Client end of an in-process relay connection.
///
/// Created by [`crate::MemoryRelay::connect`]. Dropping the last handle
/// disconnects the client.
pub struct MemoryLink {
    shared: Arc<LinkShared>,
    relay: Arc<RelayShared>,
}

impl MemoryLink {
    pub(crate) fn open(relay: Arc<RelayShared>, client_id: &str) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(LinkShared {
            client_id: client_id.to_string(),
            emitter: EventEmitter::new(),
            queue: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
        });

        let io_shared = shared.clone();
        thread::Builder::new()
            .name(format!("relay-io-{client_id}"))
            .spawn(move || run_delivery(io_shared, rx))
            .map_err(|err| TransportError::Connect {
                client_id: client_id.to_string(),
                reason: format!("failed to start I/O thread: {err}"),
            })?;

        if let Err(err) = relay.admit(shared.clone()) {
            shared.close();
            return Err(err);
        }
        debug!(client_id, "client connected to memory relay");

        Ok(Arc::new(Self { shared, relay }))
    }

    /// Client id this link was admitted under.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    fn reply_ack(&self, ack: Ack) -> Ack {
        let weak = Arc::downgrade(&self.shared);
        Ack::new(move |args| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(Delivery::Reply { ack, args });
            }
        })
    }
}

impl RelayLink for MemoryLink {
    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        trace!(client_id = %self.shared.client_id, event, "emit");
        self.relay.route(&self.shared.client_id, event, args, None);
        Ok(())
    }

    fn emit_with_ack(&self, event: &str, args: Vec<Arg>, ack: Ack) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        trace!(client_id = %self.shared.client_id, event, "emit with ack");
        let reply = self.reply_ack(ack);
        self.relay
            .route(&self.shared.client_id, event, args, Some(reply));
        Ok(())
    }

    fn on(&self, event: &str, listener: Listener) -> ListenerId {
        self.shared.emitter.on(event, listener)
    }

    fn once(&self, event: &str, listener: Listener) -> ListenerId {
        self.shared.emitter.once(event, listener)
    }

    fn off(&self, event: &str, id: ListenerId) {
        self.shared.emitter.off(event, id);
    }

    fn off_all(&self, event: &str) {
        self.shared.emitter.off_all(event);
    }

    fn listener_count(&self, event: &str) -> usize {
        self.shared.emitter.listener_count(event)
    }

    fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(client_id = %self.shared.client_id, "client disconnecting");
        self.relay.remove(&self.shared.client_id);
        self.shared.close();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("client_id", &self.shared.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn run_delivery(shared: Arc<LinkShared>, rx: mpsc::Receiver<Delivery>) {
    for delivery in rx {
        match delivery {
            Delivery::Event {
                name,
                event,
                unhandled,
            } => {
                let ack = event.ack.clone();
                let invoked = shared.emitter.dispatch(&name, event);
                if invoked == 0 {
                    if let (Some(reply), Some(ack)) = (unhandled, ack) {
                        trace!(client_id = %shared.client_id, event = %name, "no listener, relay answers");
                        ack.call(reply);
                    }
                }
            }
            Delivery::Reply { ack, args } => {
                ack.call(args);
            }
            Delivery::Shutdown => break,
        }
    }
    shared.emitter.clear();
    trace!(client_id = %shared.client_id, "I/O thread stopped");
}
