use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::Result;

/// Name of the local event dispatched when the link to the relay goes down.
pub const DISCONNECT: &str = "disconnect";

/// One event argument.
///
/// Arguments are opaque to the link: structured values travel as JSON,
/// byte payloads as binary attachments.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Structured value.
    Json(serde_json::Value),
    /// Binary attachment.
    Binary(Bytes),
}

impl Arg {
    /// Build a JSON string argument.
    pub fn text(value: impl Into<String>) -> Self {
        Arg::Json(serde_json::Value::String(value.into()))
    }

    /// Borrow the argument as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Read the argument as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Json(serde_json::Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the argument as JSON, if it is structured.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Arg::Json(value) => Some(value),
            Arg::Binary(_) => None,
        }
    }

    /// Borrow the argument as bytes, if it is a binary attachment.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Arg::Binary(bytes) => Some(bytes),
            Arg::Json(_) => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::text(value)
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::text(value)
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Json(serde_json::Value::Bool(value))
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Json(value)
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg::Binary(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Binary(Bytes::from(value))
    }
}

type AckFn = Box<dyn FnOnce(Vec<Arg>) + Send>;

/// Single-shot acknowledgement callback.
///
/// Clones share the same callback; only the first [`Ack::call`] runs it.
#[derive(Clone)]
pub struct Ack {
    inner: Arc<Mutex<Option<AckFn>>>,
}

impl Ack {
    /// Wrap a callback.
    pub fn new(callback: impl FnOnce(Vec<Arg>) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Invoke the callback. Returns `false` if it already ran.
    pub fn call(&self, args: Vec<Arg>) -> bool {
        let callback = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                callback(args);
                true
            }
            None => false,
        }
    }

    /// Whether the callback has not run yet.
    pub fn is_pending(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// An event delivered to a listener.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event arguments, in emit order.
    pub args: Vec<Arg>,
    /// Acknowledgement requested by the emitter, if any.
    pub ack: Option<Ack>,
}

impl Event {
    /// Create an event without acknowledgement.
    pub fn new(args: Vec<Arg>) -> Self {
        Self { args, ack: None }
    }

    /// Create an event carrying an acknowledgement.
    pub fn with_ack(args: Vec<Arg>, ack: Ack) -> Self {
        Self {
            args,
            ack: Some(ack),
        }
    }

    /// Acknowledge the event if the emitter asked for it.
    pub fn acknowledge(&self, args: Vec<Arg>) {
        if let Some(ack) = &self.ack {
            ack.call(args);
        }
    }
}

/// Event listener.
pub type Listener = Arc<dyn Fn(Event) + Send + Sync>;

/// Handle identifying one registered listener, used for selective removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A persistent connection to the relay.
///
/// Implementations deliver every event and acknowledgement callback on a
/// single I/O context per link. Listeners and acknowledgement callbacks must
/// not block waiting on another relay round-trip.
pub trait RelayLink: Send + Sync {
    /// Fire-and-forget send.
    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<()>;

    /// Send and request a single acknowledgement from the receiver.
    fn emit_with_ack(&self, event: &str, args: Vec<Arg>, ack: Ack) -> Result<()>;

    /// Register a listener for every occurrence of `event`.
    fn on(&self, event: &str, listener: Listener) -> ListenerId;

    /// Register a listener for the next occurrence of `event` only.
    fn once(&self, event: &str, listener: Listener) -> ListenerId;

    /// Remove one listener.
    fn off(&self, event: &str, id: ListenerId);

    /// Remove every listener of `event`.
    fn off_all(&self, event: &str);

    /// Number of listeners currently registered for `event`.
    fn listener_count(&self, event: &str) -> usize;

    /// Close the link. Local [`DISCONNECT`] listeners are notified.
    fn disconnect(&self);

    /// Whether the link is currently connected.
    fn is_connected(&self) -> bool;
}
