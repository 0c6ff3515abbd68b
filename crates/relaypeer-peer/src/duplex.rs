use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use bytes::Bytes;
use relaypeer_transport::{Ack, Arg, Event, ListenerId, DISCONNECT};
use relaypeer_wire::{chunk_event, events};
use tracing::{debug, trace, warn};

use crate::error::{PeerError, Result};
use crate::messaging::{AddressedMessaging, SubscriptionId};
use crate::shared::sender_of;

/// Handle for one output sink attached to a [`Duplex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

type Sink = Box<dyn Write + Send>;
type DestroyCallback = Box<dyn FnOnce() + Send>;

/// What closed a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Local,
    PeerClosed,
    PeerGone,
    LinkDown,
    Removed,
    Declined,
    Dropped,
}

impl CloseReason {
    fn notifies_peer(self) -> bool {
        matches!(self, Self::Local | Self::Removed | Self::Dropped)
    }
}

enum Hook {
    Scoped { event: String, id: SubscriptionId },
    Link { event: &'static str, id: ListenerId },
}

#[derive(Default)]
struct SinkState {
    sinks: Vec<(SinkId, Sink)>,
    next_id: u64,
}

#[derive(Default)]
struct PumpState {
    cancelled: bool,
    acked: bool,
    abandoned: bool,
}

/// Coordination between one pump thread and the link's I/O context.
#[derive(Default)]
struct PumpControl {
    state: Mutex<PumpState>,
    wake: Condvar,
}

impl PumpControl {
    fn lock(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        self.lock().cancelled = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    fn arm(&self) {
        self.lock().acked = false;
    }

    fn acknowledge(&self) {
        self.lock().acked = true;
        self.wake.notify_all();
    }

    fn abandon(&self) {
        self.lock().abandoned = true;
        self.wake.notify_all();
    }

    /// Block until the in-flight chunk is acknowledged. Returns false if the
    /// pump was cancelled or the acknowledgement can never arrive.
    /// Cancellation wins over a simultaneous acknowledgement.
    fn wait_for_ack(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.cancelled || state.abandoned {
                return false;
            }
            if state.acked {
                return true;
            }
            state = self
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Completes the pump's wait exactly once: acknowledged when fired,
/// abandoned when dropped unfired.
struct AckGuard {
    control: Option<Arc<PumpControl>>,
}

impl AckGuard {
    fn fire(mut self) {
        if let Some(control) = self.control.take() {
            control.acknowledge();
        }
    }
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.abandon();
        }
    }
}

struct DuplexInner {
    messaging: AddressedMessaging,
    peer_id: String,
    local_stream_id: String,
    remote_stream_id: String,
    chunk_size: usize,
    destroyed: AtomicBool,
    sinks: Mutex<SinkState>,
    pump: Mutex<Option<Arc<PumpControl>>>,
    hooks: Mutex<Vec<Hook>>,
    on_destroy: Mutex<Vec<DestroyCallback>>,
}

/// A chunked, flow-controlled byte stream shared with one peer.
///
/// Data read from the input source travels one chunk at a time: the next
/// chunk is read only after the peer acknowledged the previous one. Every
/// received chunk is written to all attached sinks, in attach order, then
/// acknowledged. A chunk that arrives while no sink is attached is
/// acknowledged and dropped.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct Duplex {
    inner: Arc<DuplexInner>,
}

impl Duplex {
    /// Build a stream and subscribe its listeners.
    pub(crate) fn open(
        messaging: AddressedMessaging,
        peer_id: &str,
        local_stream_id: String,
        remote_stream_id: String,
    ) -> Self {
        let chunk_size = messaging.core().config.effective_chunk_size();
        let link = messaging.core().link.clone();
        let inner = Arc::new(DuplexInner {
            messaging,
            peer_id: peer_id.to_string(),
            local_stream_id,
            remote_stream_id,
            chunk_size,
            destroyed: AtomicBool::new(false),
            sinks: Mutex::new(SinkState::default()),
            pump: Mutex::new(None),
            hooks: Mutex::new(Vec::new()),
            on_destroy: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let chunk = chunk_event(&inner.remote_stream_id);
        let chunk_id = inner.messaging.on(peer_id, &chunk, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(event);
            }
        });

        let weak = Arc::downgrade(&inner);
        let closed_id = inner
            .messaging
            .on(peer_id, events::PEER_STREAM_DESTROYED, move |event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if event.args.first().and_then(Arg::as_str) == Some(inner.remote_stream_id.as_str())
                {
                    inner.destroy(CloseReason::PeerClosed);
                }
            });

        let weak = Arc::downgrade(&inner);
        let gone_id = link.on(
            events::TARGET_DISCONNECT,
            Arc::new(move |event: Event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if sender_of(&event) == Some(inner.peer_id.as_str()) {
                    inner.destroy(CloseReason::PeerGone);
                }
            }),
        );

        let weak = Arc::downgrade(&inner);
        let down_id = link.on(
            DISCONNECT,
            Arc::new(move |_event: Event| {
                if let Some(inner) = weak.upgrade() {
                    inner.destroy(CloseReason::LinkDown);
                }
            }),
        );

        *inner.lock_hooks() = vec![
            Hook::Scoped {
                event: chunk,
                id: chunk_id,
            },
            Hook::Scoped {
                event: events::PEER_STREAM_DESTROYED.to_string(),
                id: closed_id,
            },
            Hook::Link {
                event: events::TARGET_DISCONNECT,
                id: gone_id,
            },
            Hook::Link {
                event: DISCONNECT,
                id: down_id,
            },
        ];

        trace!(
            peer = %inner.peer_id,
            local = %inner.local_stream_id,
            remote = %inner.remote_stream_id,
            "stream opened"
        );
        Self { inner }
    }

    /// Peer this stream is bound to.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Id of this end of the stream.
    pub fn local_stream_id(&self) -> &str {
        &self.inner.local_stream_id
    }

    /// Id of the peer's end of the stream.
    pub fn remote_stream_id(&self) -> &str {
        &self.inner.remote_stream_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Attach a sink for incoming chunks. It sees chunks received from now
    /// on.
    pub fn attach_output(&self, sink: impl Write + Send + 'static) -> SinkId {
        let id = {
            let mut state = self.inner.lock_sinks();
            state.next_id += 1;
            let id = SinkId(state.next_id);
            state.sinks.push((id, Box::new(sink)));
            id
        };
        if self.is_destroyed() {
            // Raced with close: the sink missed the release sweep.
            self.inner.release_outputs();
        }
        id
    }

    /// Detach one sink, flushing it. Returns false for unknown ids.
    pub fn detach_output(&self, id: SinkId) -> bool {
        let sink = {
            let mut state = self.inner.lock_sinks();
            let Some(index) = state.sinks.iter().position(|(sink_id, _)| *sink_id == id) else {
                return false;
            };
            state.sinks.remove(index).1
        };
        flush_sink(sink, &self.inner.local_stream_id);
        true
    }

    /// Detach and flush every sink.
    pub fn clear_outputs(&self) {
        let sinks = std::mem::take(&mut self.inner.lock_sinks().sinks);
        for (_, sink) in sinks {
            flush_sink(sink, &self.inner.local_stream_id);
        }
    }

    /// Number of attached sinks.
    pub fn output_count(&self) -> usize {
        self.inner.lock_sinks().sinks.len()
    }

    /// Start pumping `source` to the peer on a dedicated thread, replacing
    /// any previous source.
    ///
    /// End of input stops the pump quietly. A read error stops the pump and
    /// is logged; the stream stays open.
    pub fn set_input(&self, source: impl Read + Send + 'static) -> Result<()> {
        if self.is_destroyed() {
            return Err(PeerError::StreamClosed);
        }

        let control = Arc::new(PumpControl::default());
        if let Some(previous) = self.inner.lock_pump().replace(control.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        let chunk_size = self.inner.chunk_size;
        let spawned = thread::Builder::new()
            .name(format!("relaypeer-pump-{}", short_id(&self.inner.local_stream_id)))
            .spawn({
                let control = control.clone();
                move || run_pump(weak, control, source, chunk_size)
            });
        if let Err(err) = spawned {
            self.inner.lock_pump().take();
            return Err(err.into());
        }
        if self.is_destroyed() {
            control.cancel();
        }
        Ok(())
    }

    /// Stop reading the input source. A chunk already in flight still
    /// reaches the peer.
    pub fn remove_input(&self) {
        if let Some(control) = self.inner.lock_pump().take() {
            control.cancel();
        }
    }

    /// Whether an input pump is installed.
    pub fn has_input(&self) -> bool {
        self.inner.lock_pump().is_some()
    }

    /// Close the stream. Only the first call has an effect: the peer is
    /// notified, listeners are removed, the pump stops, sinks are flushed
    /// and released, and destroy callbacks run.
    pub fn close(&self) {
        self.inner.destroy(CloseReason::Local);
    }

    /// Run `callback` once when the stream is destroyed; immediately if it
    /// already is.
    pub fn on_destroy(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut callbacks = self.inner.lock_callbacks();
            if !self.is_destroyed() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    pub(crate) fn shutdown(&self, reason: CloseReason) {
        self.inner.destroy(reason);
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("peer_id", &self.inner.peer_id)
            .field("local_stream_id", &self.inner.local_stream_id)
            .field("remote_stream_id", &self.inner.remote_stream_id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl DuplexInner {
    fn lock_sinks(&self) -> MutexGuard<'_, SinkState> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<Arc<PumpControl>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hooks(&self) -> MutexGuard<'_, Vec<Hook>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, Vec<DestroyCallback>> {
        self.on_destroy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(&self, event: Event) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let data = match event.args.first() {
            Some(Arg::Binary(bytes)) => bytes.clone(),
            Some(Arg::Json(serde_json::Value::String(text))) => Bytes::from(text.clone()),
            _ => {
                warn!(stream = %self.local_stream_id, "dropping malformed chunk");
                event.acknowledge(Vec::new());
                return;
            }
        };

        {
            let mut state = self.lock_sinks();
            if state.sinks.is_empty() {
                trace!(stream = %self.local_stream_id, len = data.len(), "no sink attached, dropping chunk");
            }
            write_all_sinks(&mut state.sinks, &data, &self.local_stream_id);
        }
        event.acknowledge(Vec::new());
    }

    fn release_outputs(&self) {
        let sinks = std::mem::take(&mut self.lock_sinks().sinks);
        for (_, sink) in sinks {
            flush_sink(sink, &self.local_stream_id);
        }
    }

    fn destroy(&self, reason: CloseReason) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(
            peer = %self.peer_id,
            stream = %self.local_stream_id,
            ?reason,
            "stream closed"
        );

        if reason.notifies_peer() {
            if let Err(err) = self.messaging.core().send_envelope(
                &self.peer_id,
                events::PEER_STREAM_DESTROYED,
                vec![Arg::text(self.local_stream_id.as_str())],
                None,
            ) {
                debug!(stream = %self.local_stream_id, error = %err, "close notice not sent");
            }
        }

        let hooks = std::mem::take(&mut *self.lock_hooks());
        let link = &self.messaging.core().link;
        for hook in hooks {
            match hook {
                Hook::Scoped { event, id } => self.messaging.off(&self.peer_id, &event, Some(id)),
                Hook::Link { event, id } => link.off(event, id),
            }
        }

        if let Some(control) = self.lock_pump().take() {
            control.cancel();
        }
        self.release_outputs();

        let callbacks = std::mem::take(&mut *self.lock_callbacks());
        for callback in callbacks {
            callback();
        }
    }
}

impl Drop for DuplexInner {
    fn drop(&mut self) {
        self.destroy(CloseReason::Dropped);
    }
}

fn run_pump(
    owner: Weak<DuplexInner>,
    control: Arc<PumpControl>,
    mut source: impl Read,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut chunks = 0u64;

    loop {
        if control.is_cancelled() {
            break;
        }
        let len = match source.read(&mut buf) {
            Ok(0) => {
                trace!(chunks, "stream input exhausted");
                break;
            }
            Ok(len) => len,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, chunks, "stream input read failed");
                break;
            }
        };
        if control.is_cancelled() {
            break;
        }
        let Some(inner) = owner.upgrade() else {
            break;
        };

        control.arm();
        let guard = AckGuard {
            control: Some(control.clone()),
        };
        let sent = inner.messaging.core().send_envelope(
            &inner.peer_id,
            &chunk_event(&inner.local_stream_id),
            vec![Arg::Binary(Bytes::copy_from_slice(&buf[..len]))],
            Some(Ack::new(move |_| guard.fire())),
        );
        let stream = inner.local_stream_id.clone();
        drop(inner);

        if let Err(err) = sent {
            warn!(stream = %stream, error = %err, "chunk send failed");
            break;
        }
        chunks += 1;
        if !control.wait_for_ack() {
            trace!(stream = %stream, chunks, "pump stopped while waiting for ack");
            break;
        }
    }
}

fn write_all_sinks(sinks: &mut [(SinkId, Sink)], data: &[u8], stream: &str) {
    for (id, sink) in sinks.iter_mut() {
        if let Err(err) = sink.write_all(data).and_then(|()| sink.flush()) {
            warn!(stream, sink = id.0, error = %err, "sink write failed, skipping");
        }
    }
}

fn flush_sink(mut sink: Sink, stream: &str) {
    if let Err(err) = sink.flush() {
        debug!(stream, error = %err, "sink flush failed on release");
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use relaypeer_relay::MemoryRelay;

    use super::*;
    use crate::config::SessionConfig;
    use crate::shared::Core;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().expect("buffer lock should not be poisoned").clone()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .expect("buffer lock should not be poisoned")
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct CountingReader {
        inner: io::Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(buf)
        }
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("source is broken"))
        }
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("sink is broken"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn messaging(relay: &MemoryRelay, id: &str, chunk_size: usize) -> AddressedMessaging {
        let link = relay.connect(id).expect("client should connect");
        let config = SessionConfig::default().with_chunk_size(chunk_size);
        let core = Core::new(link, id.to_string(), config).expect("client id should be valid");
        AddressedMessaging::new(core)
    }

    fn pair(chunk_size: usize) -> (MemoryRelay, Duplex, Duplex) {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A", chunk_size);
        let b = messaging(&relay, "B", chunk_size);
        let left = Duplex::open(a, "B", "a-side".to_string(), "b-side".to_string());
        let right = Duplex::open(b, "A", "b-side".to_string(), "a-side".to_string());
        (relay, left, right)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn payload_spanning_many_chunks_arrives_in_order() {
        let (_relay, left, right) = pair(7);
        let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        let sink = SharedBuffer::default();
        right.attach_output(sink.clone());

        left.set_input(io::Cursor::new(payload.clone()))
            .expect("pump should start");

        assert!(wait_until(|| sink.contents().len() == payload.len()));
        assert_eq!(sink.contents(), payload);
    }

    #[test]
    fn chunks_without_a_sink_are_acknowledged() {
        let (_relay, left, right) = pair(4);
        let reads = Arc::new(AtomicUsize::new(0));
        left.set_input(CountingReader {
            inner: io::Cursor::new(b"sixteen bytes!!!".to_vec()),
            reads: reads.clone(),
        })
        .expect("pump should start");

        // Four chunks plus the end-of-input read.
        assert!(wait_until(|| reads.load(Ordering::SeqCst) == 5));
        assert_eq!(right.output_count(), 0);

        let sink = SharedBuffer::default();
        right.attach_output(sink.clone());
        left.set_input(io::Cursor::new(b"later".to_vec()))
            .expect("pump should start");
        assert!(wait_until(|| sink.contents() == b"later"));
    }

    #[test]
    fn input_read_error_keeps_stream_open() {
        let (_relay, left, right) = pair(16);
        let sink = SharedBuffer::default();
        left.attach_output(sink.clone());

        left.set_input(BrokenReader).expect("pump should start");
        thread::sleep(Duration::from_millis(50));
        assert!(!left.is_destroyed());
        assert!(!right.is_destroyed());

        right
            .set_input(io::Cursor::new(b"still flowing".to_vec()))
            .expect("pump should start");
        assert!(wait_until(|| sink.contents() == b"still flowing"));
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let (_relay, left, right) = pair(1024);
        right.attach_output(FailingSink);
        let sink = SharedBuffer::default();
        right.attach_output(sink.clone());
        assert_eq!(right.output_count(), 2);

        left.set_input(io::Cursor::new(b"resilient".to_vec()))
            .expect("pump should start");
        assert!(wait_until(|| sink.contents() == b"resilient"));
        assert!(!right.is_destroyed());
    }

    #[test]
    fn detach_output_stops_delivery_to_that_sink() {
        let (_relay, _left, right) = pair(16);
        let first = right.attach_output(SharedBuffer::default());
        let _second = right.attach_output(SharedBuffer::default());

        assert!(right.detach_output(first));
        assert!(!right.detach_output(first));
        assert_eq!(right.output_count(), 1);
        right.clear_outputs();
        assert_eq!(right.output_count(), 0);
    }

    #[test]
    fn close_is_idempotent_and_callbacks_fire_once() {
        let (_relay, left, right) = pair(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        left.on_destroy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        left.close();
        left.close();
        assert!(left.is_destroyed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Registered after destruction: runs immediately.
        let counter = calls.clone();
        left.on_destroy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(wait_until(|| right.is_destroyed()));
        assert!(matches!(
            left.set_input(io::empty()),
            Err(PeerError::StreamClosed)
        ));
    }

    #[test]
    fn close_removes_stream_listeners() {
        let (_relay, left, _right) = pair(16);
        let link = left.inner.messaging.core().link.clone();
        assert_eq!(link.listener_count(&chunk_event("b-side")), 1);
        left.close();
        assert_eq!(link.listener_count(&chunk_event("b-side")), 0);
        assert_eq!(left.inner.messaging.subscription_count("B"), 0);
    }

    #[test]
    fn remove_input_stops_pump() {
        let (_relay, left, right) = pair(64);
        let sink = SharedBuffer::default();
        right.attach_output(sink.clone());

        left.set_input(io::repeat(7)).expect("pump should start");
        assert!(wait_until(|| sink.contents().len() >= 1024));
        left.remove_input();
        assert!(!left.has_input());

        thread::sleep(Duration::from_millis(100));
        let settled = sink.contents().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.contents().len(), settled);
        assert!(!left.is_destroyed());
    }

    #[test]
    fn pump_blocked_on_ack_is_cancelled_by_close() {
        let relay = MemoryRelay::new();
        let a = messaging(&relay, "A", 8);
        let b = messaging(&relay, "B", 8);
        // B keeps the first chunk's ack and never fires it.
        let held = Arc::new(Mutex::new(Vec::new()));
        let keep = held.clone();
        b.core().link.on(
            &chunk_event("a-side"),
            Arc::new(move |event: Event| {
                keep.lock()
                    .expect("held lock should not be poisoned")
                    .push(event);
            }),
        );
        let left = Duplex::open(a, "B", "a-side".to_string(), "b-side".to_string());
        left.set_input(io::repeat(1)).expect("pump should start");
        assert!(wait_until(|| {
            held.lock().expect("held lock should not be poisoned").len() == 1
        }));

        let control = left
            .inner
            .lock_pump()
            .clone()
            .expect("pump should be installed");
        left.close();
        assert!(control.is_cancelled());
        assert!(!control.wait_for_ack());
    }
}
