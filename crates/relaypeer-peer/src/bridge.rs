//! Blocking (and optionally async) request/response over acknowledged
//! relay events.
//!
//! The acknowledgement completes a channel from the link's I/O context; the
//! caller parks on the other end. Never call these from inside a relay
//! listener: the reply is delivered on the very context that would be
//! blocked.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use relaypeer_transport::{Ack, Arg, RelayLink, TransportError};
use tracing::trace;

use crate::error::{PeerError, Result};

/// Emit `event` and wait for its acknowledgement.
pub(crate) fn request(
    link: &dyn RelayLink,
    event: &str,
    args: Vec<Arg>,
    timeout: Option<Duration>,
) -> Result<Vec<Arg>> {
    if !link.is_connected() {
        return Err(TransportError::Disconnected.into());
    }

    let (tx, rx) = mpsc::sync_channel(1);
    link.emit_with_ack(
        event,
        args,
        Ack::new(move |reply| {
            let _ = tx.send(reply);
        }),
    )?;
    trace!(event, ?timeout, "waiting for acknowledgement");

    match timeout {
        Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PeerError::Timeout(timeout),
            RecvTimeoutError::Disconnected => unanswered(link),
        }),
        None => rx.recv().map_err(|_| unanswered(link)),
    }
}

/// Error for an acknowledgement that was dropped before it ran.
fn unanswered(link: &dyn RelayLink) -> PeerError {
    if link.is_connected() {
        PeerError::NoReply
    } else {
        TransportError::Disconnected.into()
    }
}

/// Async variant of [`request`].
#[cfg(feature = "async")]
pub(crate) async fn request_async(
    link: &dyn RelayLink,
    event: &str,
    args: Vec<Arg>,
    timeout: Option<Duration>,
) -> Result<Vec<Arg>> {
    if !link.is_connected() {
        return Err(TransportError::Disconnected.into());
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    link.emit_with_ack(
        event,
        args,
        Ack::new(move |reply| {
            let _ = tx.send(reply);
        }),
    )?;

    let reply = async { rx.await.map_err(|_| unanswered(link)) };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, reply)
            .await
            .map_err(|_| PeerError::Timeout(timeout))?,
        None => reply.await,
    }
}
