use std::sync::Arc;

use relaypeer_transport::{Ack, Arg, Event, RelayLink};
use relaypeer_wire::{encode_envelope, events, is_reserved, Envelope};

use crate::config::SessionConfig;
use crate::error::{PeerError, Result};

const MAX_PEER_ID_LEN: usize = 128;

/// State shared by every component of one session.
pub(crate) struct Core {
    pub(crate) link: Arc<dyn RelayLink>,
    pub(crate) client_id: String,
    pub(crate) config: SessionConfig,
}

impl Core {
    pub(crate) fn new(
        link: Arc<dyn RelayLink>,
        client_id: String,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        validate_peer_id(&client_id)?;
        Ok(Arc::new(Self {
            link,
            client_id,
            config,
        }))
    }

    /// Validate a peer id for an outgoing request.
    pub(crate) fn check_target(&self, peer: &str) -> Result<()> {
        validate_peer_id(peer)?;
        if peer == self.client_id {
            return Err(PeerError::SelfTarget);
        }
        Ok(())
    }

    /// Send `event` to `peer` inside an envelope, sender id first.
    pub(crate) fn send_envelope(
        &self,
        peer: &str,
        event: &str,
        args: Vec<Arg>,
        ack: Option<Ack>,
    ) -> Result<()> {
        validate_event(event)?;
        validate_peer_id(peer)?;
        let envelope = Envelope::from_sender(&self.client_id, peer, event, args);
        let args = encode_envelope(envelope)?;
        match ack {
            Some(ack) => self.link.emit_with_ack(events::EMIT_ACKNOWLEDGE, args, ack)?,
            None => self.link.emit(events::EMIT, args)?,
        }
        Ok(())
    }
}

pub(crate) fn validate_peer_id(peer: &str) -> Result<()> {
    if peer.is_empty() || peer.len() > MAX_PEER_ID_LEN {
        return Err(PeerError::InvalidTarget);
    }
    Ok(())
}

pub(crate) fn validate_event(event: &str) -> Result<()> {
    if event.is_empty() {
        return Err(PeerError::InvalidEvent);
    }
    Ok(())
}

/// Event names an application may send to a peer: non-empty and outside
/// the wire contract.
pub(crate) fn validate_app_event(event: &str) -> Result<()> {
    validate_event(event)?;
    if is_reserved(event) {
        return Err(PeerError::InvalidEvent);
    }
    Ok(())
}

/// Sender id carried first in a direct-subscription event.
pub(crate) fn sender_of(event: &Event) -> Option<&str> {
    event.args.first().and_then(Arg::as_str)
}

/// Remove the sender id from a direct-subscription event.
pub(crate) fn strip_sender(mut event: Event) -> Event {
    if !event.args.is_empty() {
        event.args.remove(0);
    }
    event
}
