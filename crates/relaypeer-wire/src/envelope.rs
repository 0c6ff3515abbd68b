use relaypeer_transport::Arg;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};

/// Addressing metadata of a unicast event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    /// Client the relay should deliver to.
    pub target_client_id: String,
    /// Event name raised on the target.
    pub event: String,
}

/// A unicast event addressed to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Client the relay should deliver to.
    pub target_client_id: String,
    /// Event name raised on the target.
    pub event: String,
    /// Arguments delivered to the target's listeners. By convention the
    /// sender id comes first.
    pub args: Vec<Arg>,
}

impl Envelope {
    /// Build an envelope from `sender`, prepending the sender id to `args`.
    pub fn from_sender(
        sender: &str,
        target_client_id: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Arg>,
    ) -> Self {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Arg::text(sender));
        all.extend(args);
        Self {
            target_client_id: target_client_id.into(),
            event: event.into(),
            args: all,
        }
    }

    /// Sender id carried in the first argument, if present.
    pub fn sender(&self) -> Option<&str> {
        self.args.first().and_then(Arg::as_str)
    }
}

/// Encode an envelope into relay event arguments.
///
/// Layout:
/// ```text
/// [ {"targetClientId": .., "event": ..}, arg0, arg1, ... ]
/// ```
pub fn encode_envelope(envelope: Envelope) -> Result<Vec<Arg>> {
    if envelope.event.is_empty() {
        return Err(WireError::EmptyEvent);
    }
    let header = EnvelopeHeader {
        target_client_id: envelope.target_client_id,
        event: envelope.event,
    };
    let mut out = Vec::with_capacity(envelope.args.len() + 1);
    out.push(Arg::Json(serde_json::to_value(header)?));
    out.extend(envelope.args);
    Ok(out)
}

/// Decode relay event arguments back into an envelope.
pub fn decode_envelope(mut args: Vec<Arg>) -> Result<Envelope> {
    if args.is_empty() {
        return Err(WireError::MissingArg {
            index: 0,
            expected: "envelope header",
        });
    }
    let rest = args.split_off(1);
    let header = match args.pop() {
        Some(Arg::Json(value)) => serde_json::from_value::<EnvelopeHeader>(value)?,
        _ => {
            return Err(WireError::UnexpectedArg {
                index: 0,
                expected: "a JSON envelope header",
            })
        }
    };
    if header.event.is_empty() {
        return Err(WireError::EmptyEvent);
    }
    Ok(Envelope {
        target_client_id: header.target_client_id,
        event: header.event,
        args: rest,
    })
}
