use relaypeer_transport::Arg;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireError};

/// Stream-open request payload.
///
/// The requester fills both stream ids; the relay fills `source_client_id`
/// before forwarding to the target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenRequest {
    /// Id of the requester's stream.
    pub source_stream_id: String,
    /// Id the acceptor's stream will use.
    pub target_stream_id: String,
    /// Requesting client, stamped by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_client_id: Option<String>,
    /// Client asked to accept the stream.
    pub target_client_id: String,
}

impl StreamOpenRequest {
    /// Encode as a single event argument.
    pub fn to_arg(&self) -> Result<Arg> {
        Ok(Arg::Json(serde_json::to_value(self)?))
    }

    /// Decode from the first event argument.
    pub fn from_args(args: &[Arg]) -> Result<Self> {
        let value = args
            .first()
            .ok_or(WireError::MissingArg {
                index: 0,
                expected: "stream-open request",
            })?
            .as_json()
            .ok_or(WireError::UnexpectedArg {
                index: 0,
                expected: "a JSON stream-open request",
            })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Acknowledgement args for add-target and stream-open replies.
///
/// Success carries no argument; failure carries the reason.
pub fn status_reply(outcome: std::result::Result<(), String>) -> Vec<Arg> {
    match outcome {
        Ok(()) => Vec::new(),
        Err(reason) => vec![Arg::text(reason)],
    }
}

/// Read an add-target or stream-open reply. `None` means success.
pub fn decode_status_reply(args: &[Arg]) -> Option<String> {
    let first = args.first()?;
    Some(match first {
        Arg::Json(serde_json::Value::String(reason)) => reason.clone(),
        Arg::Json(serde_json::Value::Null) => return None,
        Arg::Json(other) => other.to_string(),
        Arg::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    })
}

/// Read an exclusive-mode register reply.
pub fn decode_register_reply(args: &[Arg]) -> Result<bool> {
    args.first()
        .ok_or(WireError::MissingArg {
            index: 0,
            expected: "register verdict",
        })?
        .as_bool()
        .ok_or(WireError::UnexpectedArg {
            index: 0,
            expected: "a boolean register verdict",
        })
}

/// Read a list-clients reply.
pub fn decode_client_list(args: &[Arg]) -> Result<Vec<String>> {
    let value = args
        .first()
        .ok_or(WireError::MissingArg {
            index: 0,
            expected: "client list",
        })?
        .as_json()
        .ok_or(WireError::UnexpectedArg {
            index: 0,
            expected: "a JSON client list",
        })?;
    Ok(serde_json::from_value(value.clone())?)
}
