//! Encoding of outbound payloads and decoding of acknowledgements / server events.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::SessionError;
use crate::identity::FeederId;
use crate::protocol::{StartAck, StopAck, StreamStopped};

const DEFAULT_START_ERROR: &str = "Server returned error or path missing";
const DEFAULT_STOP_ERROR: &str = "Server returned error on stop";
const UNEXPECTED_FORMAT: &str = "Unexpected server response format";

/// Payload for `stream start` / `stream stop`.
pub fn feeder_request(feeder: &FeederId) -> Value {
    serde_json::json!({ "feeder_id": feeder.as_str() })
}

/// Decode the acknowledgement of `stream start` into the stream path.
pub fn decode_start_ack(args: &[Value]) -> Result<String, SessionError> {
    let ack: StartAck = decode_object(args)?;
    match ack {
        StartAck {
            success: true,
            path: Some(path),
            ..
        } => Ok(path),
        StartAck { error, .. } => Err(SessionError::Rejected(
            error.unwrap_or_else(|| DEFAULT_START_ERROR.to_string()),
        )),
    }
}

/// Decode the acknowledgement of `stream stop`.
pub fn decode_stop_ack(args: &[Value]) -> Result<(), SessionError> {
    let ack: StopAck = decode_object(args)?;
    if ack.success {
        Ok(())
    } else {
        Err(SessionError::Rejected(
            ack.error.unwrap_or_else(|| DEFAULT_STOP_ERROR.to_string()),
        ))
    }
}

/// Decode the feeder id of a server-pushed `stream stopped` event.
pub fn decode_stream_stopped(args: &[Value]) -> Option<FeederId> {
    let Some(first) = args.first().filter(|v| v.is_object()) else {
        warn!(?args, "incorrect data format in 'stream stopped' event");
        return None;
    };
    match serde_json::from_value::<StreamStopped>(first.clone()) {
        Ok(ev) => FeederId::new(ev.feeder_id).ok(),
        Err(e) => {
            warn!("'feeder_id' missing in 'stream stopped' event: {}", e);
            None
        }
    }
}

/// First positional argument must be a JSON object of the expected shape.
fn decode_object<T: DeserializeOwned>(args: &[Value]) -> Result<T, SessionError> {
    let Some(first) = args.first().filter(|v| v.is_object()) else {
        warn!(?args, "unexpected acknowledgement format");
        return Err(SessionError::Protocol(UNEXPECTED_FORMAT.to_string()));
    };
    debug!(ack = %first, "acknowledgement received");
    serde_json::from_value(first.clone())
        .map_err(|e| SessionError::Protocol(format!("Error processing response: {}", e)))
}
