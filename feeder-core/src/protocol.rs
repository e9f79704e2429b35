//! Feeder server real-time protocol: event names and payload shapes.

use serde::{Deserialize, Serialize};

/// Server -> client: identity assignment during the identity phase.
pub const EVENT_ASSIGN_ID: &str = "assign id";
/// Client -> server: start a stream; acknowledged with [`StartAck`].
pub const EVENT_STREAM_START: &str = "stream start";
/// Client -> server: stop a stream; acknowledged with [`StopAck`].
pub const EVENT_STREAM_STOP: &str = "stream stop";
/// Server -> client: the server terminated a stream on its own.
pub const EVENT_STREAM_STOPPED: &str = "stream stopped";

/// Named server events a transport must forward to the core.
pub const SERVER_EVENTS: &[&str] = &[EVENT_ASSIGN_ID, EVENT_STREAM_STOPPED];

/// Payload of `stream start` / `stream stop`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeederRequest {
    pub feeder_id: String,
}

/// Acknowledgement of `stream start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Acknowledgement of `stream stop`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopAck {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Payload of the server-pushed `stream stopped` event.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamStopped {
    pub feeder_id: String,
}
