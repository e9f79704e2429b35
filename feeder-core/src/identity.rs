//! Client and feeder identities, handshake auth, and client-id extraction from `assign id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::protocol::EVENT_ASSIGN_ID;

/// Server-assigned client identity. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> Self {
        id.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque feeder identifier. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeederId(String);

impl FeederId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeederId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("identifier must not be empty")]
    Empty,
}

/// Handshake auth sent when a transport connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAuth {
    /// Anonymous: ask the server to assign an id.
    Identity,
    /// Authenticated with a previously assigned id.
    Session(ClientId),
}

impl HandshakeAuth {
    pub fn to_value(&self) -> Value {
        match self {
            HandshakeAuth::Identity => json!({ "type": "client", "need id": "true" }),
            HandshakeAuth::Session(id) => json!({ "type": "client", "id": id.as_str() }),
        }
    }
}

/// Extract the client id from the arguments of an `assign id` event.
///
/// Rules, first match wins:
/// 1. second argument is an object with an `id` string;
/// 2. first argument is an object with an `id` string;
/// 3. first argument is a plain string other than the event name
///    (some transports echo the event name as the first argument).
pub fn parse_client_id(args: &[Value]) -> Option<ClientId> {
    debug!(?args, "parsing client id");
    let object_id = |v: &Value| {
        v.as_object()
            .and_then(|o| o.get("id"))
            .and_then(Value::as_str)
            .and_then(|s| ClientId::new(s).ok())
    };
    if let Some(id) = args.get(1).and_then(object_id) {
        return Some(id);
    }
    if let Some(id) = args.first().and_then(object_id) {
        return Some(id);
    }
    if let Some(s) = args.first().and_then(Value::as_str) {
        if s == EVENT_ASSIGN_ID {
            warn!("'assign id' echoed as payload, ignoring");
        } else if let Ok(id) = ClientId::new(s) {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_from_second_argument() {
        let args = vec![json!("assign id"), json!({ "id": "Z" })];
        assert_eq!(parse_client_id(&args).unwrap().as_str(), "Z");
    }

    #[test]
    fn id_from_first_object() {
        let args = vec![json!({ "id": "Y" })];
        assert_eq!(parse_client_id(&args).unwrap().as_str(), "Y");
    }

    #[test]
    fn echoed_event_name_is_not_an_id() {
        assert!(parse_client_id(&[json!("assign id")]).is_none());
    }

    #[test]
    fn plain_string_is_an_id() {
        assert_eq!(parse_client_id(&[json!("abc-1")]).unwrap().as_str(), "abc-1");
    }

    #[test]
    fn second_argument_wins_over_first() {
        let args = vec![json!({ "id": "first" }), json!({ "id": "second" })];
        assert_eq!(parse_client_id(&args).unwrap().as_str(), "second");
    }

    #[test]
    fn falls_through_when_second_object_lacks_id() {
        let args = vec![json!({ "id": "first" }), json!({ "other": 1 })];
        assert_eq!(parse_client_id(&args).unwrap().as_str(), "first");
    }

    #[test]
    fn nothing_usable() {
        assert!(parse_client_id(&[]).is_none());
        assert!(parse_client_id(&[json!(42)]).is_none());
        assert!(parse_client_id(&[json!({ "id": "" })]).is_none());
    }

    #[test]
    fn handshake_auth_values() {
        assert_eq!(
            HandshakeAuth::Identity.to_value(),
            json!({ "type": "client", "need id": "true" })
        );
        let id = ClientId::new("c-1").unwrap();
        assert_eq!(
            HandshakeAuth::Session(id).to_value(),
            json!({ "type": "client", "id": "c-1" })
        );
    }

    #[test]
    fn empty_ids_rejected() {
        assert_eq!(ClientId::new("  "), Err(IdError::Empty));
        assert_eq!(FeederId::new(""), Err(IdError::Empty));
    }
}
