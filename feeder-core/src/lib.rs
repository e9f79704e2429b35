//! Smart feeder session core.
//! Host-driven: no I/O; host passes operations and transport events and receives actions.

pub mod address;
pub mod identity;
pub mod protocol;
pub mod wire;

pub use address::{AddressError, ServerAddress, DEFAULT_STREAM_PORT};
pub use identity::{parse_client_id, ClientId, FeederId, HandshakeAuth, IdError};
pub use protocol::{EVENT_ASSIGN_ID, EVENT_STREAM_START, EVENT_STREAM_STOP, EVENT_STREAM_STOPPED};
pub use crate::core::{
    Action, ConnectionState, Generation, Report, SessionCore, SessionError, Ticket, TransportEvent,
};

pub mod core;
