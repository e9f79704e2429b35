//! Host-driven API: SessionCore receives operations and transport events from the host, returns actions.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::address::{AddressError, ServerAddress};
use crate::identity::{self, ClientId, FeederId, HandshakeAuth};
use crate::protocol::{EVENT_ASSIGN_ID, EVENT_STREAM_START, EVENT_STREAM_STOP, EVENT_STREAM_STOPPED};
use crate::wire;

/// Attempt generation. Incremented for every transport the core opens.
pub type Generation = u64;

/// Host-allocated handle routing a [`Report`] back to whoever started the attempt or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectingForId,
    ConnectingWithId,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Identity,
    Session,
}

/// The single transport the core currently considers current.
#[derive(Debug)]
struct ActiveTransport {
    generation: Generation,
    phase: Phase,
    address: ServerAddress,
    /// Transport reported `Connected`.
    live: bool,
    /// User asked to disconnect; waiting for the transport to confirm.
    closing: bool,
    /// Attempt still waiting for an outcome.
    attempt: Option<Ticket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Start,
    Stop,
}

#[derive(Debug)]
struct PendingRequest {
    generation: Generation,
    kind: RequestKind,
}

/// Connection/session state machine. Host passes operations and events; core returns actions.
#[derive(Debug, Default)]
pub struct SessionCore {
    state: ConnectionState,
    generation: Generation,
    transport: Option<ActiveTransport>,
    client_id: Option<ClientId>,
    force_stopped: Option<FeederId>,
    pending: HashMap<Ticket, PendingRequest>,
}

impl SessionCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    /// Feeder the server stopped on its own; holds until [`Self::clear_force_stop`].
    pub fn force_stopped_feeder(&self) -> Option<&FeederId> {
        self.force_stopped.as_ref()
    }

    /// Generation of the current transport, if any.
    pub fn current_generation(&self) -> Option<Generation> {
        self.transport.as_ref().map(|t| t.generation)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.live) && self.state == ConnectionState::Connected
    }

    /// Start the identity phase: anonymous transport that waits for `assign id`.
    /// On success the core chains into the session phase under the same ticket.
    pub fn acquire_identity(&mut self, address: &str, ticket: Ticket) -> Vec<Action> {
        let mut actions = Vec::new();
        self.retire_transport(&mut actions);
        self.set_state(ConnectionState::ConnectingForId);
        let address = match ServerAddress::parse(address) {
            Ok(a) => a,
            Err(e) => {
                warn!("cannot start identity phase: {}", e);
                self.set_state(ConnectionState::Error);
                actions.push(Action::Report(Report::AttemptFailed {
                    ticket,
                    error: e.into(),
                }));
                return actions;
            }
        };
        info!(address = %address, "requesting client id");
        actions.push(self.open(address, Phase::Identity, HandshakeAuth::Identity, Some(ticket)));
        actions
    }

    /// Start the session phase with a known client id. `ticket` is `None` when nobody waits.
    pub fn establish_session(
        &mut self,
        address: &str,
        client_id: ClientId,
        ticket: Option<Ticket>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.client_id = Some(client_id.clone());
        self.retire_transport(&mut actions);
        self.set_state(ConnectionState::ConnectingWithId);
        let address = match ServerAddress::parse(address) {
            Ok(a) => a,
            Err(e) => {
                warn!("cannot start session: {}", e);
                self.set_state(ConnectionState::Error);
                if let Some(ticket) = ticket {
                    actions.push(Action::Report(Report::AttemptFailed {
                        ticket,
                        error: e.into(),
                    }));
                }
                return actions;
            }
        };
        info!(address = %address, client_id = %client_id, "connecting with client id");
        let auth = HandshakeAuth::Session(client_id);
        actions.push(self.open(address, Phase::Session, auth, ticket));
        actions
    }

    /// Idempotent. A live transport is asked to close and `DISCONNECTED` follows its
    /// disconnect event; anything else is torn down immediately.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.transport.as_ref().map(|t| t.live) {
            Some(true) => {
                if let Some(t) = self.transport.as_mut().filter(|t| !t.closing) {
                    info!(generation = t.generation, "disconnecting");
                    t.closing = true;
                    actions.push(Action::Close {
                        generation: t.generation,
                    });
                }
            }
            Some(false) => {
                self.retire_transport(&mut actions);
                self.set_state(ConnectionState::Disconnected);
            }
            None => self.set_state(ConnectionState::Disconnected),
        }
        self.client_id = None;
        actions
    }

    pub fn request_stream(&mut self, feeder: &FeederId, ticket: Ticket) -> Result<Vec<Action>, SessionError> {
        self.emit_request(feeder, ticket, RequestKind::Start)
    }

    pub fn stop_stream(&mut self, feeder: &FeederId, ticket: Ticket) -> Result<Vec<Action>, SessionError> {
        self.emit_request(feeder, ticket, RequestKind::Stop)
    }

    pub fn clear_force_stop(&mut self) {
        self.force_stopped = None;
    }

    /// Feed a transport event. Events from anything but the current transport are discarded.
    pub fn on_transport_event(&mut self, generation: Generation, event: TransportEvent) -> Vec<Action> {
        let (current, closing) = match &self.transport {
            Some(t) if t.generation == generation => (t.phase, t.closing),
            _ => {
                debug!(generation, current = ?self.current_generation(), ?event, "discarding stale transport event");
                return Vec::new();
            }
        };
        // A transport closing on user request only gets to finish its close and answer requests.
        if closing && matches!(event, TransportEvent::Connected | TransportEvent::Message { .. }) {
            debug!(generation, ?event, "dropping event from closing transport");
            return Vec::new();
        }
        match event {
            TransportEvent::Connected => self.on_connected(current),
            TransportEvent::Disconnected { reason } => self.on_disconnected(current, reason),
            TransportEvent::Error { message } => self.on_error(current, message),
            TransportEvent::Message { event, args } => self.on_message(current, &event, &args),
            TransportEvent::Ack { ticket, args } => self.on_ack(generation, ticket, &args),
            TransportEvent::AckTimeout { ticket } => {
                self.fail_request(generation, ticket, SessionError::AckTimeout)
            }
            TransportEvent::EmitFailed { ticket, message } => {
                self.fail_request(generation, ticket, SessionError::Session(message))
            }
        }
    }

    fn on_connected(&mut self, phase: Phase) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(t) = self.transport.as_mut() else {
            return actions;
        };
        t.live = true;
        match phase {
            Phase::Identity => info!(generation = t.generation, "connected, waiting for client id"),
            Phase::Session => {
                if self.state == ConnectionState::ConnectingWithId {
                    let ticket = t.attempt.take();
                    self.set_state(ConnectionState::Connected);
                    if let Some(ticket) = ticket {
                        actions.push(Action::Report(Report::Connected { ticket }));
                    }
                }
            }
        }
        actions
    }

    fn on_disconnected(&mut self, phase: Phase, reason: String) -> Vec<Action> {
        let closing = self.transport.as_ref().is_some_and(|t| t.closing);
        let mut actions = Vec::new();
        if closing {
            info!(reason = %reason, "disconnected");
            self.retire_transport(&mut actions);
            self.set_state(ConnectionState::Disconnected);
            return actions;
        }
        match phase {
            Phase::Identity => {
                warn!(reason = %reason, "disconnected before a client id was assigned");
                let error = SessionError::Identity(format!("disconnected before id was assigned: {}", reason));
                self.fail_transport(&mut actions, error, ConnectionState::Error);
            }
            Phase::Session => {
                info!(reason = %reason, "session disconnected");
                let error = SessionError::Session(format!("disconnected: {}", reason));
                self.fail_transport(&mut actions, error, ConnectionState::Disconnected);
            }
        }
        actions
    }

    fn on_error(&mut self, phase: Phase, message: String) -> Vec<Action> {
        let closing = self.transport.as_ref().is_some_and(|t| t.closing);
        let mut actions = Vec::new();
        if closing {
            debug!(message = %message, "transport error while closing");
            self.retire_transport(&mut actions);
            self.set_state(ConnectionState::Disconnected);
            return actions;
        }
        warn!(message = %message, ?phase, "transport error");
        let error = match phase {
            Phase::Identity => SessionError::Identity(message),
            Phase::Session => SessionError::Session(message),
        };
        self.fail_transport(&mut actions, error, ConnectionState::Error);
        actions
    }

    fn on_message(&mut self, phase: Phase, event: &str, args: &[Value]) -> Vec<Action> {
        match (phase, event) {
            (Phase::Identity, EVENT_ASSIGN_ID) => self.on_assign_id(args),
            (Phase::Session, EVENT_STREAM_STOPPED) => {
                if let Some(feeder) = wire::decode_stream_stopped(args) {
                    info!(feeder = %feeder, "server stopped stream");
                    self.force_stopped = Some(feeder);
                }
                Vec::new()
            }
            _ => {
                debug!(event, ?phase, "ignoring server event");
                Vec::new()
            }
        }
    }

    fn on_assign_id(&mut self, args: &[Value]) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(client_id) = identity::parse_client_id(args) else {
            warn!(?args, "could not extract client id from 'assign id'");
            let error = SessionError::Identity("failed to get client id from server response".into());
            self.fail_transport(&mut actions, error, ConnectionState::Error);
            return actions;
        };
        let Some(t) = self.transport.as_mut() else {
            return actions;
        };
        info!(client_id = %client_id, "client id assigned");
        let ticket = t.attempt.take();
        let address = t.address.as_str().to_string();
        if let Some(ticket) = ticket {
            actions.push(Action::Report(Report::IdentityAssigned {
                ticket,
                client_id: client_id.clone(),
            }));
        }
        actions.extend(self.establish_session(&address, client_id, ticket));
        actions
    }

    fn on_ack(&mut self, generation: Generation, ticket: Ticket, args: &[Value]) -> Vec<Action> {
        let Some(request) = self.take_request(generation, ticket) else {
            return Vec::new();
        };
        let report = match request.kind {
            RequestKind::Start => match wire::decode_start_ack(args) {
                Ok(path) => Report::StreamStarted { ticket, path },
                Err(error) => Report::RequestFailed { ticket, error },
            },
            RequestKind::Stop => match wire::decode_stop_ack(args) {
                Ok(()) => Report::StreamStopAcked { ticket },
                Err(error) => Report::RequestFailed { ticket, error },
            },
        };
        vec![Action::Report(report)]
    }

    fn fail_request(&mut self, generation: Generation, ticket: Ticket, error: SessionError) -> Vec<Action> {
        match self.take_request(generation, ticket) {
            Some(_) => {
                warn!(?ticket, "request failed: {}", error);
                vec![Action::Report(Report::RequestFailed { ticket, error })]
            }
            None => Vec::new(),
        }
    }

    fn take_request(&mut self, generation: Generation, ticket: Ticket) -> Option<PendingRequest> {
        match self.pending.get(&ticket) {
            Some(r) if r.generation == generation => self.pending.remove(&ticket),
            _ => {
                debug!(?ticket, "acknowledgement for unknown request");
                None
            }
        }
    }

    fn emit_request(&mut self, feeder: &FeederId, ticket: Ticket, kind: RequestKind) -> Result<Vec<Action>, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let generation = self.current_generation().ok_or(SessionError::NotConnected)?;
        let event = match kind {
            RequestKind::Start => EVENT_STREAM_START,
            RequestKind::Stop => EVENT_STREAM_STOP,
        };
        debug!(feeder = %feeder, event, ?ticket, "emitting request");
        self.pending.insert(ticket, PendingRequest { generation, kind });
        Ok(vec![Action::Emit {
            generation,
            ticket,
            event,
            payload: wire::feeder_request(feeder),
        }])
    }

    fn open(&mut self, address: ServerAddress, phase: Phase, auth: HandshakeAuth, attempt: Option<Ticket>) -> Action {
        self.generation += 1;
        let generation = self.generation;
        let url = address.socket_url();
        self.transport = Some(ActiveTransport {
            generation,
            phase,
            address,
            live: false,
            closing: false,
            attempt,
        });
        Action::Open { generation, url, auth }
    }

    /// Close and detach the current transport. Its waiting attempt is abandoned and
    /// its in-flight requests fail with `Superseded`.
    fn retire_transport(&mut self, actions: &mut Vec<Action>) {
        let Some(t) = self.transport.take() else {
            return;
        };
        debug!(generation = t.generation, "retiring transport");
        actions.push(Action::Close { generation: t.generation });
        actions.push(Action::Detach { generation: t.generation });
        if let Some(ticket) = t.attempt {
            actions.push(Action::Report(Report::AttemptAbandoned { ticket }));
        }
        self.fail_pending(actions, t.generation, || SessionError::Superseded);
    }

    /// Terminal failure of the current transport: tear it down, report the attempt
    /// (if still waiting) and all in-flight requests, then enter `state`.
    fn fail_transport(&mut self, actions: &mut Vec<Action>, error: SessionError, state: ConnectionState) {
        if let Some(t) = self.transport.take() {
            actions.push(Action::Close { generation: t.generation });
            actions.push(Action::Detach { generation: t.generation });
            if let Some(ticket) = t.attempt {
                actions.push(Action::Report(Report::AttemptFailed {
                    ticket,
                    error: error.clone(),
                }));
            }
            self.fail_pending(actions, t.generation, || error.clone());
        }
        self.set_state(state);
    }

    fn fail_pending(&mut self, actions: &mut Vec<Action>, generation: Generation, error: impl Fn() -> SessionError) {
        let mut failed: Vec<Ticket> = self
            .pending
            .iter()
            .filter(|(_, r)| r.generation == generation)
            .map(|(t, _)| *t)
            .collect();
        failed.sort();
        for ticket in failed {
            self.pending.remove(&ticket);
            actions.push(Action::Report(Report::RequestFailed {
                ticket,
                error: error(),
            }));
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Error) {
            self.client_id = None;
        }
        if self.state != state {
            info!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
        }
    }
}

/// What the host must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create a new transport tagged `generation` and connect it.
    Open {
        generation: Generation,
        url: String,
        auth: HandshakeAuth,
    },
    /// Request the transport to disconnect.
    Close { generation: Generation },
    /// Drop every listener of the transport; nothing from it may reach the core again.
    Detach { generation: Generation },
    /// Emit `event` and wait for one acknowledgement, delivered as `Ack { ticket }`.
    Emit {
        generation: Generation,
        ticket: Ticket,
        event: &'static str,
        payload: Value,
    },
    Report(Report),
}

/// Outcome for whoever holds the ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    IdentityAssigned { ticket: Ticket, client_id: ClientId },
    Connected { ticket: Ticket },
    AttemptFailed { ticket: Ticket, error: SessionError },
    /// A newer attempt or a disconnect replaced this one before it finished.
    AttemptAbandoned { ticket: Ticket },
    StreamStarted { ticket: Ticket, path: String },
    StreamStopAcked { ticket: Ticket },
    RequestFailed { ticket: Ticket, error: SessionError },
}

/// Transport-level events, tagged by the host with the transport's generation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    /// Server-pushed named event.
    Message { event: String, args: Vec<Value> },
    Ack { ticket: Ticket, args: Vec<Value> },
    AckTimeout { ticket: Ticket },
    EmitFailed { ticket: Ticket, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("cannot create transport: {0}")]
    TransportCreation(#[from] AddressError),
    #[error("identity acquisition failed: {0}")]
    Identity(String),
    #[error("session failed: {0}")]
    Session(String),
    #[error("Not connected to server")]
    NotConnected,
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Protocol(String),
    #[error("no acknowledgement from server")]
    AckTimeout,
    #[error("superseded by a newer connection attempt")]
    Superseded,
    #[error("session closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ADDR: &str = "10.0.0.2:5000";

    fn opened(actions: &[Action]) -> Generation {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Open { generation, .. } => Some(*generation),
                _ => None,
            })
            .expect("no Open action")
    }

    fn reports(actions: &[Action]) -> Vec<Report> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Report(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn assign_id(id: &str) -> TransportEvent {
        TransportEvent::Message {
            event: EVENT_ASSIGN_ID.into(),
            args: vec![json!({ "id": id })],
        }
    }

    fn connected_session(core: &mut SessionCore) -> Generation {
        let id = ClientId::new("C").unwrap();
        let g = opened(&core.establish_session(ADDR, id, None));
        core.on_transport_event(g, TransportEvent::Connected);
        assert!(core.is_connected());
        g
    }

    #[test]
    fn initial_state_is_disconnected() {
        let core = SessionCore::new();
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.client_id().is_none());
        assert!(core.force_stopped_feeder().is_none());
        assert!(!core.is_connected());
    }

    #[test]
    fn identity_then_session_chaining() {
        let mut core = SessionCore::new();
        let actions = core.acquire_identity(ADDR, Ticket(1));
        assert_eq!(core.state(), ConnectionState::ConnectingForId);
        let g1 = opened(&actions);
        assert!(matches!(
            &actions[0],
            Action::Open { url, auth: HandshakeAuth::Identity, .. } if url == "http://10.0.0.2:5000"
        ));

        assert!(core.on_transport_event(g1, TransportEvent::Connected).is_empty());
        assert_eq!(core.state(), ConnectionState::ConnectingForId);

        let actions = core.on_transport_event(g1, assign_id("X"));
        let assigned: Vec<_> = reports(&actions)
            .into_iter()
            .filter(|r| matches!(r, Report::IdentityAssigned { .. }))
            .collect();
        assert_eq!(
            assigned,
            vec![Report::IdentityAssigned {
                ticket: Ticket(1),
                client_id: ClientId::new("X").unwrap()
            }]
        );
        assert!(actions.contains(&Action::Detach { generation: g1 }));
        let g2 = opened(&actions);
        assert_ne!(g1, g2);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Open { auth: HandshakeAuth::Session(id), .. } if id.as_str() == "X"
        )));
        assert_eq!(core.state(), ConnectionState::ConnectingWithId);
        assert_eq!(core.client_id().unwrap().as_str(), "X");

        let actions = core.on_transport_event(g2, TransportEvent::Connected);
        assert_eq!(reports(&actions), vec![Report::Connected { ticket: Ticket(1) }]);
        assert_eq!(core.state(), ConnectionState::Connected);
        assert!(core.is_connected());
    }

    #[test]
    fn stale_events_from_superseded_attempt_are_discarded() {
        let mut core = SessionCore::new();
        let g1 = opened(&core.acquire_identity(ADDR, Ticket(1)));
        let actions = core.acquire_identity(ADDR, Ticket(2));
        assert!(actions.contains(&Action::Detach { generation: g1 }));
        assert_eq!(reports(&actions), vec![Report::AttemptAbandoned { ticket: Ticket(1) }]);
        let g2 = opened(&actions);

        for event in [
            TransportEvent::Connected,
            assign_id("old"),
            TransportEvent::Error { message: "boom".into() },
            TransportEvent::Disconnected { reason: "gone".into() },
        ] {
            assert!(core.on_transport_event(g1, event).is_empty());
            assert_eq!(core.state(), ConnectionState::ConnectingForId);
            assert!(core.client_id().is_none());
            assert_eq!(core.current_generation(), Some(g2));
        }
    }

    #[test]
    fn stale_disconnect_does_not_touch_newer_session() {
        let mut core = SessionCore::new();
        let g1 = connected_session(&mut core);
        let g2 = connected_session(&mut core);
        assert!(core
            .on_transport_event(g1, TransportEvent::Disconnected { reason: "late".into() })
            .is_empty());
        assert_eq!(core.state(), ConnectionState::Connected);
        assert_eq!(core.current_generation(), Some(g2));
    }

    #[test]
    fn request_stream_requires_connection() {
        let mut core = SessionCore::new();
        let feeder = FeederId::new("F").unwrap();
        assert_eq!(core.request_stream(&feeder, Ticket(1)), Err(SessionError::NotConnected));
        assert_eq!(core.stop_stream(&feeder, Ticket(2)), Err(SessionError::NotConnected));
        assert_eq!(SessionError::NotConnected.to_string(), "Not connected to server");

        // connecting is not connected either
        let id = ClientId::new("C").unwrap();
        core.establish_session(ADDR, id, None);
        assert_eq!(core.request_stream(&feeder, Ticket(3)), Err(SessionError::NotConnected));
    }

    #[test]
    fn stream_ack_mapping() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        let feeder = FeederId::new("F").unwrap();

        let actions = core.request_stream(&feeder, Ticket(10)).unwrap();
        assert_eq!(
            actions,
            vec![Action::Emit {
                generation: g,
                ticket: Ticket(10),
                event: EVENT_STREAM_START,
                payload: json!({ "feeder_id": "F" }),
            }]
        );
        let ack = |ticket, v: Value| TransportEvent::Ack { ticket, args: vec![v] };

        let out = core.on_transport_event(g, ack(Ticket(10), json!({ "success": true, "path": "live/1" })));
        assert_eq!(
            reports(&out),
            vec![Report::StreamStarted { ticket: Ticket(10), path: "live/1".into() }]
        );

        core.request_stream(&feeder, Ticket(11)).unwrap();
        let out = core.on_transport_event(g, ack(Ticket(11), json!({ "success": false, "error": "busy" })));
        assert_eq!(
            reports(&out),
            vec![Report::RequestFailed { ticket: Ticket(11), error: SessionError::Rejected("busy".into()) }]
        );

        core.request_stream(&feeder, Ticket(12)).unwrap();
        let out = core.on_transport_event(g, ack(Ticket(12), json!({ "success": false })));
        assert!(matches!(
            &reports(&out)[..],
            [Report::RequestFailed { error: SessionError::Rejected(m), .. }]
                if m == "Server returned error or path missing"
        ));

        core.request_stream(&feeder, Ticket(13)).unwrap();
        let out = core.on_transport_event(g, ack(Ticket(13), json!("garbage")));
        assert!(matches!(
            &reports(&out)[..],
            [Report::RequestFailed { error: SessionError::Protocol(_), .. }]
        ));

        // a second ack for an answered request is ignored
        assert!(core.on_transport_event(g, ack(Ticket(10), json!({ "success": true }))).is_empty());
    }

    #[test]
    fn stop_stream_ack_and_timeout() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        let feeder = FeederId::new("F").unwrap();

        let actions = core.stop_stream(&feeder, Ticket(1)).unwrap();
        assert!(matches!(&actions[..], [Action::Emit { event: EVENT_STREAM_STOP, .. }]));
        let out = core.on_transport_event(g, TransportEvent::Ack { ticket: Ticket(1), args: vec![json!({ "success": true })] });
        assert_eq!(reports(&out), vec![Report::StreamStopAcked { ticket: Ticket(1) }]);

        core.stop_stream(&feeder, Ticket(2)).unwrap();
        let out = core.on_transport_event(g, TransportEvent::AckTimeout { ticket: Ticket(2) });
        assert_eq!(
            reports(&out),
            vec![Report::RequestFailed { ticket: Ticket(2), error: SessionError::AckTimeout }]
        );
    }

    #[test]
    fn forced_stop_one_shot() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.on_transport_event(
            g,
            TransportEvent::Message {
                event: EVENT_STREAM_STOPPED.into(),
                args: vec![json!({ "feeder_id": "F" })],
            },
        );
        assert_eq!(core.force_stopped_feeder().unwrap().as_str(), "F");
        core.clear_force_stop();
        assert!(core.force_stopped_feeder().is_none());

        // malformed payload leaves it untouched
        core.on_transport_event(
            g,
            TransportEvent::Message {
                event: EVENT_STREAM_STOPPED.into(),
                args: vec![json!("F")],
            },
        );
        assert!(core.force_stopped_feeder().is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut core = SessionCore::new();
        assert!(core.disconnect().is_empty());
        assert!(core.disconnect().is_empty());
        assert_eq!(core.state(), ConnectionState::Disconnected);

        let g = connected_session(&mut core);
        assert_eq!(core.disconnect(), vec![Action::Close { generation: g }]);
        assert!(core.client_id().is_none());
        assert!(core.disconnect().is_empty());

        let out = core.on_transport_event(g, TransportEvent::Disconnected { reason: "client".into() });
        assert!(out.contains(&Action::Detach { generation: g }));
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.disconnect().is_empty());
        assert_eq!(core.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn late_assign_id_does_not_undo_disconnect() {
        let mut core = SessionCore::new();
        let g = opened(&core.acquire_identity(ADDR, Ticket(1)));
        core.on_transport_event(g, TransportEvent::Connected);
        assert_eq!(core.disconnect(), vec![Action::Close { generation: g }]);

        assert!(core.on_transport_event(g, assign_id("X")).is_empty());
        assert!(core.client_id().is_none());
        assert_eq!(core.current_generation(), Some(g));

        let out = core.on_transport_event(g, TransportEvent::Disconnected { reason: "client".into() });
        assert_eq!(reports(&out), vec![Report::AttemptAbandoned { ticket: Ticket(1) }]);
        assert!(!out.iter().any(|a| matches!(a, Action::Open { .. })));
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(!core.is_connected());
    }

    #[test]
    fn forced_stop_from_closing_transport_is_dropped() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.disconnect();
        core.on_transport_event(
            g,
            TransportEvent::Message {
                event: EVENT_STREAM_STOPPED.into(),
                args: vec![json!({ "feeder_id": "F" })],
            },
        );
        assert!(core.force_stopped_feeder().is_none());
    }

    #[test]
    fn error_while_closing_ends_disconnected() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.request_stream(&FeederId::new("F").unwrap(), Ticket(4)).unwrap();
        core.disconnect();
        let out = core.on_transport_event(g, TransportEvent::Error { message: "reset".into() });
        assert!(out.contains(&Action::Detach { generation: g }));
        assert_eq!(
            reports(&out),
            vec![Report::RequestFailed { ticket: Ticket(4), error: SessionError::Superseded }]
        );
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.current_generation().is_none());
    }

    #[test]
    fn emit_failure_fails_request_with_session_error() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.request_stream(&FeederId::new("F").unwrap(), Ticket(6)).unwrap();
        let out = core.on_transport_event(
            g,
            TransportEvent::EmitFailed { ticket: Ticket(6), message: "socket closed".into() },
        );
        assert_eq!(
            reports(&out),
            vec![Report::RequestFailed { ticket: Ticket(6), error: SessionError::Session("socket closed".into()) }]
        );
        // the session itself is untouched
        assert_eq!(core.state(), ConnectionState::Connected);
    }

    #[test]
    fn disconnect_before_connect_tears_down_immediately() {
        let mut core = SessionCore::new();
        let g = opened(&core.acquire_identity(ADDR, Ticket(1)));
        let out = core.disconnect();
        assert!(out.contains(&Action::Detach { generation: g }));
        assert_eq!(reports(&out), vec![Report::AttemptAbandoned { ticket: Ticket(1) }]);
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.current_generation().is_none());
        assert!(core.disconnect().is_empty());
    }

    #[test]
    fn echoed_event_name_fails_identity() {
        let mut core = SessionCore::new();
        let g = opened(&core.acquire_identity(ADDR, Ticket(1)));
        core.on_transport_event(g, TransportEvent::Connected);
        let out = core.on_transport_event(
            g,
            TransportEvent::Message {
                event: EVENT_ASSIGN_ID.into(),
                args: vec![json!("assign id")],
            },
        );
        assert!(matches!(
            &reports(&out)[..],
            [Report::AttemptFailed { ticket: Ticket(1), error: SessionError::Identity(_) }]
        ));
        assert!(out.contains(&Action::Detach { generation: g }));
        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.client_id().is_none());
    }

    #[test]
    fn premature_disconnect_in_identity_phase_is_identity_error() {
        let mut core = SessionCore::new();
        let g = opened(&core.acquire_identity(ADDR, Ticket(1)));
        core.on_transport_event(g, TransportEvent::Connected);
        let out = core.on_transport_event(g, TransportEvent::Disconnected { reason: "io".into() });
        assert!(matches!(
            &reports(&out)[..],
            [Report::AttemptFailed { error: SessionError::Identity(_), .. }]
        ));
        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.current_generation().is_none());
    }

    #[test]
    fn connect_error_in_identity_phase() {
        let mut core = SessionCore::new();
        let g = opened(&core.acquire_identity(ADDR, Ticket(1)));
        let out = core.on_transport_event(g, TransportEvent::Error { message: "refused".into() });
        assert_eq!(
            reports(&out),
            vec![Report::AttemptFailed { ticket: Ticket(1), error: SessionError::Identity("refused".into()) }]
        );
        assert_eq!(core.state(), ConnectionState::Error);
    }

    #[test]
    fn invalid_address_reports_transport_creation() {
        let mut core = SessionCore::new();
        let out = core.acquire_identity("not a host/path", Ticket(1));
        assert!(matches!(
            &reports(&out)[..],
            [Report::AttemptFailed { error: SessionError::TransportCreation(_), .. }]
        ));
        assert!(!out.iter().any(|a| matches!(a, Action::Open { .. })));
        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.current_generation().is_none());
    }

    #[test]
    fn session_disconnect_clears_client_id_and_fails_requests() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.request_stream(&FeederId::new("F").unwrap(), Ticket(5)).unwrap();
        let out = core.on_transport_event(g, TransportEvent::Disconnected { reason: "server".into() });
        assert!(out.contains(&Action::Detach { generation: g }));
        assert!(matches!(
            &reports(&out)[..],
            [Report::RequestFailed { ticket: Ticket(5), error: SessionError::Session(_) }]
        ));
        assert_eq!(core.state(), ConnectionState::Disconnected);
        assert!(core.client_id().is_none());
        assert!(!core.is_connected());
    }

    #[test]
    fn session_error_fails_pending_attempt() {
        let mut core = SessionCore::new();
        let id = ClientId::new("C").unwrap();
        let g = opened(&core.establish_session(ADDR, id, Some(Ticket(3))));
        assert_eq!(core.client_id().unwrap().as_str(), "C");
        let out = core.on_transport_event(g, TransportEvent::Error { message: "unauthorized".into() });
        assert_eq!(
            reports(&out),
            vec![Report::AttemptFailed { ticket: Ticket(3), error: SessionError::Session("unauthorized".into()) }]
        );
        assert_eq!(core.state(), ConnectionState::Error);
        assert!(core.client_id().is_none());
    }

    #[test]
    fn superseding_fails_in_flight_requests() {
        let mut core = SessionCore::new();
        let g = connected_session(&mut core);
        core.request_stream(&FeederId::new("F").unwrap(), Ticket(7)).unwrap();
        let out = core.acquire_identity(ADDR, Ticket(8));
        assert_eq!(
            reports(&out),
            vec![Report::RequestFailed { ticket: Ticket(7), error: SessionError::Superseded }]
        );
        // late ack from the retired transport is dropped
        let late = TransportEvent::Ack { ticket: Ticket(7), args: vec![json!({ "success": true, "path": "p" })] };
        assert!(core.on_transport_event(g, late).is_empty());
    }

    #[test]
    fn establish_session_without_ticket_reports_nothing() {
        let mut core = SessionCore::new();
        let id = ClientId::new("C").unwrap();
        let g = opened(&core.establish_session(ADDR, id, None));
        let out = core.on_transport_event(g, TransportEvent::Connected);
        assert!(out.is_empty());
        assert_eq!(core.state(), ConnectionState::Connected);
    }
}
