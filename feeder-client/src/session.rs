//! Session actor: the single owner of `SessionCore` and every transport.
//!
//! Callers talk to it through a cloneable [`SessionHandle`]; transports post their events
//! to the same task, tagged with their generation, so all mutation happens in one place.

use std::collections::HashMap;

use feeder_core::{
    Action, ClientId, ConnectionState, FeederId, Generation, Report, SessionCore, SessionError,
    Ticket, TransportEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::transport::{Connector, Link, ListenerSink, OpenRequest};

/// Progress of a connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptEvent {
    IdentityAssigned(ClientId),
    Connected,
    Failed(SessionError),
}

/// Outcome stream of `acquire_identity` / `establish_session`. Dropping it ignores the outcome.
#[derive(Debug)]
pub struct Attempt {
    rx: mpsc::UnboundedReceiver<AttemptEvent>,
}

impl Attempt {
    /// Next event; `None` once the attempt has finished.
    pub async fn next(&mut self) -> Option<AttemptEvent> {
        self.rx.recv().await
    }

    /// Wait for the server-assigned id.
    pub async fn identity(&mut self) -> Result<ClientId, SessionError> {
        loop {
            match self.next().await {
                Some(AttemptEvent::IdentityAssigned(id)) => return Ok(id),
                Some(AttemptEvent::Failed(e)) => return Err(e),
                Some(AttemptEvent::Connected) => continue,
                None => return Err(SessionError::Closed),
            }
        }
    }

    /// Wait until the session phase is connected.
    pub async fn connected(&mut self) -> Result<(), SessionError> {
        loop {
            match self.next().await {
                Some(AttemptEvent::Connected) => return Ok(()),
                Some(AttemptEvent::Failed(e)) => return Err(e),
                Some(AttemptEvent::IdentityAssigned(_)) => continue,
                None => return Err(SessionError::Closed),
            }
        }
    }
}

enum Command {
    AcquireIdentity {
        address: String,
        events: mpsc::UnboundedSender<AttemptEvent>,
    },
    EstablishSession {
        address: String,
        client_id: ClientId,
        events: mpsc::UnboundedSender<AttemptEvent>,
    },
    RequestStream {
        feeder: FeederId,
        reply: oneshot::Sender<Result<String, SessionError>>,
    },
    StopStream {
        feeder: FeederId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect,
    ClearForceStop,
}

/// Cloneable front of the session actor. The actor stops when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    client_id: watch::Receiver<Option<ClientId>>,
    force_stopped: watch::Receiver<Option<FeederId>>,
    connected: watch::Receiver<bool>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::AcquireIdentity { .. } => "AcquireIdentity",
            Command::EstablishSession { .. } => "EstablishSession",
            Command::RequestStream { .. } => "RequestStream",
            Command::StopStream { .. } => "StopStream",
            Command::Disconnect => "Disconnect",
            Command::ClearForceStop => "ClearForceStop",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn<C: Connector>(connector: C) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(connector, events_tx);
        let handle = Self {
            commands,
            state: actor.state_tx.subscribe(),
            client_id: actor.client_tx.subscribe(),
            force_stopped: actor.force_tx.subscribe(),
            connected: actor.connected_tx.subscribe(),
        };
        tokio::spawn(actor.run(command_rx, events_rx));
        handle
    }

    pub fn acquire_identity(&self, address: &str) -> Attempt {
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Command::AcquireIdentity {
            address: address.to_string(),
            events,
        });
        Attempt { rx }
    }

    pub fn establish_session(&self, address: &str, client_id: ClientId) -> Attempt {
        let (events, rx) = mpsc::unbounded_channel();
        self.send(Command::EstablishSession {
            address: address.to_string(),
            client_id,
            events,
        });
        Attempt { rx }
    }

    /// Ask the server to start streaming `feeder`; resolves to the stream path.
    pub async fn request_stream(&self, feeder: &FeederId) -> Result<String, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestStream {
            feeder: feeder.clone(),
            reply,
        });
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    pub async fn stop_stream(&self, feeder: &FeederId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StopStream {
            feeder: feeder.clone(),
            reply,
        });
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Acknowledge a forced stop so it is not seen again.
    pub fn clear_force_stop(&self) {
        self.send(Command::ClearForceStop);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn watch_client_id(&self) -> watch::Receiver<Option<ClientId>> {
        self.client_id.clone()
    }

    pub fn watch_force_stop(&self) -> watch::Receiver<Option<FeederId>> {
        self.force_stopped.clone()
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            debug!(command = ?e.0, "session actor gone");
        }
    }
}

struct SessionActor<C> {
    core: SessionCore,
    connector: C,
    links: HashMap<Generation, Box<dyn Link>>,
    events_tx: mpsc::UnboundedSender<(Generation, TransportEvent)>,
    next_ticket: u64,
    attempts: HashMap<Ticket, mpsc::UnboundedSender<AttemptEvent>>,
    starts: HashMap<Ticket, oneshot::Sender<Result<String, SessionError>>>,
    stops: HashMap<Ticket, oneshot::Sender<Result<(), SessionError>>>,
    state_tx: watch::Sender<ConnectionState>,
    client_tx: watch::Sender<Option<ClientId>>,
    force_tx: watch::Sender<Option<FeederId>>,
    connected_tx: watch::Sender<bool>,
}

impl<C: Connector> SessionActor<C> {
    fn new(connector: C, events_tx: mpsc::UnboundedSender<(Generation, TransportEvent)>) -> Self {
        Self {
            core: SessionCore::new(),
            connector,
            links: HashMap::new(),
            events_tx,
            next_ticket: 0,
            attempts: HashMap::new(),
            starts: HashMap::new(),
            stops: HashMap::new(),
            state_tx: watch::channel(ConnectionState::Disconnected).0,
            client_tx: watch::channel(None).0,
            force_tx: watch::channel(None).0,
            connected_tx: watch::channel(false).0,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(Generation, TransportEvent)>,
    ) {
        loop {
            let actions = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some((generation, event)) = events.recv() => {
                    self.core.on_transport_event(generation, event)
                }
            };
            self.step(actions);
        }
        info!("session handles dropped, shutting down");
        let actions = self.core.disconnect();
        self.step(actions);
        for (_, mut link) in self.links.drain() {
            link.detach();
        }
    }

    fn on_command(&mut self, command: Command) -> Vec<Action> {
        match command {
            Command::AcquireIdentity { address, events } => {
                let ticket = self.ticket();
                self.attempts.insert(ticket, events);
                self.core.acquire_identity(&address, ticket)
            }
            Command::EstablishSession {
                address,
                client_id,
                events,
            } => {
                let ticket = self.ticket();
                self.attempts.insert(ticket, events);
                self.core.establish_session(&address, client_id, Some(ticket))
            }
            Command::RequestStream { feeder, reply } => {
                let ticket = self.ticket();
                match self.core.request_stream(&feeder, ticket) {
                    Ok(actions) => {
                        self.starts.insert(ticket, reply);
                        actions
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Vec::new()
                    }
                }
            }
            Command::StopStream { feeder, reply } => {
                let ticket = self.ticket();
                match self.core.stop_stream(&feeder, ticket) {
                    Ok(actions) => {
                        self.stops.insert(ticket, reply);
                        actions
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Vec::new()
                    }
                }
            }
            Command::Disconnect => self.core.disconnect(),
            Command::ClearForceStop => {
                self.core.clear_force_stop();
                Vec::new()
            }
        }
    }

    /// Run transport actions, publish observables, then hand out reports.
    fn step(&mut self, actions: Vec<Action>) {
        let mut reports = Vec::new();
        for action in actions {
            match action {
                Action::Open {
                    generation,
                    url,
                    auth,
                } => {
                    let sink = ListenerSink::new(generation, self.events_tx.clone());
                    let request = OpenRequest {
                        generation,
                        url,
                        auth,
                    };
                    let link = self.connector.open(request, sink);
                    self.links.insert(generation, link);
                }
                Action::Close { generation } => {
                    if let Some(link) = self.links.get_mut(&generation) {
                        link.close();
                    }
                }
                Action::Detach { generation } => {
                    if let Some(mut link) = self.links.remove(&generation) {
                        link.detach();
                    }
                }
                Action::Emit {
                    generation,
                    ticket,
                    event,
                    payload,
                } => match self.links.get_mut(&generation) {
                    Some(link) => link.emit(ticket, event, payload),
                    None => reports.push(Report::RequestFailed {
                        ticket,
                        error: SessionError::NotConnected,
                    }),
                },
                Action::Report(report) => reports.push(report),
            }
        }
        self.publish();
        for report in reports {
            self.route(report);
        }
    }

    fn publish(&self) {
        let state = self.core.state();
        self.state_tx.send_if_modified(|s| replace_if_changed(s, state));
        let client_id = self.core.client_id().cloned();
        self.client_tx.send_if_modified(|c| replace_if_changed(c, client_id));
        let forced = self.core.force_stopped_feeder().cloned();
        self.force_tx.send_if_modified(|f| replace_if_changed(f, forced));
        let connected = self.core.is_connected();
        self.connected_tx.send_if_modified(|c| replace_if_changed(c, connected));
    }

    fn route(&mut self, report: Report) {
        debug!(?report, "report");
        match report {
            Report::IdentityAssigned { ticket, client_id } => {
                if let Some(tx) = self.attempts.get(&ticket) {
                    let _ = tx.send(AttemptEvent::IdentityAssigned(client_id));
                }
            }
            Report::Connected { ticket } => self.finish_attempt(ticket, AttemptEvent::Connected),
            Report::AttemptFailed { ticket, error } => {
                self.finish_attempt(ticket, AttemptEvent::Failed(error))
            }
            Report::AttemptAbandoned { ticket } => {
                self.finish_attempt(ticket, AttemptEvent::Failed(SessionError::Superseded))
            }
            Report::StreamStarted { ticket, path } => {
                if let Some(reply) = self.starts.remove(&ticket) {
                    let _ = reply.send(Ok(path));
                }
            }
            Report::StreamStopAcked { ticket } => {
                if let Some(reply) = self.stops.remove(&ticket) {
                    let _ = reply.send(Ok(()));
                }
            }
            Report::RequestFailed { ticket, error } => {
                if let Some(reply) = self.starts.remove(&ticket) {
                    let _ = reply.send(Err(error));
                } else if let Some(reply) = self.stops.remove(&ticket) {
                    let _ = reply.send(Err(error));
                }
            }
        }
    }

    fn finish_attempt(&mut self, ticket: Ticket, event: AttemptEvent) {
        if let Some(tx) = self.attempts.remove(&ticket) {
            let _ = tx.send(event);
        }
    }

    fn ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket(self.next_ticket)
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
