//! Transport seam (`Connector` / `Link`) and the Socket.IO implementation over rust_socketio.

use std::sync::Arc;
use std::time::Duration;

use feeder_core::protocol::SERVER_EVENTS;
use feeder_core::{Generation, HandshakeAuth, Ticket, TransportEvent};
use futures_util::FutureExt;
use parking_lot::Mutex;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transport events tagged with the generation of the transport that produced them.
pub type EventSender = mpsc::UnboundedSender<(Generation, TransportEvent)>;

/// Everything needed to create one transport.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub generation: Generation,
    pub url: String,
    pub auth: HandshakeAuth,
}

/// Creates transports. One call per connection attempt; transports are never reused.
pub trait Connector: Send + 'static {
    fn open(&self, request: OpenRequest, sink: ListenerSink) -> Box<dyn Link>;
}

/// Handle on one open transport, owned by the session actor.
pub trait Link: Send {
    /// Emit `event` and deliver exactly one of `Ack`, `AckTimeout`, `EmitFailed` for `ticket`.
    fn emit(&mut self, ticket: Ticket, event: &'static str, payload: Value);
    /// Request a disconnect; `Disconnected` follows through the sink if still attached.
    fn close(&mut self);
    /// Remove every listener. Nothing from this transport reaches the session afterwards.
    fn detach(&mut self);
}

/// Where a transport's listeners post events. Shared by all of a transport's callbacks;
/// detaching one clone detaches them all.
#[derive(Debug, Clone)]
pub struct ListenerSink {
    generation: Generation,
    tx: Arc<Mutex<Option<EventSender>>>,
}

impl ListenerSink {
    pub fn new(generation: Generation, tx: EventSender) -> Self {
        Self {
            generation,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Post an event to the session. Returns false once detached.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send((self.generation, event)).is_ok(),
            None => {
                debug!(generation = self.generation, ?event, "listener detached, dropping event");
                false
            }
        }
    }

    pub fn detach(&self) {
        self.tx.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().is_some()
    }
}

/// rust_socketio-backed connector. Built-in reconnection is off; retry belongs to the caller.
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(connect_timeout: Duration, ack_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ack_timeout,
        }
    }
}

impl Connector for SocketIoConnector {
    fn open(&self, request: OpenRequest, sink: ListenerSink) -> Box<dyn Link> {
        debug!(generation = request.generation, url = %request.url, "opening socket");
        let client = Arc::new(Mutex::new(None));
        let builder = socket_builder(&request, &sink);
        let connect_timeout = self.connect_timeout;
        let slot = client.clone();
        let connect_sink = sink.clone();
        let connect_task = tokio::spawn(async move {
            match tokio::time::timeout(connect_timeout, builder.connect()).await {
                Ok(Ok(c)) => {
                    if !connect_sink.is_attached() {
                        // retired while connecting
                        let _ = c.disconnect().await;
                        return;
                    }
                    *slot.lock() = Some(c);
                    connect_sink.deliver(TransportEvent::Connected);
                }
                Ok(Err(e)) => {
                    connect_sink.deliver(TransportEvent::Error {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    connect_sink.deliver(TransportEvent::Error {
                        message: format!("connect timed out after {}s", connect_timeout.as_secs()),
                    });
                }
            }
        });
        Box::new(SocketIoLink {
            sink,
            client,
            connect_task,
            ack_timeout: self.ack_timeout,
        })
    }
}

fn socket_builder(request: &OpenRequest, sink: &ListenerSink) -> ClientBuilder {
    let on_close = sink.clone();
    let on_error = sink.clone();
    let builder = ClientBuilder::new(request.url.as_str())
        .auth(request.auth.to_value())
        .reconnect(false)
        .on(Event::Close, move |payload: Payload, _: Client| {
            let sink = on_close.clone();
            async move {
                let reason = payload_text(payload);
                sink.deliver(TransportEvent::Disconnected { reason });
            }
            .boxed()
        })
        .on(Event::Error, move |payload: Payload, _: Client| {
            let sink = on_error.clone();
            async move {
                let message = payload_text(payload);
                sink.deliver(TransportEvent::Error { message });
            }
            .boxed()
        });
    SERVER_EVENTS.iter().fold(builder, |builder, &name| {
        let sink = sink.clone();
        builder.on(name, move |payload: Payload, _: Client| {
            let sink = sink.clone();
            async move {
                sink.deliver(TransportEvent::Message {
                    event: name.to_string(),
                    args: payload_args(payload),
                });
            }
            .boxed()
        })
    })
}

struct SocketIoLink {
    sink: ListenerSink,
    client: Arc<Mutex<Option<Client>>>,
    connect_task: JoinHandle<()>,
    ack_timeout: Duration,
}

impl Link for SocketIoLink {
    fn emit(&mut self, ticket: Ticket, event: &'static str, payload: Value) {
        let client = self.client.lock().clone();
        let Some(client) = client else {
            self.sink.deliver(TransportEvent::EmitFailed {
                ticket,
                message: "socket is not connected".into(),
            });
            return;
        };
        let sink = self.sink.clone();
        let ack_timeout = self.ack_timeout;
        tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            let tx = Arc::new(Mutex::new(Some(tx)));
            let on_ack = move |payload: Payload, _: Client| {
                let reply = tx.lock().take();
                async move {
                    if let Some(reply) = reply {
                        let _ = reply.send(payload_args(payload));
                    }
                }
                .boxed()
            };
            if let Err(e) = client.emit_with_ack(event, payload, ack_timeout, on_ack).await {
                warn!(event, "emit failed: {}", e);
                sink.deliver(TransportEvent::EmitFailed {
                    ticket,
                    message: e.to_string(),
                });
                return;
            }
            match tokio::time::timeout(ack_timeout, rx).await {
                Ok(Ok(args)) => sink.deliver(TransportEvent::Ack { ticket, args }),
                _ => sink.deliver(TransportEvent::AckTimeout { ticket }),
            };
        });
    }

    fn close(&mut self) {
        let client = self.client.lock().take();
        match client {
            Some(client) => {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.disconnect().await {
                        debug!("socket disconnect: {}", e);
                    }
                    sink.deliver(TransportEvent::Disconnected {
                        reason: "client disconnect".into(),
                    });
                });
            }
            None => self.connect_task.abort(),
        }
    }

    fn detach(&mut self) {
        debug!(generation = self.sink.generation(), "detaching listeners");
        self.sink.detach();
    }
}

/// Positional arguments of an event or acknowledgement.
#[allow(deprecated)]
fn payload_args(payload: Payload) -> Vec<Value> {
    match payload {
        Payload::Text(values) => values,
        Payload::String(s) => match serde_json::from_str(&s) {
            Ok(v) => vec![v],
            Err(_) => vec![Value::String(s)],
        },
        Payload::Binary(_) => Vec::new(),
    }
}

fn payload_text(payload: Payload) -> String {
    payload_args(payload)
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
