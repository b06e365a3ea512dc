//! Cross-context message bus.
//!
//! Multiplexes many logical request/response, fire-and-forget and streaming
//! channels over a small number of long-lived connections. The bus is the hub
//! side: page contexts and UI surfaces connect to it, the transport layer
//! pumps frames in via [`MessageBus::dispatch_text`] and out via the receiver
//! returned from [`MessageBus::connect`].
//!
//! Delivery is FIFO per connection; there is no ordering guarantee across
//! connections. Correlation is a pending table keyed by request id, removed on
//! terminal delivery, timeout or connection loss.

mod error;
pub mod protocol;

pub use error::BusError;
pub use protocol::{Channel, Frame, Reply, Request};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default timeout for request/response calls.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable identifier of one duplex connection (e.g. `page-3`, `ui-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which kind of context sits on the far end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Page,
    Ui,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Page => "page",
            ConnectionKind::Ui => "ui",
        }
    }
}

/// Whether a handler sees traffic from every connection or one specific one.
///
/// Connection-scoped handlers are disposed automatically when their
/// connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerScope {
    Global,
    Connection(ConnectionId),
}

pub type HandlerFuture = BoxFuture<'static, ()>;
pub type HandlerFn = Arc<dyn Fn(Request, MessageContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request, ctx| Box::pin(f(request, ctx)))
}

/// Event observed by the initiator of a streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(BusError),
}

struct HandlerEntry {
    id: u64,
    channel: Channel,
    scope: HandlerScope,
    handler: HandlerFn,
}

enum PendingCall {
    Request {
        connection: ConnectionId,
        tx: oneshot::Sender<Result<Reply, BusError>>,
    },
    Stream {
        connection: ConnectionId,
        tx: mpsc::UnboundedSender<StreamEvent>,
    },
}

struct ServerStream {
    connection: ConnectionId,
    cancel: CancellationToken,
}

struct ConnectionEntry {
    kind: ConnectionKind,
    outbound: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct BusInner {
    next_conn_seq: u64,
    next_handler_id: u64,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    handlers: Vec<HandlerEntry>,
    pending: HashMap<String, PendingCall>,
    server_streams: HashMap<String, ServerStream>,
}

/// The hub multiplexing typed envelopes between contexts and the coordinator.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    request_timeout: Duration,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            request_timeout,
        }
    }

    /// Register a new connection. Returns its id and the receiver the
    /// transport must drain to deliver outbound frames.
    pub fn connect(&self, kind: ConnectionKind) -> (ConnectionId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.next_conn_seq += 1;
        let id = ConnectionId(format!("{}-{}", kind.as_str(), inner.next_conn_seq));
        inner
            .connections
            .insert(id.clone(), ConnectionEntry { kind, outbound: tx });
        tracing::debug!(connection = %id, "Connection opened");
        (id, rx)
    }

    /// Tear down a connection: every pending call on it fails with a
    /// connection-lost error, its server-side streams are cancelled and its
    /// scoped handlers are disposed. Idempotent.
    pub fn close_connection(&self, id: &ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.connections.remove(id).is_none() {
            return;
        }

        let lost: Vec<String> = inner
            .pending
            .iter()
            .filter(|(_, call)| match call {
                PendingCall::Request { connection, .. } => connection == id,
                PendingCall::Stream { connection, .. } => connection == id,
            })
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in lost {
            match inner.pending.remove(&request_id) {
                Some(PendingCall::Request { tx, .. }) => {
                    let _ = tx.send(Err(BusError::ConnectionLost));
                }
                Some(PendingCall::Stream { tx, .. }) => {
                    let _ = tx.send(StreamEvent::Error(BusError::ConnectionLost));
                }
                None => {}
            }
        }

        let cancelled: Vec<String> = inner
            .server_streams
            .iter()
            .filter(|(_, stream)| &stream.connection == id)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        for request_id in cancelled {
            if let Some(stream) = inner.server_streams.remove(&request_id) {
                stream.cancel.cancel();
            }
        }

        inner.handlers.retain(|entry| match &entry.scope {
            HandlerScope::Connection(conn) => conn != id,
            HandlerScope::Global => true,
        });

        tracing::debug!(connection = %id, "Connection closed");
    }

    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.inner.lock().unwrap().connections.contains_key(id)
    }

    /// Currently open connections of a kind.
    pub fn connections_of(&self, kind: ConnectionKind) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|(_, entry)| entry.kind == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Register a handler for a channel. The returned guard unregisters the
    /// handler when disposed or dropped.
    pub fn register_handler(
        self: &Arc<Self>,
        channel: Channel,
        scope: HandlerScope,
        handler: HandlerFn,
    ) -> HandlerGuard {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handler_id += 1;
        let id = inner.next_handler_id;
        inner.handlers.push(HandlerEntry {
            id,
            channel,
            scope,
            handler,
        });
        HandlerGuard {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Fire-and-forget send. Fails silently (logged) if the connection is
    /// closed.
    pub fn send(&self, conn: &ConnectionId, payload: Request) {
        self.send_frame(
            conn,
            Frame::Message {
                request_id: None,
                payload,
            },
        );
    }

    /// Repeated send over every open connection of a kind. Not transactional:
    /// a closed connection does not block delivery to the others.
    pub fn broadcast(&self, kind: ConnectionKind, payload: Request) {
        for conn in self.connections_of(kind) {
            self.send(&conn, payload.clone());
        }
    }

    /// Request/response call: allocates a request id, sends, resolves when the
    /// correlated reply arrives or the timeout elapses. Rejects immediately if
    /// the connection is already closed.
    pub async fn request(&self, conn: &ConnectionId, payload: Request) -> Result<Reply, BusError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            let outbound = inner
                .connections
                .get(conn)
                .ok_or_else(|| BusError::ConnectionClosed(conn.to_string()))?
                .outbound
                .clone();
            inner.pending.insert(
                request_id.clone(),
                PendingCall::Request {
                    connection: conn.clone(),
                    tx,
                },
            );
            if outbound
                .send(Frame::Message {
                    request_id: Some(request_id.clone()),
                    payload,
                })
                .is_err()
            {
                inner.pending.remove(&request_id);
                return Err(BusError::ConnectionLost);
            }
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::ConnectionLost),
            Err(_) => {
                self.inner.lock().unwrap().pending.remove(&request_id);
                Err(BusError::Timeout)
            }
        }
    }

    /// Streaming call: sends the request and returns the event receiver plus
    /// a cancellation handle. Zero or more deltas arrive before exactly one
    /// terminal event.
    pub fn open_stream(
        self: &Arc<Self>,
        conn: &ConnectionId,
        payload: Request,
    ) -> Result<StreamCall, BusError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = {
            let mut inner = self.inner.lock().unwrap();
            let outbound = inner
                .connections
                .get(conn)
                .ok_or_else(|| BusError::ConnectionClosed(conn.to_string()))?
                .outbound
                .clone();
            inner.pending.insert(
                request_id.clone(),
                PendingCall::Stream {
                    connection: conn.clone(),
                    tx,
                },
            );
            if outbound
                .send(Frame::Message {
                    request_id: Some(request_id.clone()),
                    payload,
                })
                .is_err()
            {
                inner.pending.remove(&request_id);
                return Err(BusError::ConnectionLost);
            }
            outbound
        };

        Ok(StreamCall {
            request_id,
            events: rx,
            outbound,
            bus: Arc::downgrade(self),
        })
    }

    /// Parse and dispatch one inbound envelope. Malformed envelopes are
    /// rejected here, before any handler runs.
    pub async fn dispatch_text(self: &Arc<Self>, conn: &ConnectionId, text: &str) {
        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => self.dispatch(conn, frame).await,
            Err(e) => {
                tracing::warn!(connection = %conn, error = %e, "Rejected malformed envelope");
                // Best-effort rejection when the envelope carried a request id.
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                    if let Some(request_id) = value.get("request_id").and_then(|v| v.as_str()) {
                        self.send_frame(
                            conn,
                            Frame::Error {
                                request_id: request_id.to_string(),
                                message: BusError::MalformedEnvelope(e.to_string()).to_string(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Dispatch one inbound frame from a connection.
    pub async fn dispatch(self: &Arc<Self>, conn: &ConnectionId, frame: Frame) {
        match frame {
            Frame::Message {
                request_id,
                payload,
            } => self.dispatch_message(conn, request_id, payload).await,
            Frame::Reply {
                request_id,
                payload,
            } => match self.take_pending(&request_id) {
                Some(PendingCall::Request { tx, .. }) => {
                    let _ = tx.send(Ok(payload));
                }
                Some(PendingCall::Stream { .. }) => {
                    tracing::warn!(%request_id, "Reply frame for a streaming call, dropping");
                }
                None => tracing::debug!(%request_id, "Reply without a pending call"),
            },
            Frame::Delta { request_id, text } => {
                let inner = self.inner.lock().unwrap();
                match inner.pending.get(&request_id) {
                    Some(PendingCall::Stream { tx, .. }) => {
                        let _ = tx.send(StreamEvent::Delta(text));
                    }
                    _ => tracing::debug!(%request_id, "Delta without a pending stream"),
                }
            }
            Frame::Done { request_id } => match self.take_pending(&request_id) {
                Some(PendingCall::Stream { tx, .. }) => {
                    let _ = tx.send(StreamEvent::Done);
                }
                Some(PendingCall::Request { tx, .. }) => {
                    let _ = tx.send(Err(BusError::MalformedEnvelope(
                        "done frame on a request/response call".to_string(),
                    )));
                }
                None => tracing::debug!(%request_id, "Done without a pending stream"),
            },
            Frame::Error {
                request_id,
                message,
            } => match self.take_pending(&request_id) {
                Some(PendingCall::Request { tx, .. }) => {
                    let _ = tx.send(Err(BusError::Remote(message)));
                }
                Some(PendingCall::Stream { tx, .. }) => {
                    let _ = tx.send(StreamEvent::Error(BusError::Remote(message)));
                }
                None => tracing::debug!(%request_id, "Error without a pending call"),
            },
            Frame::Cancel { request_id } => {
                let stream = self.inner.lock().unwrap().server_streams.remove(&request_id);
                match stream {
                    Some(stream) => stream.cancel.cancel(),
                    None => tracing::debug!(%request_id, "Cancel without an active stream"),
                }
            }
        }
    }

    async fn dispatch_message(
        self: &Arc<Self>,
        conn: &ConnectionId,
        request_id: Option<String>,
        payload: Request,
    ) {
        let channel = payload.channel();
        let request_id = if channel.is_fire_and_forget() && request_id.is_some() {
            tracing::warn!(%channel, "Request id on a fire-and-forget channel, ignoring it");
            None
        } else {
            request_id
        };

        let (handlers, outbound) = {
            let inner = self.inner.lock().unwrap();
            let handlers: Vec<HandlerFn> = inner
                .handlers
                .iter()
                .filter(|entry| {
                    entry.channel == channel
                        && match &entry.scope {
                            HandlerScope::Global => true,
                            HandlerScope::Connection(scoped) => scoped == conn,
                        }
                })
                .map(|entry| entry.handler.clone())
                .collect();
            let outbound = inner.connections.get(conn).map(|e| e.outbound.clone());
            (handlers, outbound)
        };

        let Some(outbound) = outbound else {
            tracing::debug!(connection = %conn, "Message from a closed connection, dropping");
            return;
        };

        if handlers.is_empty() {
            tracing::warn!(%channel, connection = %conn, "No handler for channel");
            if let Some(request_id) = request_id {
                let _ = outbound.send(Frame::Error {
                    request_id: request_id.clone(),
                    message: BusError::NoHandler(channel.to_string()).to_string(),
                });
            }
            return;
        }

        let cancel = if channel.is_streaming() && request_id.is_some() {
            let token = CancellationToken::new();
            self.inner.lock().unwrap().server_streams.insert(
                request_id.clone().unwrap(),
                ServerStream {
                    connection: conn.clone(),
                    cancel: token.clone(),
                },
            );
            Some(token)
        } else {
            None
        };

        let ctx = MessageContext {
            connection: conn.clone(),
            channel,
            request_id,
            outbound,
            cancel,
            bus: Arc::downgrade(self),
        };

        for handler in handlers {
            handler(payload.clone(), ctx.clone()).await;
        }
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingCall> {
        self.inner.lock().unwrap().pending.remove(request_id)
    }

    fn send_frame(&self, conn: &ConnectionId, frame: Frame) {
        let outbound = {
            let inner = self.inner.lock().unwrap();
            inner.connections.get(conn).map(|e| e.outbound.clone())
        };
        match outbound {
            Some(outbound) => {
                let _ = outbound.send(frame);
            }
            None => tracing::debug!(connection = %conn, "Dropping frame for closed connection"),
        }
    }

    fn remove_handler(&self, id: u64) {
        self.inner
            .lock()
            .unwrap()
            .handlers
            .retain(|entry| entry.id != id);
    }

    fn finish_server_stream(&self, request_id: &str) {
        self.inner.lock().unwrap().server_streams.remove(request_id);
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer for a registered handler; unregisters on drop.
pub struct HandlerGuard {
    bus: Weak<MessageBus>,
    id: u64,
}

impl HandlerGuard {
    pub fn dispose(self) {}
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_handler(self.id);
        }
    }
}

/// Per-message context handed to a handler.
#[derive(Clone)]
pub struct MessageContext {
    pub connection: ConnectionId,
    pub channel: Channel,
    request_id: Option<String>,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: Option<CancellationToken>,
    bus: Weak<MessageBus>,
}

impl MessageContext {
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Send the correlated reply for a request/response call. No-op when the
    /// inbound envelope carried no request id.
    pub fn reply(&self, payload: Reply) {
        match &self.request_id {
            Some(request_id) => {
                let _ = self.outbound.send(Frame::Reply {
                    request_id: request_id.clone(),
                    payload,
                });
            }
            None => tracing::debug!(channel = %self.channel, "Reply without a request id, dropping"),
        }
    }

    /// Reject a request/response call.
    pub fn error(&self, message: impl Into<String>) {
        if let Some(request_id) = &self.request_id {
            let _ = self.outbound.send(Frame::Error {
                request_id: request_id.clone(),
                message: message.into(),
            });
        }
    }

    /// Handle for pushing deltas and the terminal frame of a streaming call.
    /// `None` unless the message arrived on a streaming channel with a
    /// request id.
    pub fn stream(&self) -> Option<StreamHandle> {
        Some(StreamHandle {
            request_id: self.request_id.clone()?,
            outbound: self.outbound.clone(),
            cancel: self.cancel.clone()?,
            bus: self.bus.clone(),
        })
    }
}

/// Server-side handle for one streaming request.
///
/// Emission is suppressed once the call is cancelled (by the initiator, by a
/// superseding session, or by connection loss); a cancelled stream emits no
/// terminal frame.
#[derive(Clone)]
pub struct StreamHandle {
    request_id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    bus: Weak<MessageBus>,
}

impl StreamHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Token cancelled when the initiator cancels or the connection closes.
    /// Cancelling it locally also suppresses all further emission.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Push one incremental chunk.
    pub fn delta(&self, text: impl Into<String>) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.outbound.send(Frame::Delta {
            request_id: self.request_id.clone(),
            text: text.into(),
        });
    }

    /// Terminal success frame.
    pub fn done(&self) {
        if !self.is_cancelled() {
            let _ = self.outbound.send(Frame::Done {
                request_id: self.request_id.clone(),
            });
        }
        self.finish();
    }

    /// Terminal error frame.
    pub fn error(&self, message: impl Into<String>) {
        if !self.is_cancelled() {
            let _ = self.outbound.send(Frame::Error {
                request_id: self.request_id.clone(),
                message: message.into(),
            });
        }
        self.finish();
    }

    /// Release bus-side state without emitting a terminal frame. Used when a
    /// stream ends by cancellation.
    pub fn close(&self) {
        self.finish();
    }

    fn finish(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.finish_server_stream(&self.request_id);
        }
    }
}

/// Initiator-side handle for a streaming call.
pub struct StreamCall {
    pub request_id: String,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    outbound: mpsc::UnboundedSender<Frame>,
    bus: Weak<MessageBus>,
}

impl StreamCall {
    /// Send a cancellation envelope and suppress all further callbacks.
    pub fn cancel(&self) {
        let _ = self.outbound.send(Frame::Cancel {
            request_id: self.request_id.clone(),
        });
        if let Some(bus) = self.bus.upgrade() {
            bus.take_pending(&self.request_id);
        }
    }
}
