//! # WebSocket Bridge
//!
//! Sits between a raw bidirectional transport connection and an instance's
//! socket handlers.
//!
//! ## Bridge States
//!
//! ```text
//! Created ──accept(tags)──► Accepted
//!    │                         │
//!    └──────────► Closed ◄─────┘
//! ```
//!
//! - **Created**: inbound frames are buffered verbatim, in arrival order.
//! - **Accepted**: buffered frames are handed to the instance in order, then
//!   later frames flow straight through.
//! - **Closed**: the bridge is removed. A transport close of an accepted
//!   bridge produces exactly one close (or error) event for the instance; a
//!   bridge dropped before acceptance disappears silently.
//!
//! Every bridge owns an event queue that is drained by a single pump task,
//! which keeps dispatch FIFO per connection. Cross-connection ordering is
//! unspecified.
//!
//! Sockets are addressed through explicit [`WebSocket`] handles that pair a
//! [`BridgeId`] with the registry holding it.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use bytes::Bytes;
use dashmap::DashMap;
use http::Response;
use tokio::sync::mpsc;

/// Close code used when a socket is torn down because its instance is evicted.
pub const CLOSE_GOING_AWAY: u16 = 1001;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide, monotonically assigned bridge identifier.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BridgeId(pub u64);

impl BridgeId {
    fn next() -> Self {
        Self(NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No live bridge with this id (never existed, or already closed).
    NotFound(BridgeId),
    /// `accept` was called twice for the same bridge.
    AlreadyAccepted(BridgeId),
    /// The operation needs an accepted bridge.
    NotAccepted(BridgeId),
    /// The transport refused the frame.
    Send { id: BridgeId, details: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "WebSocket {} not found", id),
            Self::AlreadyAccepted(id) => write!(f, "WebSocket {} was already accepted", id),
            Self::NotAccepted(id) => write!(f, "WebSocket {} has not been accepted", id),
            Self::Send { id, details } => write!(f, "Send on {} failed: {}", id, details),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A single WebSocket frame payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

/// Transport-side connection state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Callbacks into the raw connection.
///
/// Implementations enqueue frames; they must not block.
pub trait SocketTransport: Send + Sync + 'static {
    fn send(&self, message: Message) -> std::result::Result<(), String>;

    fn close(&self, code: u16, reason: &str);

    fn ready_state(&self) -> ReadyState;
}

/// Event delivered to an instance's socket handlers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    Message(Message),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
}

pub(crate) type EventReceiver = mpsc::UnboundedReceiver<SocketEvent>;

type Attachment = Arc<dyn Any + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Accepted,
}

struct Bridge {
    transport: Arc<dyn SocketTransport>,
    phase: Phase,
    pending: VecDeque<Message>,
    tags: Vec<String>,
    attachment: Option<Attachment>,
    created_at: SystemTime,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Bridge {
    fn matches(&self, tag: Option<&str>) -> bool {
        self.phase == Phase::Accepted
            && tag.is_none_or(|tag| self.tags.iter().any(|t| t == tag))
    }
}

/// All bridges belonging to one instance.
pub struct WebSocketRegistry {
    owner: Arc<str>,
    bridges: DashMap<BridgeId, Bridge>,
}

impl WebSocketRegistry {
    pub fn new(owner: impl Into<Arc<str>>) -> Self {
        Self {
            owner: owner.into(),
            bridges: DashMap::new(),
        }
    }

    /// Registers a freshly upgraded transport in the `Created` state.
    pub(crate) fn register(self: &Arc<Self>, transport: Arc<dyn SocketTransport>) -> (WebSocket, EventReceiver) {
        let id = BridgeId::next();
        let (events, receiver) = mpsc::unbounded_channel();

        self.bridges.insert(id, Bridge {
            transport,
            phase: Phase::Created,
            pending: VecDeque::new(),
            tags: Vec::new(),
            attachment: None,
            created_at: SystemTime::now(),
            events,
        });

        tracing::debug!(id = %self.owner, bridge = %id, "websocket registered");
        (WebSocket { id, registry: self.clone() }, receiver)
    }

    /// Moves a bridge to `Accepted` and replays buffered frames in order.
    pub fn accept<I, S>(&self, socket: &WebSocket, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = socket.id;
        let mut bridge = self.bridges.get_mut(&id).ok_or(Error::NotFound(id))?;
        if bridge.phase == Phase::Accepted {
            return Err(Error::AlreadyAccepted(id));
        }

        bridge.phase = Phase::Accepted;
        bridge.tags = tags.into_iter().map(Into::into).collect();

        let replayed = bridge.pending.len();
        while let Some(message) = bridge.pending.pop_front() {
            // The pump only goes away together with the bridge.
            let _ = bridge.events.send(SocketEvent::Message(message));
        }

        tracing::debug!(
            id = %self.owner,
            bridge = %id,
            tags = ?bridge.tags,
            replayed,
            "websocket accepted"
        );
        Ok(())
    }

    /// Inbound frame from the transport.
    pub(crate) fn on_message(&self, id: BridgeId, message: Message) {
        let Some(mut bridge) = self.bridges.get_mut(&id) else {
            tracing::debug!(id = %self.owner, bridge = %id, "frame for closed websocket dropped");
            return;
        };
        match bridge.phase {
            Phase::Created => bridge.pending.push_back(message),
            Phase::Accepted => {
                let _ = bridge.events.send(SocketEvent::Message(message));
            }
        }
    }

    /// Transport reported a close. Removes the bridge; notifies the instance
    /// only if the bridge had been accepted.
    pub(crate) fn on_close(&self, id: BridgeId, code: u16, reason: &str, was_clean: bool) {
        self.remove_with_event(id, SocketEvent::Close {
            code,
            reason: reason.to_string(),
            was_clean,
        });
    }

    /// Transport reported an error. Same removal rules as [`Self::on_close`].
    pub(crate) fn on_error(&self, id: BridgeId, error: &str) {
        self.remove_with_event(id, SocketEvent::Error(error.to_string()));
    }

    /// Forgets a bridge without touching the transport or the instance.
    pub(crate) fn discard(&self, id: BridgeId) {
        self.bridges.remove(&id);
    }

    fn remove_with_event(&self, id: BridgeId, event: SocketEvent) {
        let Some((_, bridge)) = self.bridges.remove(&id) else {
            return;
        };
        match bridge.phase {
            Phase::Accepted => {
                let _ = bridge.events.send(event);
            }
            Phase::Created => {
                tracing::debug!(
                    id = %self.owner,
                    bridge = %id,
                    dropped = bridge.pending.len(),
                    "websocket closed before acceptance"
                );
            }
        }
    }

    /// Accepted sockets, optionally restricted to those carrying `tag`.
    pub fn get_web_sockets(self: &Arc<Self>, tag: Option<&str>) -> Vec<WebSocket> {
        let mut ids: Vec<BridgeId> = self
            .bridges
            .iter()
            .filter(|entry| entry.value().matches(tag))
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids.into_iter()
            .map(|id| WebSocket { id, registry: self.clone() })
            .collect()
    }

    /// Sends to every open accepted socket matching `tag`. Best effort:
    /// sockets that are not open or refuse the frame are skipped.
    ///
    /// Returns how many sockets took the frame.
    pub fn broadcast(&self, message: &Message, tag: Option<&str>) -> usize {
        let targets: Vec<(BridgeId, Arc<dyn SocketTransport>)> = self
            .bridges
            .iter()
            .filter(|entry| entry.value().matches(tag))
            .map(|entry| (*entry.key(), entry.value().transport.clone()))
            .collect();

        let mut delivered = 0;
        for (id, transport) in targets {
            if transport.ready_state() != ReadyState::Open {
                continue;
            }
            match transport.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(id = %self.owner, bridge = %id, error = %e, "broadcast skipped"),
            }
        }
        delivered
    }

    /// Force-closes every bridge. Idempotent: a second call finds nothing.
    ///
    /// Instance close handlers are not invoked for sockets closed this way.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let ids: Vec<BridgeId> = self.bridges.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, bridge)) = self.bridges.remove(&id) {
                if bridge.transport.ready_state() != ReadyState::Closed {
                    bridge.transport.close(code, reason);
                }
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::debug!(id = %self.owner, closed, code, "closed all websockets");
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    pub fn accepted_count(&self) -> usize {
        self.bridges
            .iter()
            .filter(|entry| entry.value().phase == Phase::Accepted)
            .count()
    }

    fn with_bridge<R>(&self, id: BridgeId, f: impl FnOnce(&Bridge) -> R) -> Result<R> {
        self.bridges
            .get(&id)
            .map(|bridge| f(bridge.value()))
            .ok_or(Error::NotFound(id))
    }

    fn with_bridge_mut<R>(&self, id: BridgeId, f: impl FnOnce(&mut Bridge) -> R) -> Result<R> {
        self.bridges
            .get_mut(&id)
            .map(|mut bridge| f(bridge.value_mut()))
            .ok_or(Error::NotFound(id))
    }
}

impl fmt::Debug for WebSocketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketRegistry")
            .field("owner", &self.owner)
            .field("bridges", &self.bridges.len())
            .finish()
    }
}

/// Handle to one bridged socket, as seen by instance code.
#[derive(Clone)]
pub struct WebSocket {
    id: BridgeId,
    registry: Arc<WebSocketRegistry>,
}

impl WebSocket {
    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Sends a frame on an accepted socket.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        let id = self.id;
        let transport = self.registry.with_bridge(id, |bridge| {
            (bridge.phase == Phase::Accepted).then(|| bridge.transport.clone())
        })?;
        let transport = transport.ok_or(Error::NotAccepted(id))?;
        transport
            .send(message.into())
            .map_err(|details| Error::Send { id, details })
    }

    /// Closes the socket from the server side and forgets the bridge.
    ///
    /// The instance's close handler does not run for server-initiated closes.
    pub fn close(&self, code: u16, reason: &str) {
        if let Some((_, bridge)) = self.registry.bridges.remove(&self.id) {
            bridge.transport.close(code, reason);
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.registry
            .with_bridge(self.id, |bridge| bridge.transport.ready_state())
            .unwrap_or(ReadyState::Closed)
    }

    pub fn is_accepted(&self) -> bool {
        self.registry
            .with_bridge(self.id, |bridge| bridge.phase == Phase::Accepted)
            .unwrap_or(false)
    }

    /// Tags given at acceptance.
    pub fn tags(&self) -> Vec<String> {
        self.registry
            .with_bridge(self.id, |bridge| bridge.tags.clone())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<SystemTime> {
        self.registry.with_bridge(self.id, |bridge| bridge.created_at).ok()
    }

    /// Stores per-connection context that later handlers can recover.
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.registry.with_bridge_mut(self.id, |bridge| {
            bridge.attachment = Some(Arc::new(value));
        })
    }

    /// Returns the attachment if one of type `T` was stored.
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let attachment = self
            .registry
            .with_bridge(self.id, |bridge| bridge.attachment.clone())
            .ok()
            .flatten()?;
        attachment.downcast::<T>().ok()
    }

    pub fn clear_attachment(&self) -> Result<()> {
        self.registry
            .with_bridge_mut(self.id, |bridge| bridge.attachment = None)
    }
}

impl PartialEq for WebSocket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WebSocket {}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket").field("id", &self.id).finish()
    }
}

/// The transport's end of an upgraded connection.
///
/// The component that owns the raw socket pushes frames and lifecycle
/// events in through this handle.
pub struct SocketSession {
    id: BridgeId,
    registry: Arc<WebSocketRegistry>,
    response: Response<Bytes>,
}

impl SocketSession {
    pub(crate) fn new(socket: &WebSocket, response: Response<Bytes>) -> Self {
        Self {
            id: socket.id,
            registry: socket.registry.clone(),
            response,
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// The upgrade response returned by the instance.
    pub fn response(&self) -> &Response<Bytes> {
        &self.response
    }

    pub fn on_message(&self, message: impl Into<Message>) {
        self.registry.on_message(self.id, message.into());
    }

    pub fn on_close(&self, code: u16, reason: &str, was_clean: bool) {
        self.registry.on_close(self.id, code, reason, was_clean);
    }

    pub fn on_error(&self, error: &str) {
        self.registry.on_error(self.id, error);
    }
}

impl fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSession")
            .field("id", &self.id)
            .field("status", &self.response.status())
            .finish()
    }
}
