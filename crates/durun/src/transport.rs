//! # Routing Transport
//!
//! Moves routed requests from a [`Stub`](crate::stub::Stub) to the router.
//!
//! ## Philosophy
//!
//! - **Opaque**: the transport forwards HTTP requests and responses without
//!   interpreting them. Whatever the instance answers, including 4xx/5xx,
//!   comes back as `Ok`.
//! - **Distinct failures**: `Err` means the router could not be reached at
//!   all. Callers can retry those; application errors are not retry-safe.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use bytes::Bytes;
use http::Request;
use http::Response;

use crate::router::Router;
use crate::websocket::SocketSession;
use crate::websocket::SocketTransport;

/// Namespace of the target instance.
pub const HEADER_NAMESPACE: &str = "x-do-namespace";
/// Serialized id token of the target instance.
pub const HEADER_ID: &str = "x-do-id";
/// Name the id was derived from, when known.
pub const HEADER_NAME: &str = "x-do-name";

/// Errors that occur between the caller and the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The router is unreachable or shutting down.
    ConnectionLost(String),
    /// No response arrived within the request timeout.
    Timeout,
    /// Internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outcome of a WebSocket upgrade.
#[derive(Debug)]
pub enum Upgrade {
    /// The instance took the connection; frames flow through the session.
    Connected(SocketSession),
    /// The upgrade was answered with a plain HTTP response.
    Refused(Response<Bytes>),
}

impl Upgrade {
    pub fn status(&self) -> http::StatusCode {
        match self {
            Self::Connected(session) => session.response().status(),
            Self::Refused(response) => response.status(),
        }
    }

    pub fn into_session(self) -> Option<SocketSession> {
        match self {
            Self::Connected(session) => Some(session),
            Self::Refused(_) => None,
        }
    }
}

/// Carries routed calls to a router.
///
/// Object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a request and waits for the instance's response.
    async fn call(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;

    /// Sends an upgrade request together with the raw socket to bridge.
    async fn upgrade(&self, request: Request<Bytes>, socket: Arc<dyn SocketTransport>) -> Result<Upgrade>;
}

/// In-process transport to a [`Router`].
///
/// Every call runs on its own task, so a caller that gives up does not
/// cancel work the instance has already started.
#[derive(Clone)]
pub struct LocalTransport {
    router: Weak<Router>,
}

impl LocalTransport {
    pub fn new(router: &Arc<Router>) -> Self {
        Self::from_weak(Arc::downgrade(router))
    }

    pub(crate) fn from_weak(router: Weak<Router>) -> Self {
        Self { router }
    }

    fn router(&self) -> Result<Arc<Router>> {
        let router = self
            .router
            .upgrade()
            .ok_or_else(|| TransportError::ConnectionLost("router dropped".into()))?;
        if router.is_shut_down() {
            return Err(TransportError::ConnectionLost("router shut down".into()));
        }
        Ok(router)
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let router = self.router()?;
        tokio::spawn(async move { router.handle(request).await })
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn upgrade(&self, request: Request<Bytes>, socket: Arc<dyn SocketTransport>) -> Result<Upgrade> {
        let router = self.router()?;
        tokio::spawn(async move { router.upgrade(request, socket).await })
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("connected", &(self.router.strong_count() > 0))
            .finish()
    }
}
