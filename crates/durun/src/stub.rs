//! # Stubs
//!
//! Client-side handle to a possibly cold instance. Creating a stub never
//! fails and never touches the router; the instance materializes when the
//! first request arrives.
//!
//! A request sent through a stub is rewritten to the routed form
//! `{base_url}/do/{namespace}/{id}/{path}` and tagged with the identifying
//! headers before it is handed to the [`Transport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderValue;
use http::Request;
use http::Response;
use http::Uri;

use crate::deferred;
use crate::deferred::DeferredId;
use crate::id::ObjectId;
use crate::transport::HEADER_ID;
use crate::transport::HEADER_NAME;
use crate::transport::HEADER_NAMESPACE;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::transport::Upgrade;
use crate::websocket::SocketTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The stub's id is not resolved yet, or failed to resolve.
    UnresolvedId(deferred::Error),
    /// The router could not be reached, or did not answer in time.
    RoutingUnavailable(TransportError),
    /// The outgoing request could not be turned into a routed request.
    InvalidRequest(String),
}

impl Error {
    /// Whether the request certainly never reached the instance.
    ///
    /// A timed-out call keeps running on the instance after the caller
    /// stops waiting, so timeouts are not retry-safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RoutingUnavailable(TransportError::ConnectionLost(_)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedId(e) => write!(f, "{}", e),
            Self::RoutingUnavailable(e) => write!(f, "Routing unavailable: {}", e),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnresolvedId(e) => Some(e),
            Self::RoutingUnavailable(e) => Some(e),
            Self::InvalidRequest(_) => None,
        }
    }
}

impl From<deferred::Error> for Error {
    fn from(e: deferred::Error) -> Self {
        Self::UnresolvedId(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::RoutingUnavailable(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Routing handle for one object id.
#[derive(Clone)]
pub struct Stub {
    namespace: Arc<str>,
    id: Arc<DeferredId>,
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
    timeout: Duration,
}

impl Stub {
    pub(crate) fn new(
        namespace: Arc<str>,
        id: DeferredId,
        transport: Arc<dyn Transport>,
        base_url: Arc<str>,
        timeout: Duration,
    ) -> Self {
        Self {
            namespace,
            id: Arc::new(id),
            transport,
            base_url,
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The target id. Fails until a name-based id has been resolved.
    pub fn id(&self) -> Result<&ObjectId> {
        Ok(self.id.get()?)
    }

    /// Resolves the target id, running the deferred resolver if needed.
    pub async fn resolve_id(&self) -> Result<&ObjectId> {
        Ok(self.id.resolve().await?)
    }

    /// Sends `request` to the instance and returns its response unmodified.
    ///
    /// Only the path and query of the request URI are kept.
    pub async fn fetch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let routed = self.route(request).await?;
        let call = self.transport.call(routed);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::RoutingUnavailable(TransportError::Timeout)),
        }
    }

    /// Opens a WebSocket to the instance over `socket`.
    pub async fn connect(&self, request: Request<Bytes>, socket: Arc<dyn SocketTransport>) -> Result<Upgrade> {
        let routed = self.route(request).await?;
        let upgrade = self.transport.upgrade(routed, socket);
        match tokio::time::timeout(self.timeout, upgrade).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::RoutingUnavailable(TransportError::Timeout)),
        }
    }

    async fn route(&self, request: Request<Bytes>) -> Result<Request<Bytes>> {
        let id = self.resolve_id().await?;
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let routed = format!(
            "{}/do/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.namespace,
            id,
            path_and_query.trim_start_matches('/')
        );
        parts.uri = routed
            .parse::<Uri>()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        parts.headers.insert(HEADER_NAMESPACE, header_value(&self.namespace)?);
        parts.headers.insert(HEADER_ID, header_value(&id.to_string())?);
        match id.name() {
            Some(name) => {
                parts.headers.insert(HEADER_NAME, header_value(&urlencoding::encode(name))?);
            }
            None => {
                parts.headers.remove(HEADER_NAME);
            }
        }

        Ok(Request::from_parts(parts, body))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::InvalidRequest(format!("{:?}: {}", value, e)))
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("namespace", &self.namespace)
            .field("id", &self.id)
            .finish()
    }
}
