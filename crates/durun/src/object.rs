//! # Durable Objects
//!
//! User code implements [`DurableObject`]; the runtime constructs it through
//! an [`ObjectFactory`] on the first call that reaches a cold instance and
//! keeps it until eviction. Every method runs under the instance's
//! concurrency gate, so `&mut self` is never contended.

use std::future::Future;

use bytes::Bytes;
use http::Request;
use http::Response;

use crate::state::State;
use crate::websocket::Message;
use crate::websocket::WebSocket;

#[async_trait::async_trait]
pub trait DurableObject: Send + 'static {
    /// Handles a routed HTTP request.
    async fn fetch(&mut self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>>;

    /// Runs when the instance's alarm comes due.
    async fn alarm(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles a WebSocket upgrade. Implementations usually call
    /// [`State::accept_web_socket`] and answer with `101 Switching Protocols`.
    ///
    /// Frames that arrive before acceptance are held back and replayed.
    async fn web_socket_connect(
        &mut self,
        _request: Request<Bytes>,
        _socket: WebSocket,
    ) -> anyhow::Result<Response<Bytes>> {
        anyhow::bail!("object does not accept WebSocket connections")
    }

    async fn web_socket_message(&mut self, _socket: WebSocket, _message: Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fires once when the peer closes an accepted socket.
    async fn web_socket_close(
        &mut self,
        _socket: WebSocket,
        _code: u16,
        _reason: String,
        _was_clean: bool,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn web_socket_error(&mut self, _socket: WebSocket, _error: String) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the object for a cold instance.
///
/// Construction runs under the gate, so calls that arrive meanwhile queue
/// behind it. A failed construction is reported to the triggering caller and
/// retried by the next call.
#[async_trait::async_trait]
pub trait ObjectFactory: Send + Sync + 'static {
    async fn create(&self, state: State) -> anyhow::Result<Box<dyn DurableObject>>;
}

#[async_trait::async_trait]
impl<F, Fut, O> ObjectFactory for F
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    O: DurableObject,
{
    async fn create(&self, state: State) -> anyhow::Result<Box<dyn DurableObject>> {
        let object = (self)(state).await?;
        Ok(Box::new(object))
    }
}
