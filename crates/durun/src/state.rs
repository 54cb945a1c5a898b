//! # Instance State
//!
//! The runtime context handed to an object's factory: identity, storage,
//! concurrency gate, background tasks and the WebSocket registry. Cheap to
//! clone; every clone refers to the same instance.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::gate::Gate;
use crate::id::ObjectId;
use crate::storage::Storage;
use crate::tasks::BackgroundTasks;
use crate::websocket;
use crate::websocket::Message;
use crate::websocket::WebSocket;
use crate::websocket::WebSocketRegistry;

#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

struct StateInner {
    id: ObjectId,
    storage: Storage,
    gate: Gate,
    tasks: BackgroundTasks,
    sockets: Arc<WebSocketRegistry>,
}

impl State {
    pub(crate) fn new(id: ObjectId, storage: Storage) -> Self {
        let owner: Arc<str> = Arc::from(id.to_string());
        Self {
            inner: Arc::new(StateInner {
                id,
                storage,
                gate: Gate::new(),
                tasks: BackgroundTasks::new(owner.clone()),
                sockets: Arc::new(WebSocketRegistry::new(owner)),
            }),
        }
    }

    /// The instance's id. Its name is the one carried by the call that
    /// materialized the instance, and stays fixed until eviction. An
    /// instance first woken by an alarm or a bare id token has no name,
    /// even if later calls know it.
    pub fn id(&self) -> &ObjectId {
        &self.inner.id
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Runs `f` with exclusive access to this instance.
    ///
    /// Requests, alarms and socket events for the instance wait until `f`
    /// resolves. From inside a handler the closure runs immediately, since
    /// the handler already holds the gate.
    pub async fn block_concurrency_while<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.inner.gate.run(f).await
    }

    /// Registers work that must finish before the instance can be evicted.
    /// Errors and panics are logged, never returned.
    pub fn wait_until<F>(&self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.tasks.wait_until(task);
    }

    /// Accepts an upgraded socket, replaying frames that arrived earlier.
    pub fn accept_web_socket<I, S>(&self, socket: &WebSocket, tags: I) -> websocket::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.sockets.accept(socket, tags)
    }

    /// Accepted sockets; with a tag, only those carrying it.
    pub fn get_web_sockets(&self, tag: Option<&str>) -> Vec<WebSocket> {
        self.inner.sockets.get_web_sockets(tag)
    }

    pub fn get_tags(&self, socket: &WebSocket) -> Vec<String> {
        socket.tags()
    }

    /// Best-effort send to every open accepted socket matching `tag`.
    pub fn broadcast(&self, message: impl Into<Message>, tag: Option<&str>) -> usize {
        self.inner.sockets.broadcast(&message.into(), tag)
    }

    pub fn close_all_web_sockets(&self, code: u16, reason: &str) -> usize {
        self.inner.sockets.close_all(code, reason)
    }

    /// Background tasks that have not settled yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub(crate) fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    pub(crate) fn sockets(&self) -> &Arc<WebSocketRegistry> {
        &self.inner.sockets
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.inner.id)
            .field("tasks", &self.inner.tasks.len())
            .field("sockets", &self.inner.sockets.len())
            .finish()
    }
}
