//! # Live Instances
//!
//! One [`Instance`] per warm object id. It owns the [`State`], the lazily
//! constructed object, and the lifecycle that decides when the instance may
//! take calls.
//!
//! ## Lifecycle
//!
//! ```text
//! Live ──(idle or forced)──► Evicting ──(teardown done)──► Retired
//! ```
//!
//! Calls are admitted only while `Live`. Each admitted call holds an
//! [`Activity`] guard, and the in-flight count is published on a `watch`
//! channel together with the phase, so eviction can wait for admitted calls
//! and refused callers can wait for retirement before retrying elsewhere.
//!
//! Every call into the object runs under the concurrency gate. Construction
//! happens inside the first call that finds the object slot empty; a failed
//! construction leaves the slot empty and is retried by the next call. A
//! panicking handler empties the slot as well, so the next call rebuilds the
//! object from storage.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::Request;
use http::Response;
use http::StatusCode;
use tokio::sync::Mutex;
use tokio::sync::watch;

use crate::object::DurableObject;
use crate::object::ObjectFactory;
use crate::state::State;
use crate::tasks::panic_message;
use crate::transport::Upgrade;
use crate::websocket::CLOSE_GOING_AWAY;
use crate::websocket::EventReceiver;
use crate::websocket::SocketEvent;
use crate::websocket::SocketSession;
use crate::websocket::SocketTransport;
use crate::websocket::WebSocket;

#[derive(Debug)]
pub enum Error {
    /// The factory failed to build the object.
    Constructor(anyhow::Error),
    /// The handler returned an error.
    Handler(anyhow::Error),
    /// The handler or constructor panicked; the object was discarded.
    Panicked(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructor(e) => write!(f, "Object construction failed: {:#}", e),
            Self::Handler(e) => write!(f, "Handler failed: {:#}", e),
            Self::Panicked(msg) => write!(f, "Handler panicked: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Live,
    Evicting,
    Retired,
}

#[derive(Copy, Clone, Debug)]
struct Lifecycle {
    phase: Phase,
    in_flight: usize,
}

type Slot = Option<Box<dyn DurableObject>>;

pub(crate) struct Instance {
    state: State,
    factory: Arc<dyn ObjectFactory>,
    object: Mutex<Slot>,
    lifecycle: watch::Sender<Lifecycle>,
    last_active: parking_lot::Mutex<Instant>,
}

impl Instance {
    pub(crate) fn new(state: State, factory: Arc<dyn ObjectFactory>) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle {
            phase: Phase::Live,
            in_flight: 0,
        });
        Self {
            state,
            factory,
            object: Mutex::new(None),
            lifecycle,
            last_active: parking_lot::Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn phase(&self) -> Phase {
        self.lifecycle.borrow().phase
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lifecycle.borrow().in_flight
    }

    /// Admits one call, or returns `None` once eviction has begun.
    pub(crate) fn admit(self: &Arc<Self>) -> Option<Activity> {
        let admitted = self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.phase != Phase::Live {
                return false;
            }
            lifecycle.in_flight += 1;
            true
        });
        if !admitted {
            return None;
        }
        self.touch();
        Some(Activity {
            instance: self.clone(),
        })
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// Runs `call` against the object under the gate, constructing the
    /// object first if needed.
    pub(crate) async fn invoke<T, F>(&self, call: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn DurableObject) -> BoxFuture<'a, anyhow::Result<T>> + Send,
        T: Send,
    {
        self.state
            .gate()
            .run(|| async move {
                let mut slot = self.object.lock().await;
                let object = match slot.take() {
                    Some(object) => object,
                    None => self.construct().await?,
                };
                let object = slot.insert(object);

                match AssertUnwindSafe(call(object.as_mut())).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Error::Handler(e)),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(id = %self.state.id(), panic = %message, "handler panicked, discarding object");
                        *slot = None;
                        Err(Error::Panicked(message))
                    }
                }
            })
            .await
    }

    async fn construct(&self) -> Result<Box<dyn DurableObject>> {
        let id = self.state.id();
        match AssertUnwindSafe(self.factory.create(self.state.clone())).catch_unwind().await {
            Ok(Ok(object)) => {
                tracing::debug!(id = %id, "object constructed");
                Ok(object)
            }
            Ok(Err(e)) => {
                tracing::warn!(id = %id, error = %e, "object construction failed");
                Err(Error::Constructor(e))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(id = %id, panic = %message, "object constructor panicked");
                Err(Error::Panicked(message))
            }
        }
    }

    /// Routes an HTTP request to the object's `fetch` handler. Failures
    /// become a `500` response.
    pub(crate) async fn fetch(&self, request: Request<Bytes>) -> Response<Bytes> {
        match self.invoke(move |object| object.fetch(request)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(id = %self.state.id(), error = %e, "fetch failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    pub(crate) async fn alarm(&self) -> Result<()> {
        self.invoke(|object| object.alarm()).await
    }

    /// Bridges an upgraded transport into the object.
    ///
    /// The object's connect handler decides acceptance. If it answers with
    /// anything but `101`, the bridge is dropped without notifying anyone.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        request: Request<Bytes>,
        transport: Arc<dyn SocketTransport>,
    ) -> Result<Upgrade> {
        let (socket, events) = self.state.sockets().register(transport);
        let handle = socket.clone();

        let response = match self.invoke(move |object| object.web_socket_connect(request, handle)).await {
            Ok(response) => response,
            Err(e) => {
                self.state.sockets().discard(socket.id());
                return Err(e);
            }
        };

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            self.state.sockets().discard(socket.id());
            return Ok(Upgrade::Refused(response));
        }
        self.spawn_pump(socket.clone(), events);
        Ok(Upgrade::Connected(SocketSession::new(&socket, response)))
    }

    /// One pump per connection keeps socket events FIFO. The pump ends when
    /// the bridge is removed, which drops the event sender.
    fn spawn_pump(self: &Arc<Self>, socket: WebSocket, mut events: EventReceiver) {
        let instance = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(_activity) = instance.admit() else {
                    tracing::debug!(id = %instance.state.id(), bridge = %socket.id(), "instance retiring, socket events dropped");
                    break;
                };

                let target = socket.clone();
                let outcome = match event {
                    SocketEvent::Message(message) => {
                        instance
                            .invoke(move |object| object.web_socket_message(target, message))
                            .await
                    }
                    SocketEvent::Close { code, reason, was_clean } => {
                        instance
                            .invoke(move |object| object.web_socket_close(target, code, reason, was_clean))
                            .await
                    }
                    SocketEvent::Error(error) => {
                        instance
                            .invoke(move |object| object.web_socket_error(target, error))
                            .await
                    }
                };

                if let Err(e) = outcome {
                    tracing::warn!(id = %instance.state.id(), bridge = %socket.id(), error = %e, "socket handler failed");
                }
            }
        });
    }

    /// Marks the instance `Evicting` if it has been quiet for `idle_timeout`:
    /// no admitted calls, no accepted sockets, no background tasks.
    pub(crate) fn try_begin_idle_eviction(&self, idle_timeout: Duration) -> bool {
        if self.state.sockets().accepted_count() > 0 || !self.state.tasks().is_empty() {
            return false;
        }
        if self.last_active.lock().elapsed() < idle_timeout {
            return false;
        }
        self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.phase != Phase::Live || lifecycle.in_flight > 0 {
                return false;
            }
            lifecycle.phase = Phase::Evicting;
            true
        })
    }

    /// Stops admitting calls. Returns false if eviction already began.
    pub(crate) fn begin_eviction(&self) -> bool {
        self.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.phase != Phase::Live {
                return false;
            }
            lifecycle.phase = Phase::Evicting;
            true
        })
    }

    /// Tears down an `Evicting` instance: waits for admitted calls, drains
    /// background work, closes every socket, then drops the object.
    /// Persisted storage is untouched.
    pub(crate) async fn teardown(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|l| l.in_flight == 0).await;

        self.state.tasks().drain().await;
        let closed = self.state.sockets().close_all(CLOSE_GOING_AWAY, "instance evicted");

        let object = self
            .state
            .gate()
            .run(|| async move { self.object.lock().await.take() })
            .await;

        tracing::debug!(
            id = %self.state.id(),
            closed_sockets = closed,
            constructed = object.is_some(),
            "instance evicted"
        );
    }

    pub(crate) fn retire(&self) {
        self.lifecycle.send_modify(|lifecycle| lifecycle.phase = Phase::Retired);
    }

    pub(crate) async fn retired(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|l| l.phase == Phase::Retired).await;
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = *self.lifecycle.borrow();
        f.debug_struct("Instance")
            .field("id", self.state.id())
            .field("phase", &lifecycle.phase)
            .field("in_flight", &lifecycle.in_flight)
            .finish()
    }
}

/// An admitted call. Keeps the instance from being torn down until dropped.
pub(crate) struct Activity {
    instance: Arc<Instance>,
}

impl Activity {
    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        self.instance.touch();
        self.instance
            .lifecycle
            .send_modify(|lifecycle| lifecycle.in_flight -= 1);
    }
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::alarm::AlarmScheduler;
    use crate::id::ObjectId;
    use crate::storage::MemoryBackend;
    use crate::storage::Storage;
    use crate::websocket::Message;
    use crate::websocket::tests::RecordingTransport;

    struct Counter {
        state: State,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl DurableObject for Counter {
        async fn fetch(&mut self, request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
            match request.uri().path() {
                "/panic" => panic!("requested panic"),
                "/fail" => anyhow::bail!("requested failure"),
                _ => {}
            }
            let storage = self.state.storage();
            let next = storage
                .get_string("count")
                .await?
                .map_or(Ok(0), |v| v.parse::<u64>())?
                + 1;
            storage.put("count", next.to_string()).await?;
            Ok(Response::new(Bytes::from(next.to_string())))
        }

        async fn web_socket_connect(
            &mut self,
            request: Request<Bytes>,
            socket: WebSocket,
        ) -> anyhow::Result<Response<Bytes>> {
            if request.uri().path() == "/reject" {
                return Ok(error_response(StatusCode::FORBIDDEN, "no"));
            }
            self.state.accept_web_socket(&socket, ["room"])?;
            Ok(error_response(StatusCode::SWITCHING_PROTOCOLS, ""))
        }

        async fn web_socket_message(&mut self, _socket: WebSocket, message: Message) -> anyhow::Result<()> {
            self.log.lock().push(format!("msg:{}", message.as_text().unwrap_or("<binary>")));
            Ok(())
        }

        async fn web_socket_close(
            &mut self,
            _socket: WebSocket,
            code: u16,
            _reason: String,
            _was_clean: bool,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("close:{}", code));
            Ok(())
        }
    }

    struct Fixture {
        instance: Arc<Instance>,
        constructed: Arc<AtomicUsize>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    fn fixture(fail_first_construction: bool) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let alarms = Arc::new(AlarmScheduler::new(backend.clone(), Duration::from_millis(10)));
        let id = ObjectId::from_name("counters", "a");
        let state = State::new(id.clone(), Storage::new(id, backend, alarms));

        let constructed = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let factory = {
            let constructed = constructed.clone();
            let log = log.clone();
            move |state: State| {
                let attempt = constructed.fetch_add(1, Ordering::SeqCst);
                let log = log.clone();
                async move {
                    if fail_first_construction && attempt == 0 {
                        anyhow::bail!("storage not ready");
                    }
                    Ok(Counter { state, log })
                }
            }
        };

        Fixture {
            instance: Arc::new(Instance::new(state, Arc::new(factory))),
            constructed,
            log,
        }
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_object_constructed_once_and_kept() {
        let fx = fixture(false);
        for expected in ["1", "2", "3"] {
            let response = fx.instance.fetch(get("/")).await;
            assert_eq!(response.body().as_ref(), expected.as_bytes());
        }
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_constructor_failure_is_retried() {
        let fx = fixture(true);
        let err = fx.instance.invoke(|object| object.fetch(get("/"))).await.unwrap_err();
        assert!(matches!(err, Error::Constructor(_)));

        let response = fx.instance.fetch(get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_errors_become_500() {
        let fx = fixture(false);
        let response = fx.instance.fetch(get("/fail")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_discards_object_but_keeps_storage() {
        let fx = fixture(false);
        fx.instance.fetch(get("/")).await;

        let response = fx.instance.fetch(get("/panic")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!fx.instance.state().gate().is_closed());

        let response = fx.instance.fetch(get("/")).await;
        assert_eq!(response.body().as_ref(), b"2");
        assert_eq!(fx.constructed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_admission_closes_on_eviction() {
        let fx = fixture(false);
        let activity = fx.instance.admit().unwrap();
        assert_eq!(fx.instance.in_flight(), 1);
        assert!(!fx.instance.try_begin_idle_eviction(Duration::ZERO));

        drop(activity);
        assert_eq!(fx.instance.in_flight(), 0);
        assert!(fx.instance.try_begin_idle_eviction(Duration::ZERO));
        assert_eq!(fx.instance.phase(), Phase::Evicting);
        assert!(fx.instance.admit().is_none());

        fx.instance.teardown().await;
        fx.instance.retire();
        fx.instance.retired().await;
        assert_eq!(fx.instance.phase(), Phase::Retired);
    }

    #[tokio::test]
    async fn test_idle_window_respected() {
        let fx = fixture(false);
        fx.instance.fetch(get("/")).await;
        assert!(!fx.instance.try_begin_idle_eviction(Duration::from_secs(60)));
        assert_eq!(fx.instance.phase(), Phase::Live);
    }

    #[tokio::test]
    async fn test_socket_events_flow_and_teardown_closes() {
        let fx = fixture(false);
        let transport = RecordingTransport::new();
        let upgrade = fx.instance.connect(get("/ws"), transport.clone()).await.unwrap();
        assert_eq!(upgrade.status(), StatusCode::SWITCHING_PROTOCOLS);
        let session = upgrade.into_session().unwrap();

        session.on_message("a");
        session.on_message("b");
        for _ in 0..100 {
            if fx.log.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*fx.log.lock(), vec!["msg:a".to_string(), "msg:b".to_string()]);
        assert!(!fx.instance.try_begin_idle_eviction(Duration::ZERO));

        assert!(fx.instance.begin_eviction());
        fx.instance.teardown().await;
        assert_eq!(*transport.closed.lock(), Some((CLOSE_GOING_AWAY, "instance evicted".to_string())));
        // Server-initiated close: no close handler.
        assert_eq!(fx.log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_drops_bridge() {
        let fx = fixture(false);
        let upgrade = fx
            .instance
            .connect(get("/reject"), RecordingTransport::new())
            .await
            .unwrap();
        assert!(matches!(upgrade, Upgrade::Refused(ref response) if response.status() == StatusCode::FORBIDDEN));
        assert!(fx.instance.state().sockets().is_empty());
    }
}
