//! # Router
//!
//! The process-wide service that ties namespaces, instances, storage and
//! alarms together.
//!
//! ## Responsibilities
//!
//! - **Registry**: at most one live [`Instance`] per object id, created on
//!   the first routed call and removed on eviction.
//! - **Dispatch**: parses `{base_path}/do/{namespace}/{id}/{rest}`, checks
//!   the identifying headers, and hands the request (URI rewritten to
//!   `/{rest}?{query}`) to the instance.
//! - **Reaper**: evicts instances that stayed idle longer than their
//!   namespace's idle window.
//! - **Alarms**: owns the [`AlarmScheduler`] and is its [`AlarmTarget`].
//!
//! ## Lifecycle
//!
//! `Router::new` → `register` namespaces → `start` (reload alarms, start
//! loops) → ... → `shutdown` (stop loops, evict everything, refuse new work).

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::HeaderMap;
use http::Request;
use http::Response;
use http::StatusCode;
use http::Uri;
use http::header;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alarm;
use crate::alarm::AlarmScheduler;
use crate::alarm::AlarmTarget;
use crate::config::Config;
use crate::id;
use crate::id::IdKind;
use crate::id::ObjectId;
use crate::instance::Activity;
use crate::instance::Instance;
use crate::instance::error_response;
use crate::namespace::Namespace;
use crate::namespace::NamespaceOptions;
use crate::object::ObjectFactory;
use crate::state::State;
use crate::storage::Storage;
use crate::storage::StorageBackend;
use crate::transport::HEADER_ID;
use crate::transport::HEADER_NAME;
use crate::transport::HEADER_NAMESPACE;
use crate::transport::LocalTransport;
use crate::transport::Upgrade;
use crate::websocket::SocketTransport;

#[derive(Debug)]
pub enum Error {
    InvalidNamespace(id::Error),
    DuplicateNamespace(String),
    UnknownNamespace(String),
    Alarm(alarm::Error),
    ShutDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNamespace(e) => write!(f, "{}", e),
            Self::DuplicateNamespace(name) => write!(f, "Namespace '{}' is already registered", name),
            Self::UnknownNamespace(name) => write!(f, "Namespace '{}' is not registered", name),
            Self::Alarm(e) => write!(f, "Alarm error: {}", e),
            Self::ShutDown => write!(f, "Router is shut down"),
        }
    }
}

impl std::error::Error for Error {}

impl From<id::Error> for Error {
    fn from(e: id::Error) -> Self {
        Self::InvalidNamespace(e)
    }
}

impl From<alarm::Error> for Error {
    fn from(e: alarm::Error) -> Self {
        Self::Alarm(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct Registration {
    factory: Arc<dyn ObjectFactory>,
    idle_timeout: Duration,
}

/// A parsed routed request.
struct Route {
    registration: Arc<Registration>,
    id: ObjectId,
    request: Request<Bytes>,
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Router {
    this: Weak<Router>,
    config: Config,
    base_path: String,
    backend: Arc<dyn StorageBackend>,
    alarms: Arc<AlarmScheduler>,
    namespaces: DashMap<String, Arc<Registration>>,
    instances: DashMap<ObjectId, Arc<Instance>>,
    reaper: parking_lot::Mutex<Option<Reaper>>,
    shut_down: AtomicBool,
}

impl Router {
    pub fn new(config: Config, backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        let alarms = Arc::new(AlarmScheduler::new(backend.clone(), config.alarm_poll_interval));
        let base_path = config.base_path();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            base_path,
            backend,
            alarms,
            namespaces: DashMap::new(),
            instances: DashMap::new(),
            reaper: parking_lot::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn alarms(&self) -> &Arc<AlarmScheduler> {
        &self.alarms
    }

    /// Registers the factory for `namespace`.
    pub fn register<F>(&self, namespace: &str, factory: F, options: NamespaceOptions) -> Result<()>
    where
        F: ObjectFactory,
    {
        id::validate_namespace(namespace)?;
        let registration = Arc::new(Registration {
            factory: Arc::new(factory),
            idle_timeout: options.idle_timeout.unwrap_or(self.config.idle_timeout),
        });

        match self.namespaces.entry(namespace.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateNamespace(namespace.to_string())),
            Entry::Vacant(slot) => {
                tracing::debug!(namespace, idle_timeout = ?registration.idle_timeout, "namespace registered");
                slot.insert(registration);
                Ok(())
            }
        }
    }

    /// Client handle for a registered namespace, routed through this router.
    pub fn namespace(&self, name: &str) -> Result<Namespace> {
        if !self.namespaces.contains_key(name) {
            return Err(Error::UnknownNamespace(name.to_string()));
        }
        let transport = Arc::new(LocalTransport::from_weak(self.this.clone()));
        Ok(Namespace::new(
            name,
            transport,
            self.config.base_url.as_str(),
            self.config.request_timeout,
        )?)
    }

    /// Reloads persisted alarms and starts the alarm and reaper loops.
    pub async fn start(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        self.alarms.load().await?;

        let target: Weak<dyn AlarmTarget> = self.this.clone();
        self.alarms.start(target);
        self.start_reaper();
        tracing::debug!(base_url = %self.config.base_url, "router started");
        Ok(())
    }

    fn start_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.this.clone();
        let period = self.config.eviction_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(router) = this.upgrade() else {
                    break;
                };
                router.reap_idle().await;
            }
        });

        *reaper = Some(Reaper { cancel, handle });
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops both loops, evicts every instance and refuses further work.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let reaper = self.reaper.lock().take();
        if let Some(Reaper { cancel, handle }) = reaper {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "reaper ended abnormally");
            }
        }
        self.alarms.stop().await;

        let live: Vec<Arc<Instance>> = self.instances.iter().map(|e| e.value().clone()).collect();
        let evicted = live.len();
        for instance in live {
            if instance.begin_eviction() {
                self.finish_eviction(&instance).await;
            } else {
                instance.retired().await;
            }
        }
        tracing::debug!(evicted, "router shut down");
    }

    /// Number of instances currently in the registry.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_live(&self, id: &ObjectId) -> bool {
        self.instances.contains_key(id)
    }

    /// Evicts `id` now, after its admitted calls finish. Returns false if
    /// the instance was not live.
    pub async fn evict(&self, id: &ObjectId) -> bool {
        let Some(instance) = self.instances.get(id).map(|e| e.value().clone()) else {
            return false;
        };
        if !instance.begin_eviction() {
            instance.retired().await;
            return false;
        }
        self.finish_eviction(&instance).await;
        true
    }

    /// One reaper pass. Returns how many instances were evicted.
    pub async fn reap_idle(&self) -> usize {
        let candidates: Vec<Arc<Instance>> = self
            .instances
            .iter()
            .filter_map(|entry| {
                let idle_timeout = self
                    .namespaces
                    .get(entry.key().namespace())
                    .map_or(self.config.idle_timeout, |r| r.idle_timeout);
                let instance = entry.value();
                instance
                    .try_begin_idle_eviction(idle_timeout)
                    .then(|| instance.clone())
            })
            .collect();

        let evicted = candidates.len();
        for instance in candidates {
            self.finish_eviction(&instance).await;
        }
        evicted
    }

    async fn finish_eviction(&self, instance: &Arc<Instance>) {
        instance.teardown().await;
        let id = instance.state().id();
        self.instances
            .remove_if(id, |_, current| Arc::ptr_eq(current, instance));
        instance.retire();
    }

    /// Admits a call on the live instance for `id`, creating it if needed.
    /// A call that races an eviction waits for it and lands on a fresh
    /// instance.
    async fn acquire(&self, id: &ObjectId, registration: &Arc<Registration>) -> Activity {
        loop {
            let instance = self
                .instances
                .entry(id.clone())
                .or_insert_with(|| self.materialize(id, registration))
                .clone();
            if let Some(activity) = instance.admit() {
                return activity;
            }
            instance.retired().await;
        }
    }

    /// [`Self::acquire`] for routed requests. Returns `None` once shutdown
    /// has begun.
    ///
    /// The flag is read after the instance is registered and admitted, so
    /// either the shutdown sweep sees the instance or this call sees the flag
    /// and evicts the instance itself.
    async fn acquire_routed(&self, id: &ObjectId, registration: &Arc<Registration>) -> Option<Activity> {
        let activity = self.acquire(id, registration).await;
        if !self.is_shut_down() {
            return Some(activity);
        }

        let instance = activity.instance().clone();
        drop(activity);
        if instance.begin_eviction() {
            self.finish_eviction(&instance).await;
        }
        None
    }

    fn materialize(&self, id: &ObjectId, registration: &Registration) -> Arc<Instance> {
        let storage = Storage::new(id.clone(), self.backend.clone(), self.alarms.clone());
        let state = State::new(id.clone(), storage);
        tracing::debug!(id = %id, name = ?id.name(), "instance materialized");
        Arc::new(Instance::new(state, registration.factory.clone()))
    }

    /// Serves a routed HTTP request.
    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        if self.is_shut_down() {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "router is shut down");
        }
        if is_websocket_upgrade(request.headers()) {
            return error_response(StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade needs a socket transport");
        }
        let route = match self.route(request) {
            Ok(route) => route,
            Err(response) => return response,
        };

        let Some(activity) = self.acquire_routed(&route.id, &route.registration).await else {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "router is shut down");
        };
        activity.instance().fetch(route.request).await
    }

    /// Serves a routed WebSocket upgrade over `socket`.
    pub async fn upgrade(&self, request: Request<Bytes>, socket: Arc<dyn SocketTransport>) -> Upgrade {
        if self.is_shut_down() {
            return Upgrade::Refused(error_response(StatusCode::SERVICE_UNAVAILABLE, "router is shut down"));
        }
        let route = match self.route(request) {
            Ok(route) => route,
            Err(response) => return Upgrade::Refused(response),
        };

        let Some(activity) = self.acquire_routed(&route.id, &route.registration).await else {
            return Upgrade::Refused(error_response(StatusCode::SERVICE_UNAVAILABLE, "router is shut down"));
        };
        match activity.instance().connect(route.request, socket).await {
            Ok(upgrade) => upgrade,
            Err(e) => {
                tracing::warn!(id = %route.id, error = %e, "websocket connect failed");
                Upgrade::Refused(error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
            }
        }
    }

    fn route(&self, request: Request<Bytes>) -> std::result::Result<Route, Response<Bytes>> {
        let not_found = |msg: &str| error_response(StatusCode::NOT_FOUND, msg);
        let bad_request = |msg: String| error_response(StatusCode::BAD_REQUEST, &msg);

        let path = request.uri().path();
        let Some(routed) = path
            .strip_prefix(self.base_path.as_str())
            .and_then(|p| p.strip_prefix("/do/"))
        else {
            return Err(not_found("no route"));
        };

        let mut segments = routed.splitn(3, '/');
        let namespace = segments.next().unwrap_or_default();
        let token = segments.next().unwrap_or_default();
        let rest = segments.next().unwrap_or_default();

        let Some(registration) = self.namespaces.get(namespace).map(|r| r.value().clone()) else {
            return Err(not_found(&format!("namespace '{}' is not registered", namespace)));
        };
        let id = ObjectId::from_string(namespace, token).map_err(|e| bad_request(e.to_string()))?;

        let headers = request.headers();
        if let Some(claimed) = header_str(headers, HEADER_NAMESPACE) {
            if claimed != namespace {
                return Err(bad_request(format!("{} does not match the routed namespace", HEADER_NAMESPACE)));
            }
        }
        if let Some(claimed) = header_str(headers, HEADER_ID) {
            if ObjectId::parse(claimed).ok().as_ref() != Some(&id) {
                return Err(bad_request(format!("{} does not match the routed id", HEADER_ID)));
            }
        }
        let name = match header_str(headers, HEADER_NAME).map(urlencoding::decode) {
            Some(Ok(name)) => Some(name),
            Some(Err(e)) => return Err(bad_request(format!("{} is not valid percent-encoded UTF-8: {}", HEADER_NAME, e))),
            None => None,
        };
        if let Some(name) = name.as_deref() {
            if id.kind() != IdKind::Named || ObjectId::from_name(namespace, name) != id {
                return Err(bad_request(format!("{} does not derive the routed id", HEADER_NAME)));
            }
        }
        let id = id.with_name(name.as_deref());

        let local = match request.uri().query() {
            Some(query) => format!("/{}?{}", rest, query),
            None => format!("/{}", rest),
        };
        let uri = local
            .parse::<Uri>()
            .map_err(|e| bad_request(format!("bad path: {}", e)))?;

        let (mut parts, body) = request.into_parts();
        parts.uri = uri;

        Ok(Route {
            registration,
            id,
            request: Request::from_parts(parts, body),
        })
    }
}

#[async_trait::async_trait]
impl AlarmTarget for Router {
    // Shutdown stops the scheduler before evicting, so handlers that are
    // already due still run to completion here.
    async fn fire_alarm(&self, id: &ObjectId) -> anyhow::Result<()> {
        let registration = self
            .namespaces
            .get(id.namespace())
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::UnknownNamespace(id.namespace().to_string()))?;

        let activity = self.acquire(id, &registration).await;
        activity.instance().alarm().await?;
        Ok(())
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("base_url", &self.config.base_url)
            .field("namespaces", &self.namespaces.len())
            .field("instances", &self.instances.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::object::DurableObject;
    use crate::storage::MemoryBackend;

    struct Ticker {
        alarms: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DurableObject for Ticker {
        async fn fetch(&mut self, _request: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
            Ok(Response::new(Bytes::new()))
        }

        async fn alarm(&mut self) -> anyhow::Result<()> {
            self.alarms.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ticking_router(alarms: Arc<AtomicUsize>) -> (Arc<Router>, Arc<Registration>) {
        let router = Router::new(Config::default(), Arc::new(MemoryBackend::new()));
        router
            .register(
                "tick",
                move |_state: State| {
                    let alarms = alarms.clone();
                    async move { anyhow::Ok(Ticker { alarms }) }
                },
                NamespaceOptions::default(),
            )
            .unwrap();
        let registration = router.namespaces.get("tick").unwrap().value().clone();
        (router, registration)
    }

    #[tokio::test]
    async fn test_admission_after_shutdown_flag_evicts_itself() {
        let (router, registration) = ticking_router(Arc::new(AtomicUsize::new(0)));
        let id = ObjectId::from_name("tick", "late");

        // Flag raised after the request passed the entry check.
        router.shut_down.store(true, Ordering::SeqCst);
        assert!(router.acquire_routed(&id, &registration).await.is_none());
        assert!(!router.is_live(&id));
        assert_eq!(router.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_due_alarm_runs_while_shutting_down() {
        let alarms = Arc::new(AtomicUsize::new(0));
        let (router, _) = ticking_router(alarms.clone());
        let id = ObjectId::from_name("tick", "due");

        router.shut_down.store(true, Ordering::SeqCst);
        router.fire_alarm(&id).await.unwrap();
        assert_eq!(alarms.load(Ordering::SeqCst), 1);
    }
}
