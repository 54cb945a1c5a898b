//! # Namespaces
//!
//! A namespace mints identities and hands out [`Stub`]s. Name-derived ids
//! are stable across processes, so independent callers that ask for the same
//! name always reach the same instance.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::deferred::DeferredId;
use crate::id;
use crate::id::ObjectId;
use crate::stub::Stub;
use crate::transport::Transport;

/// Per-namespace settings given at registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceOptions {
    /// Overrides the router-wide idle window for this namespace.
    pub idle_timeout: Option<Duration>,
}

impl NamespaceOptions {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Client view of one registered namespace.
#[derive(Clone)]
pub struct Namespace {
    name: Arc<str>,
    transport: Arc<dyn Transport>,
    base_url: Arc<str>,
    request_timeout: Duration,
}

impl Namespace {
    pub fn new(
        name: &str,
        transport: Arc<dyn Transport>,
        base_url: impl Into<Arc<str>>,
        request_timeout: Duration,
    ) -> id::Result<Self> {
        id::validate_namespace(name)?;
        Ok(Self {
            name: Arc::from(name),
            transport,
            base_url: base_url.into(),
            request_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_from_name(&self, name: &str) -> ObjectId {
        ObjectId::from_name(&self.name, name)
    }

    pub fn new_unique_id(&self) -> ObjectId {
        ObjectId::new_unique(&self.name)
    }

    /// Parses a token produced by `ObjectId::to_string` for this namespace.
    pub fn id_from_string(&self, token: &str) -> id::Result<ObjectId> {
        ObjectId::from_string(&self.name, token)
    }

    /// Name-derived id that is computed on first use.
    pub fn deferred_id_from_name(&self, name: &str) -> DeferredId {
        let namespace = self.name.clone();
        let name = name.to_string();
        DeferredId::new(async move { Ok(ObjectId::from_name(&namespace, &name)) })
    }

    pub fn get(&self, id: ObjectId) -> Stub {
        self.get_deferred(DeferredId::resolved(id))
    }

    pub fn get_deferred(&self, id: DeferredId) -> Stub {
        Stub::new(
            self.name.clone(),
            id,
            self.transport.clone(),
            self.base_url.clone(),
            self.request_timeout,
        )
    }

    /// Shorthand for `get(id_from_name(name))`, resolving the id lazily.
    pub fn get_by_name(&self, name: &str) -> Stub {
        self.get_deferred(self.deferred_id_from_name(name))
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish()
    }
}
