//! # Deferred Identity
//!
//! A resolve-once wrapper for identities whose minting is asynchronous.
//!
//! Binding APIs such as `Namespace::get_by_name` hand out a stub immediately;
//! the identity behind it is computed the first time someone awaits it.
//! Inspecting the id before that is a programming error and fails loudly
//! with [`Error::UnresolvedId`] rather than blocking.

use std::fmt;
use std::future::Future;
use std::task::Poll;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::id;
use crate::id::ObjectId;

/// Observable resolution state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Unresolved,
    Resolving,
    Resolved,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::Resolving => write!(f, "resolving"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The id was inspected before it finished resolving.
    UnresolvedId(Resolution),
    /// Resolution itself failed.
    Resolution(id::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedId(state) => write!(f, "Id used before resolution (state: {})", state),
            Self::Resolution(e) => write!(f, "Id resolution failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolution(e) => Some(e),
            _ => None,
        }
    }
}

impl From<id::Error> for Error {
    fn from(e: id::Error) -> Self {
        Self::Resolution(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Resolver = BoxFuture<'static, id::Result<ObjectId>>;

enum Phase {
    Unresolved(Resolver),
    Resolving,
    Resolved,
    Failed(id::Error),
}

/// An identity that becomes available after its resolver runs once.
pub struct DeferredId {
    phase: Mutex<Phase>,
    cell: OnceCell<ObjectId>,
}

impl DeferredId {
    /// Wraps a resolver that will be polled at most once.
    pub fn new<F>(resolver: F) -> Self
    where
        F: Future<Output = id::Result<ObjectId>> + Send + 'static,
    {
        Self {
            phase: Mutex::new(Phase::Unresolved(Box::pin(resolver))),
            cell: OnceCell::new(),
        }
    }

    /// Wraps an identity that is already known.
    pub fn resolved(id: ObjectId) -> Self {
        Self {
            phase: Mutex::new(Phase::Resolved),
            cell: OnceCell::new_with(Some(id)),
        }
    }

    pub fn state(&self) -> Resolution {
        if self.cell.initialized() {
            return Resolution::Resolved;
        }
        match &*self.phase.lock() {
            Phase::Resolving => Resolution::Resolving,
            Phase::Resolved => Resolution::Resolved,
            Phase::Unresolved(_) | Phase::Failed(_) => Resolution::Unresolved,
        }
    }

    /// Returns the identity if resolution has completed.
    pub fn get(&self) -> Result<&ObjectId> {
        self.cell
            .get()
            .ok_or_else(|| Error::UnresolvedId(self.state()))
    }

    /// Drives resolution, or waits on whoever is already driving it.
    pub async fn resolve(&self) -> Result<&ObjectId> {
        self.cell
            .get_or_try_init(|| async {
                let phase = std::mem::replace(&mut *self.phase.lock(), Phase::Resolving);
                match phase {
                    Phase::Unresolved(resolver) => {
                        let result = InFlight::new(&self.phase, resolver).finish().await;
                        *self.phase.lock() = match &result {
                            Ok(_) => Phase::Resolved,
                            Err(e) => Phase::Failed(e.clone()),
                        };
                        result.map_err(Error::from)
                    }
                    Phase::Failed(e) => {
                        *self.phase.lock() = Phase::Failed(e.clone());
                        Err(Error::Resolution(e))
                    }
                    // The cell is only empty while no resolver has succeeded.
                    Phase::Resolving | Phase::Resolved => {
                        Err(Error::UnresolvedId(Resolution::Resolving))
                    }
                }
            })
            .await
    }
}

/// A resolver being polled. If the poll is abandoned, the partly driven
/// resolver goes back into the phase and the next caller resumes it.
struct InFlight<'a> {
    phase: &'a Mutex<Phase>,
    resolver: Option<Resolver>,
}

impl<'a> InFlight<'a> {
    fn new(phase: &'a Mutex<Phase>, resolver: Resolver) -> Self {
        Self {
            phase,
            resolver: Some(resolver),
        }
    }

    async fn finish(mut self) -> id::Result<ObjectId> {
        let result = futures::future::poll_fn(|cx| match self.resolver.as_mut() {
            Some(resolver) => resolver.as_mut().poll(cx),
            None => Poll::Pending,
        })
        .await;
        self.resolver = None;
        result
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            *self.phase.lock() = Phase::Unresolved(resolver);
        }
    }
}

impl fmt::Debug for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredId")
            .field("state", &self.state())
            .field("id", &self.cell.get())
            .finish()
    }
}

impl From<ObjectId> for DeferredId {
    fn from(id: ObjectId) -> Self {
        Self::resolved(id)
    }
}
