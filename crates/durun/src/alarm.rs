//! # Alarm Scheduler
//!
//! Process-wide timer service. Each instance has at most one pending alarm;
//! setting a new one replaces the old one. A polling loop fires due alarms
//! through an [`AlarmTarget`] (the router), which runs the instance's
//! `alarm` handler under its concurrency gate.
//!
//! ## Firing rules
//!
//! - Due entries are collected at the start of a pass and fired concurrently.
//! - An id whose handler is still running is skipped by later passes.
//! - When the handler settles (success, error or panic) the entry and its
//!   persisted record are cleared, unless the schedule changed meanwhile.
//!   A handler that re-arms its own alarm therefore keeps the new schedule
//!   and is picked up by a later pass, never the current one.
//! - Timestamps already in the past fire on the next pass.
//!
//! Every schedule is written to the [`StorageBackend`] before it becomes
//! visible, so [`AlarmScheduler::load`] can rebuild the table after a restart.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::id::ObjectId;
use crate::storage;
use crate::storage::StorageBackend;
use crate::tasks::panic_message;

#[derive(Debug, Clone)]
pub enum Error {
    /// The alarm record could not be persisted.
    Persist(storage::Error),
    /// Alarm times must not precede the Unix epoch.
    BeforeEpoch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persist(e) => write!(f, "Failed to persist alarm: {}", e),
            Self::BeforeEpoch => write!(f, "Alarm time is before the Unix epoch"),
        }
    }
}

impl std::error::Error for Error {}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Self::Persist(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receiver of due alarms.
#[async_trait::async_trait]
pub trait AlarmTarget: Send + Sync + 'static {
    async fn fire_alarm(&self, id: &ObjectId) -> anyhow::Result<()>;
}

#[derive(Copy, Clone, Debug)]
struct Scheduled {
    at_ms: u64,
    generation: u64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AlarmScheduler {
    backend: Arc<dyn StorageBackend>,
    pending: DashMap<ObjectId, Scheduled>,
    in_flight: DashMap<ObjectId, u64>,
    next_generation: AtomicU64,
    poll_interval: Duration,
    // Keeps a record write and the matching table update together.
    persist: tokio::sync::Mutex<()>,
    tracker: TaskTracker,
    running: parking_lot::Mutex<Option<Running>>,
}

impl AlarmScheduler {
    pub fn new(backend: Arc<dyn StorageBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            pending: DashMap::new(),
            in_flight: DashMap::new(),
            next_generation: AtomicU64::new(1),
            poll_interval,
            persist: tokio::sync::Mutex::new(()),
            tracker: TaskTracker::new(),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Schedules `id` to fire at or after `at`, replacing any earlier schedule.
    pub async fn set_alarm(&self, id: &ObjectId, at: SystemTime) -> Result<()> {
        let at_ms = to_millis_ceil(at)?;
        let _persist = self.persist.lock().await;

        self.backend.set_alarm(&id.to_string(), at_ms).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id.clone(), Scheduled { at_ms, generation });

        tracing::debug!(id = %id, at_ms, generation, "alarm set");
        Ok(())
    }

    /// Removes the pending alarm for `id`, if any.
    pub async fn cancel_alarm(&self, id: &ObjectId) -> Result<()> {
        let _persist = self.persist.lock().await;

        self.backend.delete_alarm(&id.to_string()).await?;
        if self.pending.remove(id).is_some() {
            tracing::debug!(id = %id, "alarm cancelled");
        }
        Ok(())
    }

    pub fn get_alarm(&self, id: &ObjectId) -> Option<SystemTime> {
        self.pending.get(id).map(|entry| from_millis(entry.at_ms))
    }

    /// Number of scheduled alarms, including ones whose handler is running.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Reloads persisted alarm records. Entries already in the table win.
    ///
    /// Records whose scope is not a valid id token are skipped.
    pub async fn load(&self) -> Result<usize> {
        let records = self.backend.list_alarms().await?;
        let mut loaded = 0;

        for (scope, at_ms) in records {
            let id = match ObjectId::parse(&scope) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(scope = %scope, error = %e, "skipping unreadable alarm record");
                    continue;
                }
            };
            if self.pending.contains_key(&id) {
                continue;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            self.pending.insert(id, Scheduled { at_ms, generation });
            loaded += 1;
        }

        tracing::debug!(loaded, "alarms reloaded");
        Ok(loaded)
    }

    /// Starts the polling loop. Calling `start` on a running scheduler is a no-op.
    ///
    /// The loop ends on [`Self::stop`] or once `target` is dropped.
    pub fn start(self: &Arc<Self>, target: Weak<dyn AlarmTarget>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                scheduler.run_pass(&target);
            }
            tracing::debug!("alarm loop stopped");
        });

        *running = Some(Running { cancel, handle });
    }

    /// Stops the polling loop and waits for handlers that are still running.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "alarm loop ended abnormally");
            }
        }
        self.wait_in_flight().await;
    }

    /// Fires every due alarm that has no handler running. Returns how many
    /// handlers were started.
    pub fn run_pass(self: &Arc<Self>, target: &Arc<dyn AlarmTarget>) -> usize {
        let now_ms = now_millis();
        let due: Vec<(ObjectId, u64)> = self
            .pending
            .iter()
            .filter(|entry| entry.at_ms <= now_ms && !self.in_flight.contains_key(entry.key()))
            .map(|entry| (entry.key().clone(), entry.generation))
            .collect();

        for (id, generation) in &due {
            self.in_flight.insert(id.clone(), *generation);

            let scheduler = self.clone();
            let target = target.clone();
            let id = id.clone();
            let generation = *generation;

            self.tracker.spawn(async move {
                match AssertUnwindSafe(target.fire_alarm(&id)).catch_unwind().await {
                    Ok(Ok(())) => tracing::debug!(id = %id, generation, "alarm fired"),
                    Ok(Err(e)) => tracing::warn!(id = %id, error = %e, "alarm handler failed"),
                    Err(panic) => tracing::error!(
                        id = %id,
                        panic = %panic_message(panic.as_ref()),
                        "alarm handler panicked"
                    ),
                }
                scheduler.settle(&id, generation).await;
            });
        }

        due.len()
    }

    /// Waits until every alarm handler started so far has settled.
    pub async fn wait_in_flight(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn settle(&self, id: &ObjectId, generation: u64) {
        {
            let _persist = self.persist.lock().await;
            let cleared = self
                .pending
                .remove_if(id, |_, scheduled| scheduled.generation == generation)
                .is_some();
            if cleared {
                if let Err(e) = self.backend.delete_alarm(&id.to_string()).await {
                    tracing::warn!(id = %id, error = %e, "failed to clear alarm record");
                }
            }
        }
        self.in_flight.remove(id);
    }
}

impl fmt::Debug for AlarmScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmScheduler")
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn to_millis(at: SystemTime) -> Result<u64> {
    let since_epoch = at.duration_since(UNIX_EPOCH).map_err(|_| Error::BeforeEpoch)?;
    Ok(since_epoch.as_millis() as u64)
}

/// Rounds up, so a record never fires before the time it was set for.
fn to_millis_ceil(at: SystemTime) -> Result<u64> {
    let since_epoch = at.duration_since(UNIX_EPOCH).map_err(|_| Error::BeforeEpoch)?;
    let partial = since_epoch.subsec_nanos() % 1_000_000 != 0;
    Ok(since_epoch.as_millis() as u64 + u64::from(partial))
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

fn now_millis() -> u64 {
    to_millis(SystemTime::now()).unwrap_or(0)
}
