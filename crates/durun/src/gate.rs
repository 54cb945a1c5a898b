//! # Concurrency Gate
//!
//! Serializes every instance-level call: construction, `fetch`, `alarm` and
//! socket events. While a call holds the gate, later callers queue and are
//! admitted in FIFO order once it clears.
//!
//! The gate is a fair `tokio::sync::Mutex`, so waiters are released in the
//! order they arrived and the gate is released when the guard drops, even if
//! the guarded future returns an error or unwinds.
//!
//! A task that already holds the gate (e.g. a `fetch` handler calling
//! `block_concurrency_while`) does not queue behind itself. Nested calls at
//! the same depth are chained through a per-depth lock instead, so two
//! nested sections awaited together still run one after the other. Work
//! spawned onto other tasks does not inherit the gate and queues normally.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static HELD_GATE: Held;
}

/// Which gate the current task holds, and how deeply nested it is.
#[derive(Copy, Clone, Debug)]
struct Held {
    gate: u64,
    depth: usize,
}

/// Exclusive-execution gate for one instance.
#[derive(Debug)]
pub struct Gate {
    id: u64,
    lock: Mutex<()>,
    // One lock per nesting depth; index 0 chains calls made by the holder.
    nested: parking_lot::Mutex<Vec<Arc<Mutex<()>>>>,
    waiting: AtomicUsize,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            lock: Mutex::new(()),
            nested: parking_lot::Mutex::new(Vec::new()),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Whether the current task is running inside this gate.
    pub fn is_held_by_current_task(&self) -> bool {
        self.held_depth().is_some()
    }

    fn held_depth(&self) -> Option<usize> {
        HELD_GATE
            .try_with(|held| (held.gate == self.id).then_some(held.depth))
            .ok()
            .flatten()
    }

    fn nested_lock(&self, depth: usize) -> Arc<Mutex<()>> {
        let mut levels = self.nested.lock();
        while levels.len() <= depth {
            levels.push(Arc::new(Mutex::new(())));
        }
        levels[depth].clone()
    }

    /// Whether some call currently holds the gate.
    pub fn is_closed(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Number of callers queued behind the current holder.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Runs `f` with exclusive access to the instance.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(depth) = self.held_depth() {
            let level = self.nested_lock(depth);
            let _nested = level.lock().await;
            let held = Held {
                gate: self.id,
                depth: depth + 1,
            };
            return HELD_GATE.scope(held, f()).await;
        }

        let _guard = {
            let _waiting = Waiting::enter(&self.waiting);
            self.lock.lock().await
        };

        let held = Held {
            gate: self.id,
            depth: 0,
        };
        HELD_GATE.scope(held, f()).await
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a queued caller; survives cancellation of the waiting future.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;
    use parking_lot::Mutex as SyncMutex;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_do_not_interleave() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|| async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);

                    // Read-yield-write would lose updates if two callers overlapped.
                    let seen = counter.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.store(seen + 1, Ordering::SeqCst);

                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_waiters_are_released_in_arrival_order() {
        let gate = Arc::new(Gate::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(|| async move {
                    let _ = release_rx.await;
                })
                .await
            })
        };
        while !gate.is_closed() {
            tokio::task::yield_now().await;
        }

        let mut waiters = Vec::new();
        for i in 0..5 {
            let waiter_gate = gate.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                waiter_gate.run(|| async move { order.lock().push(i) }).await
            }));
            while gate.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_gate_released_after_error() {
        let gate = Gate::new();
        let result: Result<(), &str> = gate.run(|| async move { Err("boom") }).await;
        assert!(result.is_err());
        assert!(!gate.is_closed());

        let value = gate.run(|| async move { 7 }).await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_gate_released_after_panic() {
        let gate = Gate::new();
        let outcome = std::panic::AssertUnwindSafe(gate.run(|| async move { panic!("handler blew up") }))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());
        assert!(!gate.is_closed());
        assert_eq!(gate.run(|| async move { 1 }).await, 1);
    }

    #[tokio::test]
    async fn test_nested_call_runs_inline() {
        let gate = Gate::new();
        let inner = &gate;
        let value = gate
            .run(|| async move {
                assert!(inner.is_held_by_current_task());
                inner.run(|| async move { 41 }).await + 1
            })
            .await;
        assert_eq!(value, 42);
        assert!(!gate.is_held_by_current_task());
    }

    #[tokio::test]
    async fn test_nested_calls_awaited_together_are_chained() {
        let gate = Gate::new();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);
        let log = SyncMutex::new(Vec::new());

        let section = |label: &'static str| {
            let (gate, inside, max_inside, log) = (&gate, &inside, &max_inside, &log);
            async move {
                gate.run(|| async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    log.lock().push(format!("{} start", label));
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    // Deeper nesting inside a chained section must not deadlock.
                    gate.run(|| async move { log.lock().push(format!("{} inner", label)) })
                        .await;
                    log.lock().push(format!("{} end", label));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        };

        gate.run(|| async {
            futures::join!(section("a"), section("b"));
        })
        .await;

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock(),
            vec!["a start", "a inner", "a end", "b start", "b inner", "b end"]
        );
    }

    #[tokio::test]
    async fn test_spawned_work_queues_behind_holder() {
        let gate = Arc::new(Gate::new());
        let log = Arc::new(SyncMutex::new(Vec::new()));

        let spawned = gate
            .run(|| {
                let gate = gate.clone();
                let log = log.clone();
                async move {
                    let background = {
                        let gate = gate.clone();
                        let log = log.clone();
                        tokio::spawn(async move {
                            gate.run(|| async move { log.lock().push("background") }).await
                        })
                    };
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().push("holder");
                    background
                }
            })
            .await;

        spawned.await.unwrap();
        assert_eq!(*log.lock(), vec!["holder", "background"]);
    }
}
