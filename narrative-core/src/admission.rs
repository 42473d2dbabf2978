//! Generation admission control.
//!
//! At most `max_concurrent` jobs run at once. Further submissions wait in a
//! FIFO queue of bounded depth; beyond it they are refused on the spot.
//! A submission whose key is already queued or running joins the existing
//! job instead of starting a second one, unless that job has been active
//! longer than `stale_after`, in which case it is evicted and replaced.
//!
//! ```text
//!            submit(key)
//!                │
//!     in flight? ├── yes, fresh ──► attach to shared result
//!                │   yes, stale ──► evict, continue
//!                ▼
//!     slot free? ├── yes ──► Active ──► done ──► release ──► next waiter
//!                ├── queue has room ──► Queued ──(slot handed over)──► Active
//!                └── no ──► QueueFull
//! ```
//!
//! Bookkeeping lives under one short-lived `std::sync::Mutex` that is never
//! held across an `.await`.

use crate::config::AdmissionConfig;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Why an admitted (or refused) job produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("queue full ({depth} waiting)")]
    QueueFull { depth: usize },

    #[error("job exceeded its slot timeout")]
    TimedOut,

    #[error("job cancelled before it started")]
    Cancelled,

    #[error("job evicted as stale")]
    Evicted,

    #[error("job panicked")]
    Panicked,

    #[error("controller is shut down")]
    ShutDown,
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, AdmissionError>>>;

/// Handle to an admitted job.
pub struct Ticket<T: Clone> {
    key: String,
    deduplicated: bool,
    result: SharedResult<T>,
}

impl<T: Clone> Ticket<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this submission joined a job that was already in flight.
    pub fn is_deduplicated(&self) -> bool {
        self.deduplicated
    }

    /// Wait for the job's outcome.
    pub async fn wait(self) -> Result<T, AdmissionError> {
        self.result.await
    }
}

/// Snapshot of the controller's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub running: usize,
    pub queued: usize,
    pub in_flight: Vec<String>,
    pub deduplicated_total: u64,
    pub rejected_total: u64,
    pub evicted_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Active,
}

struct Entry<T: Clone> {
    id: u64,
    phase: Phase,
    activated_at: Option<Instant>,
    result: SharedResult<T>,
    abort: AbortHandle,
}

struct State<T: Clone> {
    running: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    entries: HashMap<String, Entry<T>>,
    shut_down: bool,
    next_id: u64,
    deduplicated_total: u64,
    rejected_total: u64,
    evicted_total: u64,
}

struct Inner<T: Clone> {
    config: AdmissionConfig,
    state: Mutex<State<T>>,
}

impl<T: Clone> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give a freed slot to the next live waiter, or return it to the pool.
    fn release_slot(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }

    fn mark_active(&self, key: &str, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.id == id {
                entry.phase = Phase::Active;
                entry.activated_at = Some(Instant::now());
            }
        }
    }

    fn forget(&self, key: &str, id: u64) {
        let mut state = self.lock();
        if state.entries.get(key).is_some_and(|e| e.id == id) {
            state.entries.remove(key);
        }
    }
}

/// Holds a job's place in the controller until the job's task ends,
/// however it ends.
struct Lease<T: Clone> {
    inner: Arc<Inner<T>>,
    key: String,
    id: u64,
    holding_slot: bool,
    handoff: Option<oneshot::Receiver<()>>,
}

impl<T: Clone> Lease<T> {
    /// Wait until a slot is handed over. False if the queue was torn down.
    async fn acquire(&mut self) -> bool {
        if self.holding_slot {
            return true;
        }
        let Some(rx) = self.handoff.as_mut() else {
            return false;
        };
        if rx.await.is_ok() {
            self.handoff = None;
            self.holding_slot = true;
        }
        self.holding_slot
    }
}

impl<T: Clone> Drop for Lease<T> {
    fn drop(&mut self) {
        if !self.holding_slot {
            // A slot may have been handed over after we stopped listening.
            if let Some(mut rx) = self.handoff.take() {
                self.holding_slot = rx.try_recv().is_ok();
            }
        }
        if self.holding_slot {
            self.inner.release_slot();
        }
        self.inner.forget(&self.key, self.id);
    }
}

/// Bounds, queues and deduplicates jobs producing `T`.
pub struct AdmissionController<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for AdmissionController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AdmissionController<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    running: 0,
                    waiters: VecDeque::new(),
                    entries: HashMap::new(),
                    shut_down: false,
                    next_id: 0,
                    deduplicated_total: 0,
                    rejected_total: 0,
                    evicted_total: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Admit `job` under `key`, or join the job already running under it.
    ///
    /// The admission decision is made synchronously; await the returned
    /// ticket for the outcome. Must be called inside a Tokio runtime.
    pub fn submit<F>(&self, key: impl Into<String>, job: F) -> Result<Ticket<T>, AdmissionError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let key = key.into();
        let config = &self.inner.config;
        let mut evicted = None;

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.shut_down {
            return Err(AdmissionError::ShutDown);
        }

        if let Some(entry) = state.entries.get(&key) {
            let stale = entry
                .activated_at
                .is_some_and(|at| at.elapsed() >= config.stale_after());
            if !stale {
                tracing::debug!(key = %key, phase = ?entry.phase, "Joined in-flight generation");
                let result = entry.result.clone();
                state.deduplicated_total += 1;
                return Ok(Ticket {
                    key,
                    deduplicated: true,
                    result,
                });
            }
            if let Some(entry) = state.entries.remove(&key) {
                state.evicted_total += 1;
                tracing::warn!(key = %key, "Evicting stale in-flight generation");
                evicted = Some(entry.abort);
            }
        }

        let (holding_slot, handoff) = if state.running < config.max_concurrent {
            state.running += 1;
            (true, None)
        } else if state.waiters.len() < config.max_queue_depth {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            (false, Some(rx))
        } else {
            state.rejected_total += 1;
            let depth = state.waiters.len();
            drop(guard);
            if let Some(abort) = evicted {
                abort.abort();
            }
            tracing::warn!(key = %key, depth, "Generation queue full, rejecting");
            return Err(AdmissionError::QueueFull { depth });
        };

        let id = state.next_id;
        state.next_id += 1;

        let mut lease = Lease {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
            holding_slot,
            handoff,
        };
        let slot_timeout = config.slot_timeout();
        let task_key = key.clone();
        let handle: JoinHandle<Result<T, AdmissionError>> = tokio::spawn(async move {
            if !lease.acquire().await {
                return Err(AdmissionError::Cancelled);
            }
            lease.inner.mark_active(&task_key, id);
            let outcome = tokio::time::timeout(slot_timeout, job).await;
            drop(lease);
            outcome.map_err(|_| {
                tracing::warn!(key = %task_key, "Generation exceeded its slot timeout");
                AdmissionError::TimedOut
            })
        });

        let abort = handle.abort_handle();
        let result: SharedResult<T> = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(AdmissionError::Evicted),
                Err(_) => Err(AdmissionError::Panicked),
            }
        }
        .boxed()
        .shared();

        let phase = if holding_slot { Phase::Active } else { Phase::Queued };
        state.entries.insert(
            key.clone(),
            Entry {
                id,
                phase,
                activated_at: holding_slot.then(Instant::now),
                result: result.clone(),
                abort,
            },
        );
        drop(guard);

        if let Some(abort) = evicted {
            abort.abort();
        }

        Ok(Ticket {
            key,
            deduplicated: false,
            result,
        })
    }

    /// Evict every active job older than `stale_after`. Returns their keys.
    pub fn sweep_stale(&self) -> Vec<String> {
        let stale_after = self.inner.config.stale_after();
        let mut aborts = Vec::new();
        let mut keys = Vec::new();
        {
            let mut state = self.inner.lock();
            let stale: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.activated_at.is_some_and(|at| at.elapsed() >= stale_after))
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                if let Some(entry) = state.entries.remove(&key) {
                    state.evicted_total += 1;
                    aborts.push(entry.abort);
                    keys.push(key);
                }
            }
        }
        for (abort, key) in aborts.into_iter().zip(&keys) {
            tracing::warn!(key = %key, "Watchdog evicted stale generation");
            abort.abort();
        }
        keys
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `period` until the
    /// controller is dropped or shut down.
    pub fn spawn_watchdog(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.lock().shut_down {
                    break;
                }
                AdmissionController { inner }.sweep_stale();
            }
        })
    }

    /// Refuse new work and cancel every queued job. Running jobs finish.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        state.shut_down = true;
        let cancelled = state.waiters.len();
        // Dropping the senders wakes each waiter with an error.
        state.waiters.clear();
        tracing::debug!(cancelled, "Admission controller shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.inner.lock();
        let mut in_flight: Vec<String> = state.entries.keys().cloned().collect();
        in_flight.sort();
        AdmissionStats {
            running: state.running,
            queued: state.waiters.len(),
            in_flight,
            deduplicated_total: state.deduplicated_total,
            rejected_total: state.rejected_total,
            evicted_total: state.evicted_total,
        }
    }
}
