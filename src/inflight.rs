//! In-flight fetch registry
//!
//! Collapses concurrent misses for one cache key into a single fetch. The
//! first request for a key registers the flight and schedules the work on the
//! [`WorkerPool`]; later requests join the flight and wait on the same watch
//! channel. The registry entry is removed when the flight completes, whether
//! it succeeded or failed, and also if the owning job is dropped unfinished.

use crate::error::{DownloadError, Result};
use crate::worker_pool::WorkerPool;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Where a completed fetch left its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Small payload, also promoted to the chunk cache
    Memory(Bytes),
    /// Committed disk file holding `len` bytes; too large to buffer
    OnDisk { path: PathBuf, len: u64 },
}

type FlightResult = std::result::Result<FetchOutcome, DownloadError>;
type Slot = watch::Receiver<Option<FlightResult>>;

/// Registry of fetches in progress, one per cache key
pub struct InFlightTracker {
    pending: Arc<DashMap<String, (u64, Slot)>>,
    next_id: AtomicU64,
}

/// Role assigned to a caller by [`InFlightTracker::try_register`]
pub enum FlightRole {
    /// First caller for the key; must complete the guard
    Owner(FlightGuard, FlightHandle),
    /// A flight for the key already exists
    Joiner(FlightHandle),
}

/// Result of [`InFlightTracker::join_or_start`]
pub enum Registration {
    Started(FlightHandle),
    Joined(FlightHandle),
}

impl Registration {
    pub fn is_joined(&self) -> bool {
        matches!(self, Registration::Joined(_))
    }

    pub fn into_handle(self) -> FlightHandle {
        match self {
            Registration::Started(h) | Registration::Joined(h) => h,
        }
    }
}

impl InFlightTracker {
    pub fn new() -> Self {
        InFlightTracker {
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register interest in `key`, atomically becoming its owner if no
    /// flight exists yet
    pub fn try_register(&self, key: &str) -> FlightRole {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) => FlightRole::Joiner(FlightHandle {
                key: key.to_string(),
                rx: occupied.get().1.clone(),
            }),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                vacant.insert((id, rx.clone()));

                let guard = FlightGuard {
                    key: key.to_string(),
                    id,
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    completed: false,
                };
                let handle = FlightHandle {
                    key: key.to_string(),
                    rx,
                };
                FlightRole::Owner(guard, handle)
            }
        }
    }

    /// Join the flight for `key`, or start one running `work` on `pool`
    ///
    /// Only the starting caller's `work` is ever invoked.
    pub fn join_or_start<F, Fut>(&self, key: &str, pool: &WorkerPool, work: F) -> Registration
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchOutcome>> + Send + 'static,
    {
        let (guard, handle) = match self.try_register(key) {
            FlightRole::Joiner(handle) => {
                debug!(cache_key = %key, "Joining in-flight fetch");
                return Registration::Joined(handle);
            }
            FlightRole::Owner(guard, handle) => (guard, handle),
        };

        let job = work();
        let spawned = pool.spawn(key.to_string(), async move {
            let outcome = job.await;
            guard.complete(outcome);
        });
        // on failure the job was dropped, and the guard with it
        if let Err(e) = spawned {
            warn!(cache_key = %key, "Could not schedule fetch: {}", e);
        }
        Registration::Started(handle)
    }

    /// Number of flights currently registered
    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner side of a flight; removes the registry entry when consumed or dropped
pub struct FlightGuard {
    key: String,
    id: u64,
    sender: watch::Sender<Option<FlightResult>>,
    pending: Arc<DashMap<String, (u64, Slot)>>,
    completed: bool,
}

impl FlightGuard {
    /// Publish the outcome to every waiter and deregister the flight
    pub fn complete(mut self, outcome: Result<FetchOutcome>) {
        self.completed = true;
        self.sender.send_replace(Some(outcome));
        self.deregister();
    }

    fn deregister(&self) {
        let id = self.id;
        self.pending.remove_if(&self.key, |_, (entry_id, _)| *entry_id == id);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(cache_key = %self.key, "In-flight fetch abandoned without a result");
            self.deregister();
        }
    }
}

/// Waiter side of a flight
pub struct FlightHandle {
    key: String,
    rx: watch::Receiver<Option<FlightResult>>,
}

impl FlightHandle {
    /// Wait for the flight to complete
    ///
    /// Giving up on the wait does not cancel the fetch.
    ///
    /// # Returns
    /// * `Err(DownloadError::Timeout)` if nothing arrived within `timeout`
    /// * `Err(DownloadError::Interrupted)` if the flight ended without a result
    /// * the flight's own error if the fetch failed
    pub async fn wait(mut self, timeout: Duration) -> Result<FetchOutcome> {
        let key = self.key;
        let waited = tokio::time::timeout(timeout, self.rx.wait_for(|v| v.is_some())).await;
        match waited {
            Err(_) => Err(DownloadError::Timeout(key)),
            Ok(Err(_)) => Err(DownloadError::Interrupted(key)),
            Ok(Ok(value)) => match &*value {
                Some(result) => result.clone(),
                None => Err(DownloadError::Interrupted(key)),
            },
        }
    }
}
