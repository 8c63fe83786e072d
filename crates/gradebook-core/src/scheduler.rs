//! Recomputation scheduler: decides what must be recomputed and keeps the
//! per-key state machine.
//!
//! ```text
//! Pending ──▶ Computing ──▶ Committed
//!    ▲            │
//!    └── Failed ◀─┘
//! ```
//!
//! Every trigger bumps the key's generation. A computation only commits if
//! no newer trigger arrived since it was dequeued, so the latest trigger
//! wins. Triggers for a key that is already queued coalesce into one entry.
//!
//! A key that exhausted its retries on a storage failure stays `Pending`
//! with no queued trigger until `requeue_failed` runs or a new change
//! arrives. Committed keys leave the state table through `prune_settled`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::debug;

use crate::model::SummaryKey;
use crate::traits::ChangeListener;

/// Lifecycle state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Pending,
    Computing,
    Committed,
    Failed,
}

/// Observable status of one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub state: KeyState,
    /// Number of triggers seen so far.
    pub generation: u64,
    /// Whether a trigger is waiting in the queue.
    pub queued: bool,
    /// The last failure was a storage error or timeout, so the key is worth
    /// requeueing without a new trigger.
    pub retryable: bool,
    /// Attempts made by the latest computation.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_committed: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct KeyEntry {
    status: KeyStatus,
    /// Held for the whole compute-and-commit of one ticket.
    lock: Arc<tokio::sync::Mutex<()>>,
    /// When the key last reached `Committed` with nothing newer pending.
    settled_at: Option<Instant>,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            status: KeyStatus {
                state: KeyState::Pending,
                generation: 0,
                queued: false,
                retryable: false,
                attempts: 0,
                last_error: None,
                last_committed: None,
            },
            lock: Arc::new(tokio::sync::Mutex::new(())),
            settled_at: None,
        }
    }
}

/// A dequeued unit of work.
#[derive(Debug)]
pub struct Ticket {
    pub key: SummaryKey,
    /// Generation of the key when it was dequeued.
    pub generation: u64,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Ticket {
    /// Wait for exclusive ownership of the key.
    pub(crate) async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.lock).lock_owned().await
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<SummaryKey, KeyEntry>,
    queue: VecDeque<SummaryKey>,
}

/// Queue of keys awaiting recomputation plus their state table.
#[derive(Debug, Default)]
pub struct RecomputeScheduler {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RecomputeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a trigger for `key` and return its new generation.
    pub fn enqueue(&self, key: impl Into<SummaryKey>) -> u64 {
        let key = key.into();
        let generation = {
            let mut guard = self.inner();
            let Inner { entries, queue } = &mut *guard;
            let entry = entries.entry(key).or_insert_with(KeyEntry::new);
            entry.status.generation += 1;
            entry.settled_at = None;
            if entry.status.state != KeyState::Computing {
                entry.status.state = KeyState::Pending;
            }
            if !entry.status.queued {
                entry.status.queued = true;
                queue.push_back(key);
            }
            entry.status.generation
        };
        debug!(%key, generation, "enqueued");
        self.notify.notify_one();
        generation
    }

    /// Take the oldest queued key.
    pub fn dequeue(&self) -> Option<Ticket> {
        let mut guard = self.inner();
        let Inner { entries, queue } = &mut *guard;
        while let Some(key) = queue.pop_front() {
            if let Some(entry) = entries.get_mut(&key) {
                entry.status.queued = false;
                return Some(Ticket {
                    key,
                    generation: entry.status.generation,
                    lock: Arc::clone(&entry.lock),
                });
            }
        }
        None
    }

    /// Whether no trigger arrived since `ticket` was dequeued.
    pub fn is_current(&self, ticket: &Ticket) -> bool {
        self.inner()
            .entries
            .get(&ticket.key)
            .is_some_and(|e| e.status.generation == ticket.generation)
    }

    pub fn status(&self, key: &SummaryKey) -> Option<KeyStatus> {
        self.inner().entries.get(key).map(|e| e.status.clone())
    }

    /// Number of keys waiting in the queue.
    pub fn pending_len(&self) -> usize {
        self.inner().queue.len()
    }

    /// Resolves once a trigger has been enqueued since the last call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Enqueue every key whose last failure was transient and that has no
    /// trigger waiting. Returns how many keys were requeued.
    pub fn requeue_failed(&self) -> usize {
        let keys: Vec<SummaryKey> = self
            .inner()
            .entries
            .iter()
            .filter(|(_, e)| {
                e.status.state == KeyState::Pending && e.status.retryable && !e.status.queued
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            debug!(%key, "requeueing after failure");
            self.enqueue(*key);
        }
        keys.len()
    }

    /// Forget keys that have been committed for at least `idle` with no
    /// trigger queued and no ticket outstanding. Returns how many were
    /// dropped.
    pub fn prune_settled(&self, idle: Duration) -> usize {
        let mut guard = self.inner();
        let before = guard.entries.len();
        guard.entries.retain(|_, e| {
            let settled = e.status.state == KeyState::Committed
                && !e.status.queued
                && Arc::strong_count(&e.lock) == 1
                && e.settled_at.is_some_and(|at| at.elapsed() >= idle);
            !settled
        });
        before - guard.entries.len()
    }

    fn update(&self, key: &SummaryKey, f: impl FnOnce(&mut KeyEntry)) {
        if let Some(entry) = self.inner().entries.get_mut(key) {
            f(entry);
        }
    }

    pub(crate) fn mark_computing(&self, ticket: &Ticket, attempt: u32) {
        self.update(&ticket.key, |e| {
            e.status.state = KeyState::Computing;
            e.status.attempts = attempt;
        });
    }

    pub(crate) fn mark_committed(&self, ticket: &Ticket, at: DateTime<Utc>) {
        let generation = ticket.generation;
        self.update(&ticket.key, |e| {
            e.status.last_committed = Some(at);
            e.status.last_error = None;
            e.status.retryable = false;
            if e.status.generation == generation {
                e.status.state = KeyState::Committed;
                e.settled_at = Some(Instant::now());
            } else {
                e.status.state = KeyState::Pending;
            }
        });
    }

    pub(crate) fn mark_failed(&self, ticket: &Ticket, error: &str, retryable: bool) {
        self.update(&ticket.key, |e| {
            e.status.state = KeyState::Failed;
            e.status.last_error = Some(error.to_string());
            e.status.retryable = retryable;
        });
    }

    /// Failed or superseded work goes back to waiting for its next run.
    pub(crate) fn mark_pending(&self, ticket: &Ticket) {
        self.update(&ticket.key, |e| e.status.state = KeyState::Pending);
    }
}

impl ChangeListener for RecomputeScheduler {
    fn on_change(&self, key: SummaryKey) {
        self.enqueue(key);
    }
}
