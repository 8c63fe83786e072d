//! Recomputation engine.
//!
//! Pulls keys from the scheduler, fetches a consistent snapshot of raw rows,
//! builds the summary and commits it, with bounded parallelism, timeouts on
//! every storage call and retries on transient failures.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::builder::build_grade_figures;
use crate::error::RecomputeError;
use crate::model::{AttendanceKey, GradeKey, SummaryKey};
use crate::policy::PolicySet;
use crate::scale::ScaleIndex;
use crate::scheduler::{RecomputeScheduler, Ticket};
use crate::summary::{build_attendance_figures, AttendanceSummary, GradeSummary};
use crate::traits::{RecordSource, SummarySink};

/// Upper bound for the retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Configuration for the recomputation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum keys recomputed concurrently.
    pub parallelism: usize,
    /// Bound on each read from the record source.
    pub fetch_timeout: Duration,
    /// Bound on each summary upsert.
    pub commit_timeout: Duration,
    /// Retries on storage errors and timeouts (not aggregation errors).
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on each further retry.
    pub retry_delay: Duration,
    /// How often `run` requeues keys that failed on storage and prunes
    /// settled keys from the scheduler.
    pub maintenance_interval: Duration,
    /// How long a committed key stays in the scheduler's state table.
    pub retain_settled: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            fetch_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            maintenance_interval: Duration::from_secs(60),
            retain_settled: Duration::from_secs(600),
        }
    }
}

/// How the processing of one ticket ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KeyOutcome {
    Committed { at: DateTime<Utc> },
    /// A newer trigger arrived; the result was discarded.
    Superseded,
    /// Retries exhausted or a non-retryable error. The previous summary is
    /// left untouched.
    Failed { error: String },
}

/// Result of processing one ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedKey {
    pub key: SummaryKey,
    pub generation: u64,
    pub outcome: KeyOutcome,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Result of one `drain` pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecomputeReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub keys: Vec<ProcessedKey>,
    pub committed: usize,
    pub superseded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl RecomputeReport {
    /// The last processing result recorded for `key`.
    pub fn outcome_for(&self, key: &SummaryKey) -> Option<&ProcessedKey> {
        self.keys.iter().rev().find(|p| &p.key == key)
    }
}

enum Attempt {
    Committed(DateTime<Utc>),
    Superseded,
}

/// The recomputation engine. It is the only writer of summaries.
pub struct RecomputeEngine {
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn SummarySink>,
    policies: Arc<PolicySet>,
    scheduler: Arc<RecomputeScheduler>,
    config: EngineConfig,
}

impl RecomputeEngine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn SummarySink>,
        policies: PolicySet,
        config: EngineConfig,
    ) -> Self {
        Self::with_scheduler(
            source,
            sink,
            policies,
            config,
            Arc::new(RecomputeScheduler::new()),
        )
    }

    /// Build an engine around an existing scheduler, e.g. one already
    /// registered as the store's change listener.
    pub fn with_scheduler(
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn SummarySink>,
        policies: PolicySet,
        config: EngineConfig,
        scheduler: Arc<RecomputeScheduler>,
    ) -> Self {
        Self {
            source,
            sink,
            policies: Arc::new(policies),
            scheduler,
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<RecomputeScheduler> {
        &self.scheduler
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Trigger recomputation of `key`.
    pub fn enqueue(&self, key: impl Into<SummaryKey>) -> u64 {
        self.scheduler.enqueue(key)
    }

    /// Process the oldest queued key, if any.
    pub async fn process_next(&self) -> Option<ProcessedKey> {
        let ticket = self.scheduler.dequeue()?;
        Some(self.process(ticket).await)
    }

    /// Enqueue `key` and process queued work until it has been handled.
    pub async fn recompute(&self, key: impl Into<SummaryKey>) -> Option<ProcessedKey> {
        let key = key.into();
        self.enqueue(key);
        self.drain().await.outcome_for(&key).cloned()
    }

    /// Compute and commit one ticket, retrying transient failures.
    pub async fn process(&self, ticket: Ticket) -> ProcessedKey {
        let start = Instant::now();
        let _guard = ticket.acquire().await;

        let mut retry_delay = self.config.retry_delay;
        let mut attempts = 0u32;
        let outcome = loop {
            if !self.scheduler.is_current(&ticket) {
                tracing::debug!(key = %ticket.key, "superseded before compute");
                self.scheduler.mark_pending(&ticket);
                break KeyOutcome::Superseded;
            }

            attempts += 1;
            self.scheduler.mark_computing(&ticket, attempts);
            match self.attempt(&ticket).await {
                Ok(Attempt::Committed(at)) => {
                    self.scheduler.mark_committed(&ticket, at);
                    tracing::debug!(key = %ticket.key, generation = ticket.generation, "committed");
                    break KeyOutcome::Committed { at };
                }
                Ok(Attempt::Superseded) => {
                    tracing::debug!(key = %ticket.key, "superseded before commit");
                    self.scheduler.mark_pending(&ticket);
                    break KeyOutcome::Superseded;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.scheduler.mark_failed(&ticket, &message, e.is_transient());
                    if e.is_transient() && attempts <= self.config.max_retries {
                        tracing::warn!(
                            key = %ticket.key,
                            attempt = attempts,
                            "recompute failed, retrying in {retry_delay:?}: {message}"
                        );
                        tokio::time::sleep(retry_delay).await;
                        retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                        continue;
                    }
                    tracing::error!(key = %ticket.key, attempts, "recompute failed: {message}");
                    self.scheduler.mark_pending(&ticket);
                    break KeyOutcome::Failed { error: message };
                }
            }
        };

        ProcessedKey {
            key: ticket.key,
            generation: ticket.generation,
            outcome,
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Process queued keys until the queue is empty and nothing is in
    /// flight.
    pub async fn drain(&self) -> RecomputeReport {
        let start = Instant::now();
        let started_at = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut in_flight = FuturesUnordered::new();
        let mut keys = Vec::new();

        loop {
            while let Some(ticket) = self.scheduler.dequeue() {
                let semaphore = Arc::clone(&semaphore);
                in_flight.push(async move {
                    let _permit = semaphore.acquire_owned().await;
                    self.process(ticket).await
                });
            }
            match in_flight.next().await {
                Some(processed) => keys.push(processed),
                None => break,
            }
        }

        let count = |f: fn(&KeyOutcome) -> bool| keys.iter().filter(|p| f(&p.outcome)).count();
        let report = RecomputeReport {
            id: Uuid::new_v4(),
            started_at,
            committed: count(|o| matches!(o, KeyOutcome::Committed { .. })),
            superseded: count(|o| matches!(o, KeyOutcome::Superseded)),
            failed: count(|o| matches!(o, KeyOutcome::Failed { .. })),
            duration_ms: start.elapsed().as_millis() as u64,
            keys,
        };
        if !report.keys.is_empty() {
            tracing::info!(
                run = %report.id,
                committed = report.committed,
                superseded = report.superseded,
                failed = report.failed,
                "drained recompute queue in {}ms",
                report.duration_ms
            );
        }
        report
    }

    /// Process triggers as they arrive until `shutdown` resolves, then wait
    /// for in-flight keys to finish.
    ///
    /// Every `maintenance_interval` the loop also requeues keys whose last
    /// failure was transient and prunes settled keys.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        let mut maintenance =
            tokio::time::interval(self.config.maintenance_interval.max(Duration::from_millis(1)));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(parallelism = self.config.parallelism, "recompute engine started");

        loop {
            while let Some(ticket) = self.scheduler.dequeue() {
                let engine = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    engine.process(ticket).await
                });
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.scheduler.notified() => {}
                _ = maintenance.tick() => self.maintain(),
                Some(joined) = tasks.join_next() => log_joined(joined),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            log_joined(joined);
        }
        tracing::info!("recompute engine stopped");
    }

    fn maintain(&self) {
        let requeued = self.scheduler.requeue_failed();
        let pruned = self.scheduler.prune_settled(self.config.retain_settled);
        if requeued + pruned > 0 {
            tracing::debug!(requeued, pruned, "scheduler maintenance");
        }
    }

    async fn attempt(&self, ticket: &Ticket) -> Result<Attempt, RecomputeError> {
        match ticket.key {
            SummaryKey::Grade(key) => self.recompute_grade(ticket, key).await,
            SummaryKey::Attendance(key) => self.recompute_attendance(ticket, key).await,
        }
    }

    async fn recompute_grade(&self, ticket: &Ticket, key: GradeKey) -> Result<Attempt, RecomputeError> {
        let records = bounded("fetch", self.config.fetch_timeout, self.source.grade_records(&key))
            .await?
            .map_err(RecomputeError::Fetch)?;

        let lookups = records.referenced_scales().into_iter().map(|id| {
            bounded("fetch", self.config.fetch_timeout, self.source.rubric_scale(id))
        });
        let mut scales = ScaleIndex::new();
        for fetched in join_all(lookups).await {
            if let Some(scale) = fetched?.map_err(RecomputeError::Fetch)? {
                scales.insert(scale);
            }
        }

        let policy = self.policies.for_curriculum(records.subject.curriculum);
        let figures = build_grade_figures(&records, &scales, policy)?;
        if let Some(note) = figures.exclusions.disclosure() {
            tracing::info!(%key, "{note}");
        }

        if !self.scheduler.is_current(ticket) {
            return Ok(Attempt::Superseded);
        }
        let at = Utc::now();
        let summary = GradeSummary {
            key,
            figures,
            last_updated: at,
        };
        bounded("commit", self.config.commit_timeout, self.sink.upsert_grade_summary(summary))
            .await?
            .map_err(RecomputeError::Commit)?;
        Ok(Attempt::Committed(at))
    }

    async fn recompute_attendance(
        &self,
        ticket: &Ticket,
        key: AttendanceKey,
    ) -> Result<Attempt, RecomputeError> {
        let records = bounded(
            "fetch",
            self.config.fetch_timeout,
            self.source.attendance_records(&key),
        )
        .await?
        .map_err(RecomputeError::Fetch)?;

        let figures = build_attendance_figures(&records, self.policies.attendance);

        if !self.scheduler.is_current(ticket) {
            return Ok(Attempt::Superseded);
        }
        let at = Utc::now();
        let summary = AttendanceSummary {
            key,
            figures,
            last_updated: at,
        };
        bounded(
            "commit",
            self.config.commit_timeout,
            self.sink.upsert_attendance_summary(summary),
        )
        .await?
        .map_err(RecomputeError::Commit)?;
        Ok(Attempt::Committed(at))
    }
}

async fn bounded<T>(
    stage: &'static str,
    limit: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<anyhow::Result<T>, RecomputeError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| RecomputeError::Timeout {
            stage,
            timeout_ms: limit.as_millis() as u64,
        })
}

fn log_joined(joined: Result<ProcessedKey, tokio::task::JoinError>) {
    match joined {
        Ok(processed) => tracing::trace!(key = %processed.key, "processed"),
        Err(e) => tracing::error!("recompute task panicked: {e}"),
    }
}
