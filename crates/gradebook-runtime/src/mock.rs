//! Fault-injecting store wrapper for exercising the engine's failure paths.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use gradebook_core::model::{AttendanceKey, GradeKey, ScaleId};
use gradebook_core::records::{AttendanceRecords, GradeRecords};
use gradebook_core::scale::RubricScale;
use gradebook_core::summary::{AttendanceSummary, GradeSummary};
use gradebook_core::traits::{RecordSource, SummarySink};

use crate::error::StoreError;
use crate::memory::MemoryStore;

/// Wraps a `MemoryStore` and fails or slows down a configurable number of
/// calls before delegating.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing_fetches: AtomicU32,
    failing_commits: AtomicU32,
    fetch_delay_ms: AtomicU64,
    commit_delay_ms: AtomicU64,
    fetch_calls: AtomicU32,
    commit_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_fetches: AtomicU32::new(0),
            failing_commits: AtomicU32::new(0),
            fetch_delay_ms: AtomicU64::new(0),
            commit_delay_ms: AtomicU64::new(0),
            fetch_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Fail the next `n` record fetches.
    pub fn fail_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` summary upserts.
    pub fn fail_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Delay every record fetch by `delay`.
    pub fn delay_fetches(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every summary upsert by `delay`.
    pub fn delay_commits(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Record fetches attempted, including failed ones.
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    /// Summary upserts attempted, including failed ones.
    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::Relaxed)
    }

    async fn before_fetch(&self) -> Result<(), StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        pause(&self.fetch_delay_ms).await;
        take_failure(&self.failing_fetches, "injected fetch failure")
    }

    async fn before_commit(&self) -> Result<(), StoreError> {
        self.commit_calls.fetch_add(1, Ordering::Relaxed);
        pause(&self.commit_delay_ms).await;
        take_failure(&self.failing_commits, "injected commit failure")
    }
}

async fn pause(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn take_failure(remaining: &AtomicU32, message: &str) -> Result<(), StoreError> {
    let failed = remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
        Err(StoreError::Unavailable(message.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl RecordSource for FlakyStore {
    async fn grade_records(&self, key: &GradeKey) -> anyhow::Result<GradeRecords> {
        self.before_fetch().await?;
        self.inner.grade_records(key).await
    }

    async fn attendance_records(&self, key: &AttendanceKey) -> anyhow::Result<AttendanceRecords> {
        self.before_fetch().await?;
        self.inner.attendance_records(key).await
    }

    async fn rubric_scale(&self, id: ScaleId) -> anyhow::Result<Option<RubricScale>> {
        self.inner.rubric_scale(id).await
    }
}

#[async_trait]
impl SummarySink for FlakyStore {
    async fn upsert_grade_summary(&self, summary: GradeSummary) -> anyhow::Result<()> {
        self.before_commit().await?;
        self.inner.upsert_grade_summary(summary).await
    }

    async fn upsert_attendance_summary(&self, summary: AttendanceSummary) -> anyhow::Result<()> {
        self.before_commit().await?;
        self.inner.upsert_attendance_summary(summary).await
    }
}
