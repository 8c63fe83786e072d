//! Storage seams of the engine.
//!
//! The persistence layer implements `RecordSource` (read side) and
//! `SummarySink` (write side). It calls a `ChangeListener` whenever a raw
//! row that feeds a summary is created, updated or deleted.

use async_trait::async_trait;

use crate::model::{AttendanceKey, GradeKey, ScaleId, SummaryKey};
use crate::records::{AttendanceRecords, GradeRecords};
use crate::scale::RubricScale;
use crate::summary::{AttendanceSummary, GradeSummary};

/// Read access to raw rows.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// All score and evidence rows for one key, as of one consistent point
    /// in time.
    async fn grade_records(&self, key: &GradeKey) -> anyhow::Result<GradeRecords>;

    /// All attendance marks for one key, as of one consistent point in time.
    async fn attendance_records(&self, key: &AttendanceKey) -> anyhow::Result<AttendanceRecords>;

    /// The current definition of a rubric scale and its levels.
    async fn rubric_scale(&self, id: ScaleId) -> anyhow::Result<Option<RubricScale>>;
}

/// Write access to produced summaries. The engine is the only writer.
#[async_trait]
pub trait SummarySink: Send + Sync {
    /// Replace the row for `summary.key` atomically.
    async fn upsert_grade_summary(&self, summary: GradeSummary) -> anyhow::Result<()>;

    /// Replace the row for `summary.key` atomically.
    async fn upsert_attendance_summary(&self, summary: AttendanceSummary) -> anyhow::Result<()>;
}

/// Receives the keys affected by raw-row mutations.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, key: SummaryKey);
}
