//! Record store error types.

use chrono::NaiveDate;
use thiserror::Error;

use gradebook_core::model::{AssessmentId, LevelId, OutcomeId, ScaleId, SubjectId, TermId};

/// Errors raised by the in-memory record store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("unknown term {0}")]
    UnknownTerm(TermId),

    #[error("unknown subject {0}")]
    UnknownSubject(SubjectId),

    #[error("unknown assessment {0}")]
    UnknownAssessment(AssessmentId),

    #[error("unknown learning outcome {0}")]
    UnknownOutcome(OutcomeId),

    #[error("unknown rubric scale {0}")]
    UnknownScale(ScaleId),

    #[error("unknown level {level} in rubric scale {scale}")]
    UnknownLevel { scale: ScaleId, level: LevelId },

    /// A dated row falls outside every term.
    #[error("no term contains {0}")]
    NoTermForDate(NaiveDate),

    /// Injected or real backend outage.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
