//! Aggregation and recomputation error types.
//!
//! "No data" is not an error: an undefined average is a valid
//! outcome and is represented as `None`, never as an error or as zero.

use thiserror::Error;

use crate::model::ScaleId;

/// Errors raised while normalizing or aggregating raw rows.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    /// Malformed or out-of-range numeric input.
    #[error("invalid score: {0}")]
    InvalidScore(String),

    /// A rubric scale that cannot be used to normalize levels.
    #[error("inconsistent rubric scale {scale}: {reason}")]
    InconsistentScale { scale: ScaleId, reason: String },

    /// A referenced rubric level or scale was not found.
    #[error("missing context: {0}")]
    MissingContext(String),
}

impl AggregationError {
    /// Returns `true` if the error concerns the aggregate structure rather
    /// than a single item, so the whole key must fail.
    pub fn is_structural(&self) -> bool {
        matches!(self, AggregationError::InconsistentScale { .. })
    }
}

/// Failures of one recomputation attempt for one key.
#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// The record source could not produce a snapshot.
    #[error("fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    /// The summary sink rejected the upsert.
    #[error("commit failed: {0:#}")]
    Commit(anyhow::Error),

    /// A storage call exceeded its bound.
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },
}

impl RecomputeError {
    /// Returns `true` if retrying with the same raw data could succeed.
    ///
    /// Aggregation errors are a pure function of the raw rows, so they only
    /// clear after the rows change and a new trigger arrives.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RecomputeError::Aggregation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_scale_errors_are_structural() {
        assert!(AggregationError::InconsistentScale {
            scale: ScaleId(1),
            reason: "flat".into()
        }
        .is_structural());
        assert!(!AggregationError::InvalidScore("neg".into()).is_structural());
        assert!(!AggregationError::MissingContext("level 9".into()).is_structural());
    }

    #[test]
    fn storage_failures_are_transient() {
        let timeout = RecomputeError::Timeout {
            stage: "fetch",
            timeout_ms: 50,
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.to_string(), "fetch timed out after 50ms");

        let agg: RecomputeError = AggregationError::InvalidScore("x".into()).into();
        assert!(!agg.is_transient());
    }
}
