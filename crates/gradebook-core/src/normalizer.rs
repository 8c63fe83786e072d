//! Evaluation normalizer: one raw score or evidence record in, one
//! unit-interval achievement out.

use crate::error::AggregationError;
use crate::model::ScaleId;
use crate::records::{Evaluation, EvidencePayload, EvidenceRecord, ScoreMark, ScoreRow};
use crate::scale::ScaleIndex;

/// A single normalized item.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Achievement on [0, 1]. `None` for qualitative-only items.
    pub achievement: Option<f64>,
    /// `false` for ungraded or excused entries, which are left out of
    /// averages instead of counting as zero.
    pub present: bool,
    /// Display label ("40/50", "ME", narrative text).
    pub label: String,
}

impl Normalized {
    fn scored(achievement: f64, label: String) -> Self {
        Self {
            achievement: Some(achievement),
            present: true,
            label,
        }
    }

    fn qualitative(label: String) -> Self {
        Self {
            achievement: None,
            present: true,
            label,
        }
    }

    fn absent() -> Self {
        Self {
            achievement: None,
            present: false,
            label: "ungraded".into(),
        }
    }
}

/// Normalize one assessment score against its assessment.
pub fn normalize_score(row: &ScoreRow, scales: &ScaleIndex) -> Result<Normalized, AggregationError> {
    let assessment = &row.assessment;
    match &assessment.evaluation {
        Evaluation::Numeric { total_marks } => {
            let total = *total_marks;
            if !total.is_finite() || total <= 0.0 {
                return Err(AggregationError::InvalidScore(format!(
                    "assessment {} has total_marks {total}",
                    assessment.id
                )));
            }
            match &row.score.mark {
                ScoreMark::Ungraded => Ok(Normalized::absent()),
                ScoreMark::Numeric(score) => {
                    let score = *score;
                    if !score.is_finite() || score < 0.0 {
                        return Err(AggregationError::InvalidScore(format!(
                            "score {score} on assessment {}",
                            assessment.id
                        )));
                    }
                    Ok(Normalized::scored(
                        (score / total).clamp(0.0, 1.0),
                        format!("{score}/{total}"),
                    ))
                }
                ScoreMark::Rubric(level) => Err(AggregationError::InvalidScore(format!(
                    "rubric level {level} recorded against numeric assessment {}",
                    assessment.id
                ))),
            }
        }
        Evaluation::Rubric { rubric_scale } | Evaluation::Competency { rubric_scale } => {
            match &row.score.mark {
                ScoreMark::Ungraded => Ok(Normalized::absent()),
                ScoreMark::Rubric(level) => {
                    let scale = scales.require(*rubric_scale)?;
                    let (achievement, level) = scale.normalize_level(*level)?;
                    Ok(Normalized::scored(achievement, level.code.clone()))
                }
                ScoreMark::Numeric(score) => Err(AggregationError::InvalidScore(format!(
                    "numeric score {score} recorded against rubric assessment {}",
                    assessment.id
                ))),
            }
        }
        Evaluation::Descriptive => {
            let comments = row.score.comments.trim();
            let label = if comments.is_empty() {
                "descriptive".to_string()
            } else {
                comments.to_string()
            };
            Ok(Normalized::qualitative(label))
        }
    }
}

/// Normalize one evidence record.
///
/// Numeric evidence is read on the numeric range of the subject's
/// competency scale, so it lands on the same axis as rubric evidence.
pub fn normalize_evidence(
    evidence: &EvidenceRecord,
    scales: &ScaleIndex,
    competency_scale: Option<ScaleId>,
) -> Result<Normalized, AggregationError> {
    match &evidence.payload {
        EvidencePayload::Numeric { numeric_score } => {
            let score = *numeric_score;
            if !score.is_finite() || score < 0.0 {
                return Err(AggregationError::InvalidScore(format!(
                    "numeric score {score} on evidence {}",
                    evidence.id
                )));
            }
            let scale_id = competency_scale.ok_or_else(|| {
                AggregationError::MissingContext(format!(
                    "no competency scale to read numeric evidence {}",
                    evidence.id
                ))
            })?;
            let achievement = scales.require(scale_id)?.normalize_value(score)?;
            Ok(Normalized::scored(achievement, format!("{score}")))
        }
        EvidencePayload::Rubric { rubric_level } | EvidencePayload::Competency { rubric_level } => {
            let scale = scales.require(rubric_level.scale)?;
            let (achievement, level) = scale.normalize_level(rubric_level.level)?;
            Ok(Normalized::scored(achievement, level.code.clone()))
        }
        EvidencePayload::Descriptive { narrative } => {
            Ok(Normalized::qualitative(narrative.trim().to_string()))
        }
    }
}
