//! Grade summary builder: runs the normalizer, resolver and, for
//! competency-based curricula, the roller over one key's snapshot.
//!
//! Pure: the same snapshot, scales and policy always give the same figures.

use tracing::warn;

use crate::competency::roll_evidence;
use crate::error::AggregationError;
use crate::normalizer::normalize_score;
use crate::policy::GradingPolicy;
use crate::records::{GradeRecords, ScoreRow};
use crate::scale::ScaleIndex;
use crate::summary::{CompetencySummary, Exclusions, GradeFigures};
use crate::weighting::{resolve, WeightedItem};

/// Compute the figures of one `GradeSummary`.
///
/// A bad row is skipped and recorded in `exclusions`; an unusable rubric
/// scale fails the whole key.
pub fn build_grade_figures(
    records: &GradeRecords,
    scales: &ScaleIndex,
    policy: &GradingPolicy,
) -> Result<GradeFigures, AggregationError> {
    let mut exclusions = Exclusions::default();
    let mut qualitative = Vec::new();
    let mut items = Vec::with_capacity(records.scores.len());
    let mut total_assessments = 0u32;

    for scale_id in records.referenced_scales() {
        if let Some(scale) = scales.get(scale_id) {
            if !scale.is_monotonic() {
                warn!(key = %records.key, scale = %scale_id, "rubric scale values are not monotonic");
                exclusions.warnings.push(format!(
                    "rubric scale {scale_id} numeric values are not monotonic with sequence"
                ));
            }
        }
    }

    let mut rows: Vec<&ScoreRow> = records.scores.iter().collect();
    rows.sort_by_key(|r| (r.assessment.id, r.score.graded_at));

    for row in rows {
        exclusions.considered += 1;
        let assessment = &row.assessment;
        let normalized = match normalize_score(row, scales) {
            Ok(n) => n,
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => {
                warn!(key = %records.key, assessment = %assessment.id, "excluding score: {e}");
                exclusions.exclude(format!("assessment {}: {e}", assessment.id));
                continue;
            }
        };
        if !normalized.present {
            continue;
        }

        match normalized.achievement {
            Some(achievement) => {
                let weight = policy.effective_weight(assessment);
                if !weight.is_finite() || weight < 0.0 {
                    let e = AggregationError::InvalidScore(format!(
                        "weight {weight} on assessment {}",
                        assessment.id
                    ));
                    warn!(key = %records.key, "excluding score: {e}");
                    exclusions.exclude(format!("assessment {}: {e}", assessment.id));
                    continue;
                }
                total_assessments += 1;
                items.push(WeightedItem {
                    achievement: Some(achievement),
                    weight,
                    present: true,
                });
            }
            None => {
                total_assessments += 1;
                qualitative.push(format!("{}: {}", assessment.name, normalized.label));
            }
        }
    }

    let resolution = resolve(&items);
    let average_score = resolution.simple_average.map(|a| policy.to_percent(a));
    let weighted_average = resolution.weighted_average.map(|a| policy.to_percent(a));

    let (final_grade, competency) = if policy.competency_based {
        let output = roll_evidence(
            &records.evidence,
            &records.tree,
            scales,
            records.subject.competency_scale,
        )?;
        exclusions.considered += output.considered as u32;
        for (evidence, reason) in output.skipped {
            warn!(key = %records.key, evidence = %evidence, "excluding evidence: {reason}");
            exclusions.exclude(format!("evidence {evidence}: {reason}"));
        }
        qualitative.extend(output.narratives);

        let level = output.rollup.level;
        let level_code = match (level, records.subject.competency_scale) {
            (Some(level), Some(scale_id)) => match scales.get(scale_id) {
                Some(scale) => Some(scale.level_at(level)?.code.clone()),
                None => {
                    exclusions
                        .warnings
                        .push(format!("competency scale {scale_id} not found; level left unlabelled"));
                    None
                }
            },
            (Some(_), None) => {
                exclusions.warnings.push(
                    "subject has no competency scale; level left unlabelled".to_string(),
                );
                None
            }
            (None, _) => None,
        };

        let summary = CompetencySummary {
            level_percent: level.map(|l| policy.to_percent(l)),
            level_code: level_code.clone(),
            rollup: output.rollup,
        };
        (level_code, Some(summary))
    } else {
        let grade = weighted_average.and_then(|p| policy.grade_label(p));
        (grade, None)
    };

    Ok(GradeFigures {
        total_assessments,
        average_score,
        weighted_average,
        final_grade,
        total_weight: resolution.total_weight,
        competency,
        qualitative,
        exclusions,
    })
}
