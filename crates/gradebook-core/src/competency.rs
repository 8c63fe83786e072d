//! Competency roller: evidence per learning outcome rolled up through
//! sub-strand and strand to a single subject level.
//!
//! Rollup policy is "weakest link": every node takes the minimum level of
//! its children that have evidence. A sub-strand is only as strong as its
//! weakest demonstrated outcome. Children without evidence are excluded
//! rather than treated as the lowest level, and a node with no evidenced
//! children is itself undefined.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use crate::model::{EvidenceId, OutcomeId, ScaleId, StrandId, SubStrandId};
use crate::normalizer::normalize_evidence;
use crate::records::{CompetencyTree, EvidenceRecord};
use crate::scale::ScaleIndex;

/// A normalized evidence record ready for rollup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub outcome: OutcomeId,
    pub evidence: EvidenceId,
    pub observed_at: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    pub achievement: f64,
}

impl Observation {
    /// Ordering used to pick the evidence that stands for an outcome:
    /// observation date first, then recording time, then id.
    fn recency(&self) -> (NaiveDate, DateTime<Utc>, EvidenceId) {
        (self.observed_at, self.recorded_at, self.evidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeLevel {
    pub outcome: OutcomeId,
    pub code: String,
    pub level: Option<f64>,
    /// The evidence record the level was taken from.
    pub evidence: Option<EvidenceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStrandRollup {
    pub sub_strand: SubStrandId,
    pub code: String,
    pub level: Option<f64>,
    pub outcomes: Vec<OutcomeLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandRollup {
    pub strand: StrandId,
    pub code: String,
    pub level: Option<f64>,
    pub sub_strands: Vec<SubStrandRollup>,
}

/// Rollup of one subject for one student.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetencyRollup {
    /// Subject level on [0, 1], `None` when no outcome has evidence.
    pub level: Option<f64>,
    pub strands: Vec<StrandRollup>,
}

/// Outcome of normalizing and rolling a batch of evidence.
#[derive(Debug, Clone, Default)]
pub struct RollOutput {
    pub rollup: CompetencyRollup,
    /// Evidence records looked at.
    pub considered: usize,
    /// Records skipped, with the reason.
    pub skipped: Vec<(EvidenceId, String)>,
    /// Narratives from descriptive evidence, oldest first.
    pub narratives: Vec<String>,
}

fn min_defined(levels: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    levels.into_iter().flatten().reduce(f64::min)
}

/// Roll normalized observations up the hierarchy.
///
/// Within one outcome the most recently observed evidence wins. Observations
/// for outcomes outside `tree` are ignored.
pub fn roll(observations: &[Observation], tree: &CompetencyTree) -> CompetencyRollup {
    let mut latest: HashMap<OutcomeId, &Observation> = HashMap::new();
    for obs in observations {
        latest
            .entry(obs.outcome)
            .and_modify(|current| {
                if obs.recency() > current.recency() {
                    *current = obs;
                }
            })
            .or_insert(obs);
    }

    let mut strands: Vec<_> = tree.strands.iter().collect();
    strands.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.code.cmp(&b.code)));

    let strand_rollups: Vec<StrandRollup> = strands
        .into_iter()
        .map(|strand| {
            let mut subs: Vec<_> = tree
                .sub_strands
                .iter()
                .filter(|s| s.strand == strand.id)
                .collect();
            subs.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.code.cmp(&b.code)));

            let sub_strands: Vec<SubStrandRollup> = subs
                .into_iter()
                .map(|sub| {
                    let mut outcomes: Vec<OutcomeLevel> = tree
                        .outcomes
                        .iter()
                        .filter(|o| o.sub_strand == sub.id)
                        .map(|o| {
                            let obs = latest.get(&o.id);
                            OutcomeLevel {
                                outcome: o.id,
                                code: o.code.clone(),
                                level: obs.map(|x| x.achievement),
                                evidence: obs.map(|x| x.evidence),
                            }
                        })
                        .collect();
                    outcomes.sort_by(|a, b| a.code.cmp(&b.code));
                    SubStrandRollup {
                        sub_strand: sub.id,
                        code: sub.code.clone(),
                        level: min_defined(outcomes.iter().map(|o| o.level)),
                        outcomes,
                    }
                })
                .collect();

            StrandRollup {
                strand: strand.id,
                code: strand.code.clone(),
                level: min_defined(sub_strands.iter().map(|s| s.level)),
                sub_strands,
            }
        })
        .collect();

    CompetencyRollup {
        level: min_defined(strand_rollups.iter().map(|s| s.level)),
        strands: strand_rollups,
    }
}

/// Normalize evidence and roll it up.
///
/// Item-level failures skip the record. A structural failure (an unusable
/// scale) aborts the whole rollup.
pub fn roll_evidence(
    evidence: &[EvidenceRecord],
    tree: &CompetencyTree,
    scales: &ScaleIndex,
    competency_scale: Option<ScaleId>,
) -> Result<RollOutput, AggregationError> {
    let known: HashSet<OutcomeId> = tree.outcomes.iter().map(|o| o.id).collect();

    let mut ordered: Vec<&EvidenceRecord> = evidence.iter().collect();
    ordered.sort_by_key(|e| (e.observed_at, e.recorded_at, e.id));

    let mut output = RollOutput {
        considered: ordered.len(),
        ..RollOutput::default()
    };
    let mut observations = Vec::with_capacity(ordered.len());

    for record in ordered {
        if !known.contains(&record.learning_outcome) {
            output.skipped.push((
                record.id,
                format!(
                    "learning outcome {} is outside the subject hierarchy",
                    record.learning_outcome
                ),
            ));
            continue;
        }
        match normalize_evidence(record, scales, competency_scale) {
            Ok(normalized) => match normalized.achievement {
                Some(achievement) => observations.push(Observation {
                    outcome: record.learning_outcome,
                    evidence: record.id,
                    observed_at: record.observed_at,
                    recorded_at: record.recorded_at,
                    achievement,
                }),
                None if !normalized.label.is_empty() => output.narratives.push(normalized.label),
                None => {}
            },
            Err(e) if e.is_structural() => return Err(e),
            Err(e) => output.skipped.push((record.id, e.to_string())),
        }
    }

    output.rollup = roll(&observations, tree);
    Ok(output)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::records::{LearningOutcome, Strand, SubStrand};
    use chrono::TimeZone;

    /// Two strands; ALG has sub-strands ALG.1 (outcomes 1, 2) and ALG.2
    /// (outcome 3); GEO has GEO.1 (outcome 4).
    pub(crate) fn tree() -> CompetencyTree {
        let strand = |id, code: &str, seq| Strand {
            id: StrandId(id),
            code: code.into(),
            name: code.into(),
            subject: None,
            sequence: seq,
        };
        let sub = |id, code: &str, strand, seq| SubStrand {
            id: SubStrandId(id),
            code: code.into(),
            name: code.into(),
            strand: StrandId(strand),
            sequence: seq,
        };
        let outcome = |id, code: &str, sub| LearningOutcome {
            id: OutcomeId(id),
            code: code.into(),
            description: String::new(),
            sub_strand: SubStrandId(sub),
        };
        CompetencyTree {
            strands: vec![strand(2, "GEO", 2), strand(1, "ALG", 1)],
            sub_strands: vec![
                sub(1, "ALG.1", 1, 1),
                sub(2, "ALG.2", 1, 2),
                sub(3, "GEO.1", 2, 1),
            ],
            outcomes: vec![
                outcome(1, "ALG.1.1", 1),
                outcome(2, "ALG.1.2", 1),
                outcome(3, "ALG.2.1", 2),
                outcome(4, "GEO.1.1", 3),
            ],
        }
    }

    pub(crate) fn obs(id: i64, outcome: i64, day: u32, achievement: f64) -> Observation {
        Observation {
            outcome: OutcomeId(outcome),
            evidence: EvidenceId(id),
            observed_at: NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
            recorded_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            achievement,
        }
    }

    #[test]
    fn minimum_rolls_up_each_level() {
        let rollup = roll(
            &[
                obs(1, 1, 1, 1.0),
                obs(2, 2, 1, 0.5),
                obs(3, 3, 1, 0.75),
                obs(4, 4, 1, 0.25),
            ],
            &tree(),
        );
        assert_eq!(rollup.strands[0].code, "ALG");
        assert_eq!(rollup.strands[0].sub_strands[0].level, Some(0.5));
        assert_eq!(rollup.strands[0].sub_strands[1].level, Some(0.75));
        assert_eq!(rollup.strands[0].level, Some(0.5));
        assert_eq!(rollup.strands[1].level, Some(0.25));
        assert_eq!(rollup.level, Some(0.25));
    }

    #[test]
    fn latest_observation_supersedes_earlier_evidence() {
        let rollup = roll(&[obs(1, 1, 10, 1.0), obs(2, 1, 3, 0.0)], &tree());
        let outcome = &rollup.strands[0].sub_strands[0].outcomes[0];
        assert_eq!(outcome.level, Some(1.0));
        assert_eq!(outcome.evidence, Some(EvidenceId(1)));
    }

    #[test]
    fn observation_date_beats_recording_time() {
        let mut late_recorded = obs(1, 1, 3, 0.0);
        late_recorded.recorded_at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let rollup = roll(&[late_recorded, obs(2, 1, 4, 0.5)], &tree());
        assert_eq!(rollup.strands[0].sub_strands[0].outcomes[0].level, Some(0.5));
    }

    #[test]
    fn nodes_without_evidence_are_undefined() {
        let rollup = roll(&[obs(1, 1, 1, 0.5)], &tree());
        assert_eq!(rollup.strands[0].sub_strands[1].level, None);
        assert_eq!(rollup.strands[1].level, None);
        // Undefined siblings do not drag the parent to zero.
        assert_eq!(rollup.strands[0].level, Some(0.5));
        assert_eq!(rollup.level, Some(0.5));

        assert_eq!(roll(&[], &tree()).level, None);
    }

    #[test]
    fn higher_sibling_never_lowers_the_minimum() {
        let base = vec![obs(1, 1, 1, 0.5), obs(2, 3, 1, 0.75)];
        let before = roll(&base, &tree()).level.unwrap();

        let mut more = base.clone();
        more.push(obs(3, 2, 1, 1.0));
        let after = roll(&more, &tree()).level.unwrap();
        assert!(after >= before);

        // Superseding the binding minimum with a higher level raises it.
        more.push(obs(4, 1, 20, 1.0));
        let raised = roll(&more, &tree()).level.unwrap();
        assert_eq!(raised, 0.75);
    }
}
