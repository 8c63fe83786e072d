//! Raw rows consumed by the engine, and the per-key snapshots a record
//! source hands over for one computation.
//!
//! These are read-only to the engine. Validation of foreign keys and
//! uniqueness is the persistence layer's job.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AssessmentId, AssessmentKind, AttendanceKey, CurriculumType, EvidenceId, GradeKey, LevelId,
    OutcomeId, ScaleId, SessionId, StrandId, StudentId, SubStrandId, SubjectId, TermId,
};

/// A term with its date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Term {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// A subject and the curriculum it is taught under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub code: String,
    pub name: String,
    pub curriculum: CurriculumType,
    /// Active rubric scale of the subject's curriculum, used to label
    /// competency rollups and to read numeric evidence.
    #[serde(default)]
    pub competency_scale: Option<ScaleId>,
}

/// How an assessment is evaluated. Each variant carries only the fields
/// valid for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "evaluation_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Evaluation {
    Numeric { total_marks: f64 },
    Rubric { rubric_scale: ScaleId },
    Descriptive,
    Competency { rubric_scale: ScaleId },
}

impl Evaluation {
    pub fn rubric_scale(&self) -> Option<ScaleId> {
        match self {
            Evaluation::Rubric { rubric_scale } | Evaluation::Competency { rubric_scale } => {
                Some(*rubric_scale)
            }
            Evaluation::Numeric { .. } | Evaluation::Descriptive => None,
        }
    }
}

/// An assessment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: AssessmentId,
    pub name: String,
    pub subject: SubjectId,
    /// `None` for year-round assessments.
    #[serde(default)]
    pub term: Option<TermId>,
    pub kind: AssessmentKind,
    pub evaluation: Evaluation,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub assessment_date: Option<NaiveDate>,
}

fn default_weight() -> f64 {
    1.0
}

impl Assessment {
    /// Whether this assessment counts toward `term`.
    ///
    /// Year-round assessments count in the term containing their date, or
    /// in every term when undated.
    pub fn applies_to(&self, term: &Term) -> bool {
        match (self.term, self.assessment_date) {
            (Some(id), _) => id == term.id,
            (None, Some(date)) => term.contains(date),
            (None, None) => true,
        }
    }
}

/// The mark recorded for one student on one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScoreMark {
    Numeric(f64),
    Rubric(LevelId),
    /// Not yet graded, or excused.
    Ungraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentScore {
    pub assessment: AssessmentId,
    pub student: StudentId,
    pub mark: ScoreMark,
    #[serde(default)]
    pub comments: String,
    pub graded_at: DateTime<Utc>,
}

/// A score together with the assessment it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRow {
    pub assessment: Assessment,
    pub score: AssessmentScore,
}

/// A reference to a rubric level inside its scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelRef {
    pub scale: ScaleId,
    pub level: LevelId,
}

/// The evaluation carried by an evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "evaluation_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidencePayload {
    Numeric { numeric_score: f64 },
    Rubric { rubric_level: LevelRef },
    Descriptive { narrative: String },
    Competency { rubric_level: LevelRef },
}

/// A dated observation of a student against one learning outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub id: EvidenceId,
    pub student: StudentId,
    pub learning_outcome: OutcomeId,
    #[serde(default)]
    pub source_type: String,
    pub payload: EvidencePayload,
    pub observed_at: NaiveDate,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strand {
    pub id: StrandId,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subject: Option<SubjectId>,
    #[serde(default)]
    pub sequence: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStrand {
    pub id: SubStrandId,
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub strand: StrandId,
    #[serde(default)]
    pub sequence: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningOutcome {
    pub id: OutcomeId,
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub sub_strand: SubStrandId,
}

/// The strand → sub-strand → outcome hierarchy of one subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetencyTree {
    #[serde(default)]
    pub strands: Vec<Strand>,
    #[serde(default)]
    pub sub_strands: Vec<SubStrand>,
    #[serde(default)]
    pub outcomes: Vec<LearningOutcome>,
}

/// Everything needed to compute one `GradeSummary`, read as of one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeRecords {
    pub key: GradeKey,
    pub subject: Subject,
    #[serde(default)]
    pub scores: Vec<ScoreRow>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRecord>,
    #[serde(default)]
    pub tree: CompetencyTree,
    pub as_of: DateTime<Utc>,
}

impl GradeRecords {
    /// Every rubric scale the rows refer to, including the subject's
    /// competency scale.
    pub fn referenced_scales(&self) -> BTreeSet<ScaleId> {
        let mut scales: BTreeSet<ScaleId> = self
            .scores
            .iter()
            .filter_map(|row| row.assessment.evaluation.rubric_scale())
            .collect();
        for evidence in &self.evidence {
            if let EvidencePayload::Rubric { rubric_level }
            | EvidencePayload::Competency { rubric_level } = &evidence.payload
            {
                scales.insert(rubric_level.scale);
            }
        }
        scales.extend(self.subject.competency_scale);
        scales
    }
}

/// Student attendance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
    Sick,
}

/// One student's attendance at one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceMark {
    pub session: SessionId,
    pub subject: SubjectId,
    pub session_date: NaiveDate,
    pub status: AttendanceStatus,
}

/// Everything needed to compute one `AttendanceSummary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecords {
    pub key: AttendanceKey,
    #[serde(default)]
    pub marks: Vec<AttendanceMark>,
    pub as_of: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term() -> Term {
        Term {
            id: TermId(1),
            name: "Term 1".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 4, 5).unwrap(),
        }
    }

    fn assessment(term: Option<TermId>, date: Option<NaiveDate>) -> Assessment {
        Assessment {
            id: AssessmentId(1),
            name: "Project".into(),
            subject: SubjectId(1),
            term,
            kind: AssessmentKind::Project,
            evaluation: Evaluation::Descriptive,
            weight: 1.0,
            assessment_date: date,
        }
    }

    #[test]
    fn year_round_assessments_follow_their_date() {
        let t = term();
        assert!(assessment(Some(TermId(1)), None).applies_to(&t));
        assert!(!assessment(Some(TermId(2)), None).applies_to(&t));
        assert!(assessment(None, NaiveDate::from_ymd_opt(2024, 2, 1)).applies_to(&t));
        assert!(!assessment(None, NaiveDate::from_ymd_opt(2024, 6, 1)).applies_to(&t));
        assert!(assessment(None, None).applies_to(&t));
    }

    #[test]
    fn evaluation_deserializes_from_tagged_json() {
        let json = r#"{"evaluation_type":"NUMERIC","total_marks":50.0}"#;
        let eval: Evaluation = serde_json::from_str(json).unwrap();
        assert_eq!(eval, Evaluation::Numeric { total_marks: 50.0 });

        let json = r#"{"evaluation_type":"RUBRIC","rubric_scale":3}"#;
        let eval: Evaluation = serde_json::from_str(json).unwrap();
        assert_eq!(eval.rubric_scale(), Some(ScaleId(3)));
    }

    #[test]
    fn score_mark_serde_shape() {
        let json = serde_json::to_string(&ScoreMark::Numeric(42.5)).unwrap();
        assert_eq!(json, r#"{"type":"numeric","value":42.5}"#);
        let ungraded: ScoreMark = serde_json::from_str(r#"{"type":"ungraded"}"#).unwrap();
        assert_eq!(ungraded, ScoreMark::Ungraded);
    }
}
