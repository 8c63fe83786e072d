//! Identifiers, curriculum vocabulary and summary keys.
//!
//! Raw rows are referenced by opaque integer ids. The engine never follows
//! them as an object graph; it only passes them back to the record source.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

id_type!(
    /// A learner.
    StudentId,
    /// A term within an academic year.
    TermId,
    /// A subject taught under one curriculum.
    SubjectId,
    /// An assessment definition.
    AssessmentId,
    /// A rubric scale.
    ScaleId,
    /// A level within a rubric scale.
    LevelId,
    /// A competency strand.
    StrandId,
    /// A sub-strand within a strand.
    SubStrandId,
    /// A learning outcome within a sub-strand.
    OutcomeId,
    /// An evidence record.
    EvidenceId,
    /// A learning session.
    SessionId,
);

/// Supported curriculum frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CurriculumType {
    #[serde(rename = "8-4-4")]
    EightFourFour,
    #[serde(rename = "CBC")]
    Cbc,
    #[serde(rename = "IGCSE")]
    Igcse,
    #[serde(rename = "CUSTOM")]
    Custom,
}

impl CurriculumType {
    pub const ALL: [CurriculumType; 4] = [
        CurriculumType::EightFourFour,
        CurriculumType::Cbc,
        CurriculumType::Igcse,
        CurriculumType::Custom,
    ];
}

impl fmt::Display for CurriculumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurriculumType::EightFourFour => write!(f, "8-4-4"),
            CurriculumType::Cbc => write!(f, "CBC"),
            CurriculumType::Igcse => write!(f, "IGCSE"),
            CurriculumType::Custom => write!(f, "CUSTOM"),
        }
    }
}

impl FromStr for CurriculumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "8-4-4" | "844" => Ok(CurriculumType::EightFourFour),
            "CBC" => Ok(CurriculumType::Cbc),
            "IGCSE" => Ok(CurriculumType::Igcse),
            "CUSTOM" => Ok(CurriculumType::Custom),
            other => Err(format!("unknown curriculum type: {other}")),
        }
    }
}

/// What kind of sitting an assessment is. Policies may scale weights by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentKind {
    Cat,
    Test,
    MainExam,
    Mock,
    Project,
    Assignment,
    Practical,
    Competency,
}

impl fmt::Display for AssessmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssessmentKind::Cat => "CAT",
            AssessmentKind::Test => "TEST",
            AssessmentKind::MainExam => "MAIN_EXAM",
            AssessmentKind::Mock => "MOCK",
            AssessmentKind::Project => "PROJECT",
            AssessmentKind::Assignment => "ASSIGNMENT",
            AssessmentKind::Practical => "PRACTICAL",
            AssessmentKind::Competency => "COMPETENCY",
        };
        f.write_str(s)
    }
}

impl FromStr for AssessmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace([' ', '-'], "_").as_str() {
            "CAT" => Ok(AssessmentKind::Cat),
            "TEST" => Ok(AssessmentKind::Test),
            "MAIN_EXAM" => Ok(AssessmentKind::MainExam),
            "MOCK" => Ok(AssessmentKind::Mock),
            "PROJECT" => Ok(AssessmentKind::Project),
            "ASSIGNMENT" => Ok(AssessmentKind::Assignment),
            "PRACTICAL" => Ok(AssessmentKind::Practical),
            "COMPETENCY" => Ok(AssessmentKind::Competency),
            other => Err(format!("unknown assessment kind: {other}")),
        }
    }
}

/// Unique key of a `GradeSummary` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GradeKey {
    pub student: StudentId,
    pub term: TermId,
    pub subject: SubjectId,
}

impl fmt::Display for GradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grade(student={}, term={}, subject={})",
            self.student, self.term, self.subject
        )
    }
}

/// Unique key of an `AttendanceSummary` row. `subject = None` covers the whole term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttendanceKey {
    pub student: StudentId,
    pub term: TermId,
    pub subject: Option<SubjectId>,
}

impl fmt::Display for AttendanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject {
            Some(subject) => write!(
                f,
                "attendance(student={}, term={}, subject={})",
                self.student, self.term, subject
            ),
            None => write!(
                f,
                "attendance(student={}, term={}, all subjects)",
                self.student, self.term
            ),
        }
    }
}

/// Anything the scheduler can enqueue for recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SummaryKey {
    Grade(GradeKey),
    Attendance(AttendanceKey),
}

impl From<GradeKey> for SummaryKey {
    fn from(key: GradeKey) -> Self {
        SummaryKey::Grade(key)
    }
}

impl From<AttendanceKey> for SummaryKey {
    fn from(key: AttendanceKey) -> Self {
        SummaryKey::Attendance(key)
    }
}

impl fmt::Display for SummaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryKey::Grade(k) => k.fmt(f),
            SummaryKey::Attendance(k) => k.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curriculum_display_and_parse() {
        assert_eq!(CurriculumType::EightFourFour.to_string(), "8-4-4");
        assert_eq!(
            "cbc".parse::<CurriculumType>().unwrap(),
            CurriculumType::Cbc
        );
        assert_eq!(
            "844".parse::<CurriculumType>().unwrap(),
            CurriculumType::EightFourFour
        );
        assert!("montessori".parse::<CurriculumType>().is_err());
    }

    #[test]
    fn assessment_kind_parse_accepts_spacing_variants() {
        assert_eq!(
            "main exam".parse::<AssessmentKind>().unwrap(),
            AssessmentKind::MainExam
        );
        assert_eq!(
            "MAIN-EXAM".parse::<AssessmentKind>().unwrap(),
            AssessmentKind::MainExam
        );
        assert_eq!(AssessmentKind::MainExam.to_string(), "MAIN_EXAM");
    }

    #[test]
    fn curriculum_serde_uses_source_codes() {
        let json = serde_json::to_string(&CurriculumType::EightFourFour).unwrap();
        assert_eq!(json, "\"8-4-4\"");
        let parsed: CurriculumType = serde_json::from_str("\"IGCSE\"").unwrap();
        assert_eq!(parsed, CurriculumType::Igcse);
    }

    #[test]
    fn summary_key_display() {
        let key = SummaryKey::from(AttendanceKey {
            student: StudentId(7),
            term: TermId(1),
            subject: None,
        });
        assert_eq!(
            key.to_string(),
            "attendance(student=7, term=1, all subjects)"
        );
    }
}
