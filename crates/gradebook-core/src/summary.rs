//! Produced summary rows and the attendance aggregation.
//!
//! Summaries carry no identity beyond their key and are always derivable
//! from current raw state, so the engine may overwrite them freely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::competency::CompetencyRollup;
use crate::model::{AttendanceKey, GradeKey};
use crate::policy::Rounding;
use crate::records::{AttendanceRecords, AttendanceStatus};

/// Items left out of a computation, for partial-data disclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exclusions {
    /// Raw rows examined.
    pub considered: u32,
    /// Rows skipped because they could not be normalized.
    pub excluded: u32,
    /// Why rows were skipped, plus notes about tolerated scale problems.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Exclusions {
    /// "computed with N of M items excluded", or `None` when nothing was dropped.
    pub fn disclosure(&self) -> Option<String> {
        (self.excluded > 0).then(|| {
            format!(
                "computed with {} of {} items excluded",
                self.excluded, self.considered
            )
        })
    }

    pub(crate) fn exclude(&mut self, reason: String) {
        self.excluded += 1;
        self.warnings.push(reason);
    }
}

/// Competency rollup as reported on a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencySummary {
    /// Subject rollup level as a rounded percentage.
    pub level_percent: Option<f64>,
    /// Code of the rubric level the rollup reaches, e.g. "ME".
    pub level_code: Option<String>,
    pub rollup: CompetencyRollup,
}

/// The computed part of a `GradeSummary`: everything but the timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradeFigures {
    /// Graded assessment rows, including descriptive ones.
    pub total_assessments: u32,
    /// Unweighted mean percentage. `None` means no data, not 0%.
    pub average_score: Option<f64>,
    /// Weighted mean percentage. `None` means no data, not 0%.
    pub weighted_average: Option<f64>,
    pub final_grade: Option<String>,
    /// Σ effective weight of the assessments that contributed.
    pub total_weight: f64,
    #[serde(default)]
    pub competency: Option<CompetencySummary>,
    /// Descriptive comments and narratives, passed through.
    #[serde(default)]
    pub qualitative: Vec<String>,
    #[serde(default)]
    pub exclusions: Exclusions,
}

/// One row per (student, term, subject).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeSummary {
    pub key: GradeKey,
    #[serde(flatten)]
    pub figures: GradeFigures,
    pub last_updated: DateTime<Utc>,
}

/// The computed part of an `AttendanceSummary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceFigures {
    pub total_sessions: u32,
    pub present_count: u32,
    pub absent_count: u32,
    pub late_count: u32,
    /// Excused and sick sessions.
    pub excused_count: u32,
    /// (present + late) / (total − excused), as a rounded percentage.
    pub attendance_percentage: Option<f64>,
}

/// One row per (student, term, subject-or-all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub key: AttendanceKey,
    #[serde(flatten)]
    pub figures: AttendanceFigures,
    pub last_updated: DateTime<Utc>,
}

/// Count attendance marks for one key.
pub fn build_attendance_figures(records: &AttendanceRecords, rounding: Rounding) -> AttendanceFigures {
    let mut figures = AttendanceFigures::default();
    let marks = records
        .marks
        .iter()
        .filter(|m| records.key.subject.map_or(true, |s| m.subject == s));

    for mark in marks {
        figures.total_sessions += 1;
        match mark.status {
            AttendanceStatus::Present => figures.present_count += 1,
            AttendanceStatus::Absent => figures.absent_count += 1,
            AttendanceStatus::Late => figures.late_count += 1,
            AttendanceStatus::Excused | AttendanceStatus::Sick => figures.excused_count += 1,
        }
    }

    let expected = figures.total_sessions - figures.excused_count;
    figures.attendance_percentage = (expected > 0).then(|| {
        let attended = (figures.present_count + figures.late_count) as f64;
        rounding.apply(attended / expected as f64 * 100.0)
    });
    figures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SessionId, StudentId, SubjectId, TermId};
    use crate::records::AttendanceMark;
    use chrono::{NaiveDate, TimeZone};

    fn records(subject: Option<SubjectId>, statuses: &[(i64, AttendanceStatus)]) -> AttendanceRecords {
        AttendanceRecords {
            key: AttendanceKey {
                student: StudentId(1),
                term: TermId(1),
                subject,
            },
            marks: statuses
                .iter()
                .enumerate()
                .map(|(i, (subject, status))| AttendanceMark {
                    session: SessionId(i as i64),
                    subject: SubjectId(*subject),
                    session_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                    status: *status,
                })
                .collect(),
            as_of: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn counts_and_percentage_exclude_excused() {
        use AttendanceStatus::*;
        let r = records(
            None,
            &[(1, Present), (1, Late), (2, Absent), (2, Sick), (1, Excused), (2, Present)],
        );
        let f = build_attendance_figures(&r, Rounding::default());
        assert_eq!(f.total_sessions, 6);
        assert_eq!(f.present_count, 2);
        assert_eq!(f.late_count, 1);
        assert_eq!(f.absent_count, 1);
        assert_eq!(f.excused_count, 2);
        assert_eq!(f.attendance_percentage, Some(75.0));
    }

    #[test]
    fn subject_key_filters_marks() {
        use AttendanceStatus::*;
        let r = records(Some(SubjectId(2)), &[(1, Present), (2, Absent), (2, Present)]);
        let f = build_attendance_figures(&r, Rounding::default());
        assert_eq!(f.total_sessions, 2);
        assert_eq!(f.attendance_percentage, Some(50.0));
    }

    #[test]
    fn no_countable_sessions_is_undefined() {
        let empty = build_attendance_figures(&records(None, &[]), Rounding::default());
        assert_eq!(empty.total_sessions, 0);
        assert_eq!(empty.attendance_percentage, None);

        let all_excused = build_attendance_figures(
            &records(None, &[(1, AttendanceStatus::Excused)]),
            Rounding::default(),
        );
        assert_eq!(all_excused.attendance_percentage, None);
    }

    #[test]
    fn disclosure_only_when_items_dropped() {
        let mut e = Exclusions {
            considered: 5,
            ..Exclusions::default()
        };
        assert_eq!(e.disclosure(), None);
        e.exclude("bad score".into());
        assert_eq!(
            e.disclosure().as_deref(),
            Some("computed with 1 of 5 items excluded")
        );
    }
}
