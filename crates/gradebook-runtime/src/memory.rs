//! In-memory record and summary store.
//!
//! Reads take a single read lock, so each snapshot is consistent. Writes
//! compute the summary keys they affect and hand them to the registered
//! change listener once the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use gradebook_core::model::{AssessmentId, AttendanceKey, GradeKey, ScaleId, StudentId, SummaryKey};
use gradebook_core::records::{
    Assessment, AssessmentScore, AttendanceMark, AttendanceRecords, EvidenceRecord, GradeRecords,
};
use gradebook_core::scale::{RubricLevel, RubricScale};
use gradebook_core::summary::{AttendanceSummary, GradeSummary};
use gradebook_core::traits::{ChangeListener, RecordSource, SummarySink};

use crate::dataset::{AttendanceEntry, Dataset};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Summaries {
    grades: HashMap<GradeKey, GradeSummary>,
    attendance: HashMap<AttendanceKey, AttendanceSummary>,
}

/// Raw rows plus the summaries derived from them.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<Dataset>,
    summaries: RwLock<Summaries>,
    listener: RwLock<Option<Arc<dyn ChangeListener>>>,
}

impl MemoryStore {
    pub fn new(data: Dataset) -> Self {
        Self {
            data: RwLock::new(data),
            ..Self::default()
        }
    }

    /// Route change notifications to `listener`, typically the scheduler.
    pub fn set_listener(&self, listener: Arc<dyn ChangeListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn data(&self) -> RwLockReadGuard<'_, Dataset> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn data_mut(&self) -> RwLockWriteGuard<'_, Dataset> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn summaries(&self) -> RwLockReadGuard<'_, Summaries> {
        self.summaries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn summaries_mut(&self) -> RwLockWriteGuard<'_, Summaries> {
        self.summaries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, keys: Vec<SummaryKey>) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => {
                for key in keys {
                    listener.on_change(key);
                }
            }
            None => tracing::trace!(count = keys.len(), "no change listener registered"),
        }
    }

    /// Every summary key that has rows behind it, for a full rebuild.
    pub fn summary_keys(&self) -> Vec<SummaryKey> {
        let data = self.data();
        let mut keys = data.grade_keys();
        keys.extend(data.attendance_summary_keys());
        keys
    }

    /// Enqueue every summary key with the listener.
    pub fn notify_all(&self) {
        self.notify(self.summary_keys());
    }

    /// Insert or replace the score of `score.student` on `score.assessment`.
    pub fn upsert_score(&self, score: AssessmentScore) -> Result<(), StoreError> {
        let keys = {
            let mut data = self.data_mut();
            data.check_score(&score)?;
            let keys = data.score_keys(score.assessment, score.student)?;
            match data
                .scores
                .iter_mut()
                .find(|s| s.assessment == score.assessment && s.student == score.student)
            {
                Some(existing) => *existing = score,
                None => data.scores.push(score),
            }
            keys
        };
        self.notify(keys);
        Ok(())
    }

    /// Remove a score. Returns whether one existed.
    pub fn delete_score(&self, assessment: AssessmentId, student: StudentId) -> Result<bool, StoreError> {
        let keys = {
            let mut data = self.data_mut();
            let keys = data.score_keys(assessment, student)?;
            let before = data.scores.len();
            data.scores
                .retain(|s| !(s.assessment == assessment && s.student == student));
            if data.scores.len() == before {
                return Ok(false);
            }
            keys
        };
        self.notify(keys);
        Ok(true)
    }

    /// Insert or replace an assessment definition. Weight, term or
    /// evaluation changes affect every student scored on it.
    pub fn upsert_assessment(&self, assessment: Assessment) -> Result<(), StoreError> {
        let keys = {
            let mut data = self.data_mut();
            data.subject(assessment.subject)?;
            if let Some(term) = assessment.term {
                data.term(term)?;
            }
            if let Some(scale) = assessment.evaluation.rubric_scale() {
                data.scale(scale)?;
            }
            let mut keys = data.assessment_keys(&assessment);
            match data.assessments.iter_mut().find(|a| a.id == assessment.id) {
                Some(existing) => {
                    let previous = std::mem::replace(existing, assessment);
                    keys.extend(data.assessment_keys(&previous));
                }
                None => data.assessments.push(assessment),
            }
            keys.sort();
            keys.dedup();
            keys
        };
        self.notify(keys);
        Ok(())
    }

    /// Append an evidence record.
    pub fn add_evidence(&self, evidence: EvidenceRecord) -> Result<(), StoreError> {
        let keys = {
            let mut data = self.data_mut();
            data.check_evidence(&evidence)?;
            let keys = data.evidence_keys(&evidence)?;
            data.evidence.push(evidence);
            keys
        };
        self.notify(keys);
        Ok(())
    }

    /// Replace one level of a rubric scale, e.g. after editing its numeric
    /// value. Every summary normalized against the scale is affected.
    pub fn update_rubric_level(&self, scale: ScaleId, level: RubricLevel) -> Result<(), StoreError> {
        let keys = {
            let mut data = self.data_mut();
            let target = data
                .scales
                .iter_mut()
                .find(|s| s.id == scale)
                .ok_or(StoreError::UnknownScale(scale))?;
            let existing = target
                .levels
                .iter_mut()
                .find(|l| l.id == level.id)
                .ok_or(StoreError::UnknownLevel {
                    scale,
                    level: level.id,
                })?;
            *existing = level;
            data.scale_keys(scale)
        };
        self.notify(keys);
        Ok(())
    }

    /// Record or replace the student's mark for one session.
    pub fn record_attendance(&self, student: StudentId, mark: AttendanceMark) -> Result<(), StoreError> {
        let keys = {
            let mut data = self.data_mut();
            data.subject(mark.subject)?;
            let mut keys = data.attendance_keys(student, &mark)?;
            let position = data
                .attendance
                .iter()
                .position(|e| e.student == student && e.mark.session == mark.session);
            match position {
                Some(i) => {
                    let previous = std::mem::replace(&mut data.attendance[i].mark, mark);
                    // The old subject or term row loses this session.
                    if let Ok(old) = data.attendance_keys(student, &previous) {
                        keys.extend(old);
                    }
                }
                None => data.attendance.push(AttendanceEntry { student, mark }),
            }
            keys.sort();
            keys.dedup();
            keys
        };
        self.notify(keys);
        Ok(())
    }

    pub fn grade_summary(&self, key: &GradeKey) -> Option<GradeSummary> {
        self.summaries().grades.get(key).cloned()
    }

    pub fn attendance_summary(&self, key: &AttendanceKey) -> Option<AttendanceSummary> {
        self.summaries().attendance.get(key).cloned()
    }

    /// All grade summaries, ordered by key.
    pub fn grade_summaries(&self) -> Vec<GradeSummary> {
        let mut all: Vec<GradeSummary> = self.summaries().grades.values().cloned().collect();
        all.sort_by_key(|s| s.key);
        all
    }
}

#[async_trait]
impl RecordSource for MemoryStore {
    async fn grade_records(&self, key: &GradeKey) -> anyhow::Result<GradeRecords> {
        Ok(self.data().grade_records(key, Utc::now())?)
    }

    async fn attendance_records(&self, key: &AttendanceKey) -> anyhow::Result<AttendanceRecords> {
        Ok(self.data().attendance_records(key, Utc::now())?)
    }

    async fn rubric_scale(&self, id: ScaleId) -> anyhow::Result<Option<RubricScale>> {
        Ok(self.data().scale(id).ok().cloned())
    }
}

#[async_trait]
impl SummarySink for MemoryStore {
    async fn upsert_grade_summary(&self, summary: GradeSummary) -> anyhow::Result<()> {
        self.summaries_mut().grades.insert(summary.key, summary);
        Ok(())
    }

    async fn upsert_attendance_summary(&self, summary: AttendanceSummary) -> anyhow::Result<()> {
        self.summaries_mut().attendance.insert(summary.key, summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{NaiveDate, TimeZone};
    use gradebook_core::model::{SessionId, SubjectId, TermId};
    use gradebook_core::records::{AttendanceStatus, ScoreMark};

    use crate::dataset::tests::school;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SummaryKey>>);

    impl ChangeListener for Recorder {
        fn on_change(&self, key: SummaryKey) {
            self.0.lock().unwrap().push(key);
        }
    }

    fn store() -> (MemoryStore, Arc<Recorder>) {
        let store = MemoryStore::new(school());
        let recorder = Arc::new(Recorder::default());
        store.set_listener(Arc::clone(&recorder) as Arc<dyn ChangeListener>);
        (store, recorder)
    }

    fn grade(term: i64, subject: i64) -> SummaryKey {
        GradeKey {
            student: StudentId(7),
            term: TermId(term),
            subject: SubjectId(subject),
        }
        .into()
    }

    fn score(assessment: i64, value: f64) -> AssessmentScore {
        AssessmentScore {
            assessment: AssessmentId(assessment),
            student: StudentId(7),
            mark: ScoreMark::Numeric(value),
            comments: String::new(),
            graded_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn upsert_replaces_and_notifies() {
        let (store, recorder) = store();
        store.upsert_score(score(1, 45.0)).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![grade(1, 1)]);
        let data = store.data();
        let matching: Vec<_> = data
            .scores
            .iter()
            .filter(|s| s.assessment == AssessmentId(1))
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].mark, ScoreMark::Numeric(45.0));
    }

    #[test]
    fn rejected_write_changes_nothing() {
        let (store, recorder) = store();
        let err = store.upsert_score(score(42, 1.0)).unwrap_err();
        assert_eq!(err, StoreError::UnknownAssessment(AssessmentId(42)));
        assert!(recorder.0.lock().unwrap().is_empty());
        assert_eq!(store.data().scores.len(), 2);
    }

    #[test]
    fn deleting_missing_score_is_silent() {
        let (store, recorder) = store();
        assert!(!store.delete_score(AssessmentId(3), StudentId(7)).unwrap());
        assert!(recorder.0.lock().unwrap().is_empty());
        assert!(store.delete_score(AssessmentId(1), StudentId(7)).unwrap());
        assert_eq!(*recorder.0.lock().unwrap(), vec![grade(1, 1)]);
    }

    #[test]
    fn weight_change_touches_every_scored_student() {
        let (store, recorder) = store();
        let mut exam = store.data().assessment(AssessmentId(2)).unwrap().clone();
        exam.weight = 3.0;
        store.upsert_assessment(exam).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![grade(1, 1)]);
    }

    #[test]
    fn rubric_level_edit_touches_competency_subject() {
        let (store, recorder) = store();
        let mut level = store.data().scale(ScaleId(1)).unwrap().levels[2].clone();
        level.numeric_value = 3.5;
        store.update_rubric_level(ScaleId(1), level).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![grade(1, 2)]);
    }

    #[test]
    fn attendance_mark_touches_subject_and_term_rows() {
        let (store, recorder) = store();
        store
            .record_attendance(
                StudentId(7),
                AttendanceMark {
                    session: SessionId(1),
                    subject: SubjectId(1),
                    session_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                    status: AttendanceStatus::Late,
                },
            )
            .unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
        assert_eq!(store.data().attendance.len(), 3);
        assert_eq!(store.data().attendance[0].mark.status, AttendanceStatus::Late);
    }

    #[test]
    fn moving_a_session_to_another_term_touches_old_rows() {
        let (store, recorder) = store();
        store
            .record_attendance(
                StudentId(7),
                AttendanceMark {
                    session: SessionId(1),
                    subject: SubjectId(1),
                    session_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
                    status: AttendanceStatus::Present,
                },
            )
            .unwrap();
        let keys = recorder.0.lock().unwrap().clone();
        let row = |term: i64, subject: Option<i64>| -> SummaryKey {
            AttendanceKey {
                student: StudentId(7),
                term: TermId(term),
                subject: subject.map(SubjectId),
            }
            .into()
        };
        assert_eq!(keys.len(), 4);
        for key in [row(1, Some(1)), row(1, None), row(2, Some(1)), row(2, None)] {
            assert!(keys.contains(&key), "{key:?} not notified");
        }
    }

    #[tokio::test]
    async fn summary_upsert_replaces_row() {
        let (store, _) = store();
        let key = GradeKey {
            student: StudentId(7),
            term: TermId(1),
            subject: SubjectId(1),
        };
        for total in [1, 2] {
            store
                .upsert_grade_summary(GradeSummary {
                    key,
                    figures: gradebook_core::summary::GradeFigures {
                        total_assessments: total,
                        ..Default::default()
                    },
                    last_updated: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.grade_summaries().len(), 1);
        assert_eq!(store.grade_summary(&key).unwrap().figures.total_assessments, 2);
    }
}
