//! Raw school records held by the store, and the queries that slice them
//! into per-key snapshots.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use gradebook_core::model::{
    AssessmentId, AttendanceKey, GradeKey, OutcomeId, ScaleId, StudentId, SubjectId, SummaryKey,
    TermId,
};
use gradebook_core::records::{
    Assessment, AssessmentScore, AttendanceMark, AttendanceRecords, CompetencyTree, EvidencePayload,
    EvidenceRecord, GradeRecords, LearningOutcome, ScoreMark, ScoreRow, Strand, SubStrand, Subject,
    Term,
};
use gradebook_core::scale::RubricScale;

use crate::error::StoreError;

/// An attendance mark together with the student it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub student: StudentId,
    #[serde(flatten)]
    pub mark: AttendanceMark,
}

/// Every raw row the store knows about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub terms: Vec<Term>,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub scales: Vec<RubricScale>,
    #[serde(default)]
    pub assessments: Vec<Assessment>,
    #[serde(default)]
    pub scores: Vec<AssessmentScore>,
    #[serde(default)]
    pub strands: Vec<Strand>,
    #[serde(default)]
    pub sub_strands: Vec<SubStrand>,
    #[serde(default)]
    pub outcomes: Vec<LearningOutcome>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRecord>,
    #[serde(default)]
    pub attendance: Vec<AttendanceEntry>,
}

impl Dataset {
    /// Load a dataset from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Parse a dataset and check that every reference resolves.
    pub fn from_json(content: &str) -> Result<Self> {
        let dataset: Dataset = serde_json::from_str(content).context("failed to parse dataset")?;
        dataset.validate().context("dataset has dangling references")?;
        Ok(dataset)
    }

    /// Check that scores, assessments and evidence point at known rows.
    pub fn validate(&self) -> Result<(), StoreError> {
        for assessment in &self.assessments {
            self.subject(assessment.subject)?;
            if let Some(term) = assessment.term {
                self.term(term)?;
            }
            if let Some(scale) = assessment.evaluation.rubric_scale() {
                self.scale(scale)?;
            }
        }
        for score in &self.scores {
            self.check_score(score)?;
        }
        for evidence in &self.evidence {
            self.check_evidence(evidence)?;
        }
        for entry in &self.attendance {
            self.subject(entry.mark.subject)?;
        }
        Ok(())
    }

    pub fn term(&self, id: TermId) -> Result<&Term, StoreError> {
        self.terms
            .iter()
            .find(|t| t.id == id)
            .ok_or(StoreError::UnknownTerm(id))
    }

    pub fn subject(&self, id: SubjectId) -> Result<&Subject, StoreError> {
        self.subjects
            .iter()
            .find(|s| s.id == id)
            .ok_or(StoreError::UnknownSubject(id))
    }

    pub fn assessment(&self, id: AssessmentId) -> Result<&Assessment, StoreError> {
        self.assessments
            .iter()
            .find(|a| a.id == id)
            .ok_or(StoreError::UnknownAssessment(id))
    }

    pub fn scale(&self, id: ScaleId) -> Result<&RubricScale, StoreError> {
        self.scales
            .iter()
            .find(|s| s.id == id)
            .ok_or(StoreError::UnknownScale(id))
    }

    /// The term whose date range contains `date`.
    pub fn term_containing(&self, date: NaiveDate) -> Option<&Term> {
        self.terms.iter().find(|t| t.contains(date))
    }

    /// Subject of an outcome, via sub-strand and strand.
    pub fn outcome_subject(&self, outcome: OutcomeId) -> Result<Option<SubjectId>, StoreError> {
        let outcome = self
            .outcomes
            .iter()
            .find(|o| o.id == outcome)
            .ok_or(StoreError::UnknownOutcome(outcome))?;
        let strand = self
            .sub_strands
            .iter()
            .find(|s| s.id == outcome.sub_strand)
            .and_then(|sub| self.strands.iter().find(|s| s.id == sub.strand));
        Ok(strand.and_then(|s| s.subject))
    }

    /// Terms an assessment counts toward.
    pub fn assessment_terms(&self, assessment: &Assessment) -> Vec<TermId> {
        self.terms
            .iter()
            .filter(|t| assessment.applies_to(t))
            .map(|t| t.id)
            .collect()
    }

    /// The strand hierarchy of one subject.
    pub fn competency_tree(&self, subject: SubjectId) -> CompetencyTree {
        let strands: Vec<Strand> = self
            .strands
            .iter()
            .filter(|s| s.subject == Some(subject))
            .cloned()
            .collect();
        let sub_strands: Vec<SubStrand> = self
            .sub_strands
            .iter()
            .filter(|ss| strands.iter().any(|s| s.id == ss.strand))
            .cloned()
            .collect();
        let outcomes = self
            .outcomes
            .iter()
            .filter(|o| sub_strands.iter().any(|ss| ss.id == o.sub_strand))
            .cloned()
            .collect();
        CompetencyTree {
            strands,
            sub_strands,
            outcomes,
        }
    }

    /// Every row feeding one grade summary.
    pub fn grade_records(&self, key: &GradeKey, as_of: DateTime<Utc>) -> Result<GradeRecords, StoreError> {
        let term = self.term(key.term)?;
        let subject = self.subject(key.subject)?.clone();

        let mut scores = Vec::new();
        for score in self.scores.iter().filter(|s| s.student == key.student) {
            let assessment = self.assessment(score.assessment)?;
            if assessment.subject == key.subject && assessment.applies_to(term) {
                scores.push(ScoreRow {
                    assessment: assessment.clone(),
                    score: score.clone(),
                });
            }
        }

        let mut evidence = Vec::new();
        for record in self.evidence.iter().filter(|e| e.student == key.student) {
            if term.contains(record.observed_at)
                && self.outcome_subject(record.learning_outcome)? == Some(key.subject)
            {
                evidence.push(record.clone());
            }
        }

        Ok(GradeRecords {
            key: *key,
            tree: self.competency_tree(key.subject),
            subject,
            scores,
            evidence,
            as_of,
        })
    }

    /// Every attendance mark of the student within the term. Subject
    /// filtering is left to the summary builder.
    pub fn attendance_records(
        &self,
        key: &AttendanceKey,
        as_of: DateTime<Utc>,
    ) -> Result<AttendanceRecords, StoreError> {
        let term = self.term(key.term)?;
        if let Some(subject) = key.subject {
            self.subject(subject)?;
        }
        let marks = self
            .attendance
            .iter()
            .filter(|e| e.student == key.student && term.contains(e.mark.session_date))
            .map(|e| e.mark.clone())
            .collect();
        Ok(AttendanceRecords {
            key: *key,
            marks,
            as_of,
        })
    }

    pub(crate) fn check_score(&self, score: &AssessmentScore) -> Result<(), StoreError> {
        let assessment = self.assessment(score.assessment)?;
        if let (ScoreMark::Rubric(level), Some(scale)) =
            (&score.mark, assessment.evaluation.rubric_scale())
        {
            if self.scale(scale)?.level(*level).is_none() {
                return Err(StoreError::UnknownLevel {
                    scale,
                    level: *level,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_evidence(&self, evidence: &EvidenceRecord) -> Result<(), StoreError> {
        self.outcome_subject(evidence.learning_outcome)?;
        if let EvidencePayload::Rubric { rubric_level } | EvidencePayload::Competency { rubric_level } =
            &evidence.payload
        {
            self.scale(rubric_level.scale)?;
        }
        Ok(())
    }

    /// Grade summaries fed by one score row.
    pub fn score_keys(&self, assessment: AssessmentId, student: StudentId) -> Result<Vec<SummaryKey>, StoreError> {
        let assessment = self.assessment(assessment)?;
        Ok(self
            .assessment_terms(assessment)
            .into_iter()
            .map(|term| {
                GradeKey {
                    student,
                    term,
                    subject: assessment.subject,
                }
                .into()
            })
            .collect())
    }

    /// Grade summaries fed by any score of `assessment`.
    pub fn assessment_keys(&self, assessment: &Assessment) -> Vec<SummaryKey> {
        let terms = self.assessment_terms(assessment);
        self.scores
            .iter()
            .filter(|s| s.assessment == assessment.id)
            .flat_map(|s| {
                terms.iter().map(move |term| {
                    GradeKey {
                        student: s.student,
                        term: *term,
                        subject: assessment.subject,
                    }
                    .into()
                })
            })
            .collect()
    }

    /// Grade summary fed by one evidence record. Evidence observed outside
    /// every term feeds nothing.
    pub fn evidence_keys(&self, evidence: &EvidenceRecord) -> Result<Vec<SummaryKey>, StoreError> {
        let subject = self.outcome_subject(evidence.learning_outcome)?;
        let term = self.term_containing(evidence.observed_at);
        Ok(subject
            .zip(term)
            .map(|(subject, term)| {
                GradeKey {
                    student: evidence.student,
                    term: term.id,
                    subject,
                }
                .into()
            })
            .into_iter()
            .collect())
    }

    /// Attendance summaries fed by one mark: the subject row and the
    /// whole-term row.
    pub fn attendance_keys(&self, student: StudentId, mark: &AttendanceMark) -> Result<Vec<SummaryKey>, StoreError> {
        let term = self
            .term_containing(mark.session_date)
            .ok_or(StoreError::NoTermForDate(mark.session_date))?;
        Ok(vec![
            AttendanceKey {
                student,
                term: term.id,
                subject: Some(mark.subject),
            }
            .into(),
            AttendanceKey {
                student,
                term: term.id,
                subject: None,
            }
            .into(),
        ])
    }

    /// Grade summaries whose figures depend on `scale`.
    pub fn scale_keys(&self, scale: ScaleId) -> Vec<SummaryKey> {
        let mut keys = BTreeSet::new();
        for score in &self.scores {
            let uses_scale = self
                .assessment(score.assessment)
                .is_ok_and(|a| a.evaluation.rubric_scale() == Some(scale));
            if uses_scale {
                keys.extend(self.score_keys(score.assessment, score.student).unwrap_or_default());
            }
        }
        for evidence in &self.evidence {
            if let EvidencePayload::Rubric { rubric_level } | EvidencePayload::Competency { rubric_level } =
                &evidence.payload
            {
                if rubric_level.scale == scale {
                    keys.extend(self.evidence_keys(evidence).unwrap_or_default());
                }
            }
        }
        let competency_subjects: Vec<SubjectId> = self
            .subjects
            .iter()
            .filter(|s| s.competency_scale == Some(scale))
            .map(|s| s.id)
            .collect();
        keys.extend(self.grade_keys().into_iter().filter(|k| match k {
            SummaryKey::Grade(g) => competency_subjects.contains(&g.subject),
            SummaryKey::Attendance(_) => false,
        }));
        keys.into_iter().collect()
    }

    /// Every grade summary key that has at least one row behind it.
    pub fn grade_keys(&self) -> Vec<SummaryKey> {
        let mut keys = BTreeSet::new();
        for score in &self.scores {
            keys.extend(self.score_keys(score.assessment, score.student).unwrap_or_default());
        }
        for evidence in &self.evidence {
            keys.extend(self.evidence_keys(evidence).unwrap_or_default());
        }
        keys.into_iter().collect()
    }

    /// Every attendance summary key that has at least one mark behind it.
    pub fn attendance_summary_keys(&self) -> Vec<SummaryKey> {
        let mut keys = BTreeSet::new();
        for entry in &self.attendance {
            keys.extend(self.attendance_keys(entry.student, &entry.mark).unwrap_or_default());
        }
        keys.into_iter().collect()
    }
}
