//! Curriculum grading policies: banding tables, rounding and weight
//! multipliers per assessment kind.
//!
//! Built-in defaults cover every curriculum. TOML overrides are merged on
//! top, one curriculum at a time.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{AssessmentKind, CurriculumType};
use crate::records::Assessment;

const MAX_DECIMALS: u32 = 6;

/// One row of a banding table: percentages at or above `min` get `label`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub label: String,
}

/// Percentage → label lookup, highest band first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Band>", into = "Vec<Band>")]
pub struct BandingTable {
    bands: Vec<Band>,
}

impl BandingTable {
    pub fn new(mut bands: Vec<Band>) -> Self {
        bands.sort_by(|a, b| b.min.total_cmp(&a.min));
        Self { bands }
    }

    fn from_pairs(pairs: &[(f64, &str)]) -> Self {
        Self::new(
            pairs
                .iter()
                .map(|(min, label)| Band {
                    min: *min,
                    label: (*label).to_string(),
                })
                .collect(),
        )
    }

    /// Label of the highest band `percent` reaches, if any.
    pub fn grade(&self, percent: f64) -> Option<&str> {
        self.bands
            .iter()
            .find(|b| percent >= b.min)
            .map(|b| b.label.as_str())
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }
}

impl From<Vec<Band>> for BandingTable {
    fn from(bands: Vec<Band>) -> Self {
        BandingTable::new(bands)
    }
}

impl From<BandingTable> for Vec<Band> {
    fn from(table: BandingTable) -> Self {
        table.bands
    }
}

/// Decimal places kept on stored percentages, rounded half away from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rounding {
    pub decimals: u32,
}

impl Rounding {
    pub fn apply(&self, value: f64) -> f64 {
        let factor = 10f64.powi(self.decimals as i32);
        (value * factor).round() / factor
    }
}

impl Default for Rounding {
    fn default() -> Self {
        Self { decimals: 2 }
    }
}

/// How one curriculum turns achievements into stored figures and grades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingPolicy {
    pub curriculum: CurriculumType,
    /// Final grade comes from the competency rollup instead of the bands.
    pub competency_based: bool,
    pub banding: BandingTable,
    pub rounding: Rounding,
    /// Multipliers applied on top of each assessment's own weight.
    #[serde(default)]
    pub kind_weights: BTreeMap<AssessmentKind, f64>,
}

impl GradingPolicy {
    /// Built-in policy for a curriculum.
    pub fn default_for(curriculum: CurriculumType) -> Self {
        let (competency_based, banding) = match curriculum {
            CurriculumType::EightFourFour => (
                false,
                BandingTable::from_pairs(&[
                    (80.0, "A"),
                    (75.0, "A-"),
                    (70.0, "B+"),
                    (65.0, "B"),
                    (60.0, "B-"),
                    (55.0, "C+"),
                    (50.0, "C"),
                    (45.0, "C-"),
                    (40.0, "D+"),
                    (35.0, "D"),
                    (30.0, "D-"),
                    (0.0, "E"),
                ]),
            ),
            CurriculumType::Igcse => (
                false,
                BandingTable::from_pairs(&[
                    (90.0, "A*"),
                    (80.0, "A"),
                    (70.0, "B"),
                    (60.0, "C"),
                    (50.0, "D"),
                    (40.0, "E"),
                    (30.0, "F"),
                    (20.0, "G"),
                    (0.0, "U"),
                ]),
            ),
            CurriculumType::Cbc => (
                true,
                BandingTable::from_pairs(&[
                    (75.0, "EE"),
                    (50.0, "ME"),
                    (25.0, "AE"),
                    (0.0, "BE"),
                ]),
            ),
            CurriculumType::Custom => (
                false,
                BandingTable::from_pairs(&[
                    (70.0, "A"),
                    (60.0, "B"),
                    (50.0, "C"),
                    (40.0, "D"),
                    (0.0, "E"),
                ]),
            ),
        };
        Self {
            curriculum,
            competency_based,
            banding,
            rounding: Rounding::default(),
            kind_weights: BTreeMap::new(),
        }
    }

    /// The assessment's weight scaled by its kind multiplier.
    pub fn effective_weight(&self, assessment: &Assessment) -> f64 {
        let multiplier = self
            .kind_weights
            .get(&assessment.kind)
            .copied()
            .unwrap_or(1.0);
        assessment.weight * multiplier
    }

    /// Achievement on [0, 1] as a rounded percentage.
    pub fn to_percent(&self, achievement: f64) -> f64 {
        self.rounding.apply(achievement * 100.0)
    }

    pub fn grade_label(&self, percent: f64) -> Option<String> {
        self.banding.grade(percent).map(str::to_string)
    }
}

/// Policies for every curriculum.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    policies: BTreeMap<CurriculumType, GradingPolicy>,
    fallback: GradingPolicy,
    /// Decimal places kept on attendance percentages.
    pub attendance: Rounding,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            policies: CurriculumType::ALL
                .iter()
                .map(|c| (*c, GradingPolicy::default_for(*c)))
                .collect(),
            fallback: GradingPolicy::default_for(CurriculumType::Custom),
            attendance: Rounding::default(),
        }
    }
}

impl PolicySet {
    pub fn for_curriculum(&self, curriculum: CurriculumType) -> &GradingPolicy {
        self.policies.get(&curriculum).unwrap_or(&self.fallback)
    }

    pub fn policies(&self) -> impl Iterator<Item = &GradingPolicy> {
        self.policies.values()
    }

    /// Merge overrides onto the current policies.
    pub fn apply(&mut self, overrides: &PolicyOverrides) -> Result<()> {
        if let Some(decimals) = overrides.attendance_decimals {
            anyhow::ensure!(
                decimals <= MAX_DECIMALS,
                "attendance_decimals must be at most {MAX_DECIMALS}"
            );
            self.attendance = Rounding { decimals };
        }

        for (name, patch) in &overrides.policies {
            let curriculum: CurriculumType =
                name.parse().map_err(|e: String| anyhow::anyhow!("{}", e))?;
            let policy = self
                .policies
                .entry(curriculum)
                .or_insert_with(|| GradingPolicy::default_for(curriculum));
            patch
                .apply_to(policy)
                .with_context(|| format!("invalid policy for {curriculum}"))?;
        }
        Ok(())
    }
}

/// Partial policy settings for one curriculum, as written in TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default)]
    pub competency_based: Option<bool>,
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub bands: Option<Vec<Band>>,
    #[serde(default)]
    pub kind_weights: HashMap<String, f64>,
}

impl PolicyPatch {
    fn apply_to(&self, policy: &mut GradingPolicy) -> Result<()> {
        if let Some(flag) = self.competency_based {
            policy.competency_based = flag;
        }
        if let Some(decimals) = self.decimals {
            anyhow::ensure!(
                decimals <= MAX_DECIMALS,
                "decimals must be at most {MAX_DECIMALS}, got {decimals}"
            );
            policy.rounding = Rounding { decimals };
        }
        if let Some(bands) = &self.bands {
            anyhow::ensure!(!bands.is_empty(), "banding table must not be empty");
            for band in bands {
                anyhow::ensure!(
                    band.min.is_finite(),
                    "band '{}' has a non-finite minimum",
                    band.label
                );
            }
            policy.banding = BandingTable::new(bands.clone());
        }
        for (kind, multiplier) in &self.kind_weights {
            let kind: AssessmentKind =
                kind.parse().map_err(|e: String| anyhow::anyhow!("{}", e))?;
            anyhow::ensure!(
                multiplier.is_finite() && *multiplier >= 0.0,
                "weight multiplier for {kind} must be a non-negative number"
            );
            policy.kind_weights.insert(kind, *multiplier);
        }
        Ok(())
    }
}

/// The policy section of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyOverrides {
    #[serde(default)]
    pub attendance_decimals: Option<u32>,
    /// Keyed by curriculum code ("8-4-4", "CBC", "IGCSE", "CUSTOM").
    #[serde(default)]
    pub policies: HashMap<String, PolicyPatch>,
}

/// Parse a TOML policy file into a full policy set.
pub fn parse_policies(path: &Path) -> Result<PolicySet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    parse_policies_str(&content, path)
}

/// Parse a TOML string into a policy set (useful for testing).
pub fn parse_policies_str(content: &str, source_path: &Path) -> Result<PolicySet> {
    let overrides: PolicyOverrides = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;
    let mut set = PolicySet::default();
    set.apply(&overrides)
        .with_context(|| format!("invalid policies in {}", source_path.display()))?;
    Ok(set)
}

/// A suspicious but usable policy setting.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyWarning {
    pub curriculum: CurriculumType,
    pub message: String,
}

/// Check policies for settings that are legal but probably unintended.
pub fn validate_policies(set: &PolicySet) -> Vec<PolicyWarning> {
    let mut warnings = Vec::new();
    for policy in set.policies() {
        let warn = |message: String| PolicyWarning {
            curriculum: policy.curriculum,
            message,
        };
        let bands = policy.banding.bands();
        if let Some(lowest) = bands.last() {
            if lowest.min > 0.0 {
                warnings.push(warn(format!(
                    "lowest band '{}' starts at {}; lower percentages get no grade",
                    lowest.label, lowest.min
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for band in bands {
            if !seen.insert(band.label.as_str()) {
                warnings.push(warn(format!("duplicate band label '{}'", band.label)));
            }
        }
        if policy.kind_weights.values().any(|w| *w == 0.0) {
            warnings.push(warn(
                "an assessment kind has weight multiplier 0 and will never count toward the weighted average"
                    .to_string(),
            ));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssessmentId, SubjectId};
    use crate::records::Evaluation;
    use std::path::PathBuf;

    #[test]
    fn kcse_bands() {
        let policy = GradingPolicy::default_for(CurriculumType::EightFourFour);
        assert_eq!(policy.grade_label(80.0).as_deref(), Some("A"));
        assert_eq!(policy.grade_label(79.99).as_deref(), Some("A-"));
        assert_eq!(policy.grade_label(52.0).as_deref(), Some("C"));
        assert_eq!(policy.grade_label(3.0).as_deref(), Some("E"));
        assert!(!policy.competency_based);
    }

    #[test]
    fn cbc_is_competency_based() {
        assert!(GradingPolicy::default_for(CurriculumType::Cbc).competency_based);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        let r = Rounding { decimals: 2 };
        assert_eq!(r.apply(66.666_666), 66.67);
        assert_eq!(r.apply(80.0), 80.0);
        assert_eq!(Rounding { decimals: 0 }.apply(2.5), 3.0);
    }

    #[test]
    fn kind_multiplier_scales_weight() {
        let mut policy = GradingPolicy::default_for(CurriculumType::Igcse);
        policy.kind_weights.insert(AssessmentKind::MainExam, 3.0);
        let exam = Assessment {
            id: AssessmentId(1),
            name: "End Term".into(),
            subject: SubjectId(1),
            term: None,
            kind: AssessmentKind::MainExam,
            evaluation: Evaluation::Numeric { total_marks: 100.0 },
            weight: 2.0,
            assessment_date: None,
        };
        assert_eq!(policy.effective_weight(&exam), 6.0);
    }

    const POLICY_TOML: &str = r#"
attendance_decimals = 1

[policies.IGCSE]
decimals = 1

[policies.IGCSE.kind_weights]
MAIN_EXAM = 2.0
cat = 0.5

[policies."8-4-4"]
bands = [
    { min = 50.0, label = "PASS" },
    { min = 0.0, label = "FAIL" },
]
"#;

    #[test]
    fn parse_overrides_merge_onto_defaults() {
        let set = parse_policies_str(POLICY_TOML, &PathBuf::from("policies.toml")).unwrap();
        assert_eq!(set.attendance.decimals, 1);

        let igcse = set.for_curriculum(CurriculumType::Igcse);
        assert_eq!(igcse.rounding.decimals, 1);
        assert_eq!(igcse.kind_weights.get(&AssessmentKind::MainExam), Some(&2.0));
        assert_eq!(igcse.kind_weights.get(&AssessmentKind::Cat), Some(&0.5));
        // Bands untouched.
        assert_eq!(igcse.grade_label(91.0).as_deref(), Some("A*"));

        let kcse = set.for_curriculum(CurriculumType::EightFourFour);
        assert_eq!(kcse.grade_label(51.0).as_deref(), Some("PASS"));
        assert_eq!(kcse.grade_label(49.0).as_deref(), Some("FAIL"));

        // Untouched curriculum keeps built-in defaults.
        assert_eq!(
            set.for_curriculum(CurriculumType::Cbc),
            &GradingPolicy::default_for(CurriculumType::Cbc)
        );
    }

    #[test]
    fn parse_rejects_unknown_curriculum_and_bad_values() {
        let bad_curriculum = "[policies.MONTESSORI]\ndecimals = 1\n";
        assert!(parse_policies_str(bad_curriculum, &PathBuf::from("p.toml")).is_err());

        let bad_weight = "[policies.CBC.kind_weights]\nCAT = -1.0\n";
        assert!(parse_policies_str(bad_weight, &PathBuf::from("p.toml")).is_err());

        let empty_bands = "[policies.CBC]\nbands = []\n";
        assert!(parse_policies_str(empty_bands, &PathBuf::from("p.toml")).is_err());

        let malformed = "this is not [valid toml }{";
        assert!(parse_policies_str(malformed, &PathBuf::from("p.toml")).is_err());
    }

    #[test]
    fn validate_flags_gaps_and_duplicates() {
        let toml = r#"
[policies.CUSTOM]
bands = [
    { min = 60.0, label = "A" },
    { min = 40.0, label = "A" },
]
[policies.CUSTOM.kind_weights]
MOCK = 0.0
"#;
        let set = parse_policies_str(toml, &PathBuf::from("p.toml")).unwrap();
        let warnings = validate_policies(&set);
        assert!(warnings.iter().any(|w| w.message.contains("lowest band")));
        assert!(warnings.iter().any(|w| w.message.contains("duplicate")));
        assert!(warnings.iter().any(|w| w.message.contains("multiplier 0")));
        assert!(warnings
            .iter()
            .all(|w| w.curriculum == CurriculumType::Custom));
    }

    #[test]
    fn defaults_validate_clean() {
        assert!(validate_policies(&PolicySet::default()).is_empty());
    }
}
