//! Rubric scales and the arithmetic that maps levels onto the unit interval.
//!
//! The numeric range of a scale is derived from its levels on every call so
//! an edit to a level takes effect on the next recompute.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AggregationError;
use crate::model::{LevelId, ScaleId};

/// Tolerance used when comparing normalized achievements against level points.
const LEVEL_EPSILON: f64 = 1e-9;

/// An individual level within a rubric scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricLevel {
    pub id: LevelId,
    /// Short code, e.g. "4", "EE", "A".
    pub code: String,
    /// Human-readable label, e.g. "Exceeds Expectations".
    #[serde(default)]
    pub label: String,
    pub numeric_value: f64,
    pub sequence: u16,
}

/// An ordered set of qualitative levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricScale {
    pub id: ScaleId,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub levels: Vec<RubricLevel>,
}

fn default_active() -> bool {
    true
}

impl RubricScale {
    pub fn level(&self, id: LevelId) -> Option<&RubricLevel> {
        self.levels.iter().find(|l| l.id == id)
    }

    /// Lowest and highest `numeric_value` among the levels.
    ///
    /// Fails when the scale has no levels or every level shares one value,
    /// since nothing can then be placed on the unit interval.
    pub fn numeric_range(&self) -> Result<(f64, f64), AggregationError> {
        let mut values = self.levels.iter().map(|l| l.numeric_value);
        let first = values
            .next()
            .ok_or_else(|| AggregationError::InconsistentScale {
                scale: self.id,
                reason: "scale has no levels".into(),
            })?;
        let (min, max) = values.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        if !min.is_finite() || !max.is_finite() {
            return Err(AggregationError::InconsistentScale {
                scale: self.id,
                reason: "level values must be finite".into(),
            });
        }
        if max == min {
            return Err(AggregationError::InconsistentScale {
                scale: self.id,
                reason: format!("all levels share numeric value {min}"),
            });
        }
        Ok((min, max))
    }

    /// Place a raw value from this scale's numeric range on [0, 1], clamped.
    pub fn normalize_value(&self, value: f64) -> Result<f64, AggregationError> {
        let (min, max) = self.numeric_range()?;
        Ok(((value - min) / (max - min)).clamp(0.0, 1.0))
    }

    /// Normalized achievement of one of this scale's levels.
    pub fn normalize_level(&self, id: LevelId) -> Result<(f64, &RubricLevel), AggregationError> {
        let level = self.level(id).ok_or_else(|| {
            AggregationError::MissingContext(format!(
                "rubric level {id} not found in scale {}",
                self.id
            ))
        })?;
        Ok((self.normalize_value(level.numeric_value)?, level))
    }

    /// Whether `numeric_value` never decreases as `sequence` increases.
    pub fn is_monotonic(&self) -> bool {
        let mut ordered: Vec<&RubricLevel> = self.levels.iter().collect();
        ordered.sort_by_key(|l| l.sequence);
        ordered
            .windows(2)
            .all(|w| w[0].numeric_value <= w[1].numeric_value)
    }

    /// The highest level whose normalized value does not exceed `achievement`.
    ///
    /// Falls back to the lowest level when `achievement` is below every
    /// level, which can only happen through rounding.
    pub fn level_at(&self, achievement: f64) -> Result<&RubricLevel, AggregationError> {
        let (min, max) = self.numeric_range()?;
        let point = |l: &RubricLevel| (l.numeric_value - min) / (max - min);

        let reached = self
            .levels
            .iter()
            .filter(|l| point(l) <= achievement + LEVEL_EPSILON)
            .max_by(|a, b| point(a).total_cmp(&point(b)).then(a.sequence.cmp(&b.sequence)));
        match reached {
            Some(level) => Ok(level),
            None => self
                .levels
                .iter()
                .min_by(|a, b| point(a).total_cmp(&point(b)))
                .ok_or_else(|| AggregationError::InconsistentScale {
                    scale: self.id,
                    reason: "scale has no levels".into(),
                }),
        }
    }
}

/// The rubric scales resolved for one computation.
#[derive(Debug, Clone, Default)]
pub struct ScaleIndex {
    scales: HashMap<ScaleId, RubricScale>,
}

impl ScaleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scale: RubricScale) {
        self.scales.insert(scale.id, scale);
    }

    pub fn get(&self, id: ScaleId) -> Option<&RubricScale> {
        self.scales.get(&id)
    }

    /// Look an active scale up. Missing and retired scales are both
    /// reported as `MissingContext`.
    pub fn require(&self, id: ScaleId) -> Result<&RubricScale, AggregationError> {
        match self.get(id) {
            Some(scale) if scale.is_active => Ok(scale),
            Some(_) => Err(AggregationError::MissingContext(format!(
                "rubric scale {id} is not active"
            ))),
            None => Err(AggregationError::MissingContext(format!(
                "rubric scale {id} not found"
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
}

impl FromIterator<RubricScale> for ScaleIndex {
    fn from_iter<I: IntoIterator<Item = RubricScale>>(iter: I) -> Self {
        let mut index = ScaleIndex::new();
        for scale in iter {
            index.insert(scale);
        }
        index
    }
}
