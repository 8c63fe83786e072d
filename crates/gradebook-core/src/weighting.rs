//! Weighting resolver: many normalized achievements in, one weighted and
//! one simple average out.
//!
//! Weighted average is Σ(achievement × weight) / Σweight over present items
//! with a defined achievement. It is `None` when nothing participates or the
//! weights sum to zero.

use serde::{Deserialize, Serialize};

/// One input to the resolver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedItem {
    pub achievement: Option<f64>,
    pub weight: f64,
    pub present: bool,
}

impl WeightedItem {
    pub fn new(achievement: f64, weight: f64) -> Self {
        Self {
            achievement: Some(achievement),
            weight,
            present: true,
        }
    }
}

/// Result of resolving a set of items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Σ(aᵢ·wᵢ) / Σwᵢ. `None` when nothing participates or Σw = 0.
    pub weighted_average: Option<f64>,
    /// Unweighted mean of the same items. `None` when nothing participates.
    pub simple_average: Option<f64>,
    pub count_used: usize,
    /// Σw over participating items, for partial-data disclosure.
    pub total_weight: f64,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.count_used == 0
    }
}

/// Neumaier-compensated running sum.
///
/// Keeps the result independent of item order well below 1e-9 relative
/// error for the item counts a term produces.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn total(&self) -> f64 {
        self.sum + self.compensation
    }
}

impl FromIterator<f64> for CompensatedSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut sum = CompensatedSum::new();
        for v in iter {
            sum.add(v);
        }
        sum
    }
}

/// Resolve weighted and simple averages.
///
/// Only present items with a defined achievement participate. Items with a
/// non-finite achievement or a negative or non-finite weight are expected
/// to have been filtered out by the caller; they are ignored here.
pub fn resolve(items: &[WeightedItem]) -> Resolution {
    let mut weighted = CompensatedSum::new();
    let mut weights = CompensatedSum::new();
    let mut plain = CompensatedSum::new();
    let mut count = 0usize;

    for item in items {
        let Some(achievement) = item.achievement.filter(|a| a.is_finite()) else {
            continue;
        };
        if !item.present || !item.weight.is_finite() || item.weight < 0.0 {
            continue;
        }
        weighted.add(achievement * item.weight);
        weights.add(item.weight);
        plain.add(achievement);
        count += 1;
    }

    let total_weight = weights.total();
    let weighted_average = if count > 0 && total_weight > 0.0 {
        Some(weighted.total() / total_weight)
    } else {
        None
    };
    let simple_average = if count > 0 {
        Some(plain.total() / count as f64)
    } else {
        None
    };

    Resolution {
        weighted_average,
        simple_average,
        count_used: count,
        total_weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn two_numeric_assessments_weighted() {
        let r = resolve(&[WeightedItem::new(0.8, 2.0), WeightedItem::new(0.8, 1.0)]);
        assert!(close(r.weighted_average.unwrap(), 0.8));
        assert!(close(r.simple_average.unwrap(), 0.8));
        assert_eq!(r.count_used, 2);
        assert_eq!(r.total_weight, 3.0);
    }

    #[test]
    fn weights_shift_the_average() {
        let r = resolve(&[WeightedItem::new(1.0, 3.0), WeightedItem::new(0.0, 1.0)]);
        assert!(close(r.weighted_average.unwrap(), 0.75));
        assert!(close(r.simple_average.unwrap(), 0.5));
    }

    #[test]
    fn zero_total_weight_is_undefined_not_zero() {
        let r = resolve(&[WeightedItem::new(0.9, 0.0), WeightedItem::new(0.4, 0.0)]);
        assert_eq!(r.weighted_average, None);
        assert!(close(r.simple_average.unwrap(), 0.65));
        assert_eq!(r.count_used, 2);
    }

    #[test]
    fn empty_input_is_undefined() {
        let r = resolve(&[]);
        assert_eq!(r.weighted_average, None);
        assert_eq!(r.simple_average, None);
        assert!(r.is_empty());
    }

    #[test]
    fn absent_and_qualitative_items_do_not_participate() {
        let r = resolve(&[
            WeightedItem::new(0.5, 1.0),
            WeightedItem {
                achievement: Some(0.0),
                weight: 5.0,
                present: false,
            },
            WeightedItem {
                achievement: None,
                weight: 5.0,
                present: true,
            },
        ]);
        assert_eq!(r.count_used, 1);
        assert!(close(r.weighted_average.unwrap(), 0.5));
    }

    #[test]
    fn permutation_does_not_change_result() {
        let items: Vec<WeightedItem> = (0..5_000)
            .map(|i| {
                let a = ((i * 7919) % 1000) as f64 / 1000.0;
                let w = 0.1 + ((i * 104_729) % 97) as f64 / 7.0;
                WeightedItem::new(a, w)
            })
            .collect();
        let forward = resolve(&items);
        let mut reversed = items.clone();
        reversed.reverse();
        let backward = resolve(&reversed);
        let mut interleaved: Vec<WeightedItem> = items.iter().step_by(2).copied().collect();
        interleaved.extend(items.iter().skip(1).step_by(2).copied());
        let shuffled = resolve(&interleaved);

        let f = forward.weighted_average.unwrap();
        assert!(close(f, backward.weighted_average.unwrap()));
        assert!(close(f, shuffled.weighted_average.unwrap()));
    }

    #[test]
    fn compensated_sum_recovers_small_terms() {
        let mut sum = CompensatedSum::new();
        sum.add(1e16);
        for _ in 0..10 {
            sum.add(1.0);
        }
        sum.add(-1e16);
        assert_eq!(sum.total(), 10.0);
    }
}
