use serde::Serialize;
use std::cmp::Ordering;

use crate::error::{EngineError, EngineResult};

/// One recorded score as read from the grade store.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub id: String,
    pub value: f64,
    pub max_value: f64,
    pub weight: f64,
}

/// Ceiling that subject averages are rescaled to (20 for a /20 school).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradingScale {
    pub ceiling: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CohortStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl CohortStats {
    pub fn rounded(self) -> Self {
        CohortStats {
            min: round_off_2_decimals(self.min),
            max: round_off_2_decimals(self.max),
            mean: round_off_2_decimals(self.mean),
        }
    }
}

/// Half-up rounding to 2 decimals: `Int(100*x + 0.5) / 100`.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

fn check_grade(g: &GradeRow) -> EngineResult<()> {
    let invalid = |reason: &str| EngineError::InvalidGrade {
        grade_id: g.id.clone(),
        reason: reason.to_string(),
    };
    if !(g.max_value.is_finite() && g.max_value > 0.0) {
        return Err(invalid("max_value must be positive"));
    }
    if !(g.weight.is_finite() && g.weight > 0.0) {
        return Err(invalid("weight must be positive"));
    }
    if !(g.value.is_finite() && g.value >= 0.0) {
        return Err(invalid("value must not be negative"));
    }
    if g.value > g.max_value {
        return Err(EngineError::GradeOutOfRange {
            grade_id: g.id.clone(),
            value: g.value,
            max_value: g.max_value,
        });
    }
    Ok(())
}

/// Weighted mean of the grades' percentages, rescaled to the grading ceiling.
///
/// Returns `Ok(None)` when there are no grades: the subject is left off the
/// report instead of counting as zero. The result is unrounded.
pub fn subject_average(grades: &[GradeRow], scale: GradingScale) -> EngineResult<Option<f64>> {
    if grades.is_empty() {
        return Ok(None);
    }

    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;
    for g in grades {
        check_grade(g)?;
        let percent = g.value / g.max_value * 100.0;
        weighted_sum += percent * g.weight;
        weight_total += g.weight;
    }

    let percent = weighted_sum / weight_total;
    Ok(Some(percent * scale.ceiling / 100.0))
}

/// Coefficient-weighted mean of `(subject_average, coefficient)` pairs.
///
/// Only graded subjects may be passed in. No subjects yields 0.
pub fn overall_average(subjects: &[(f64, f64)]) -> f64 {
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (avg, coefficient) in subjects {
        sum += avg * coefficient;
        denom += coefficient;
    }
    if denom > 0.0 {
        sum / denom
    } else {
        0.0
    }
}

/// Standard competition ranking ("1224"), highest average first.
///
/// `averages` is in roster order and the returned ranks line up with it.
/// Equal averages share the better rank and the next rank skips.
pub fn rank_competition(averages: &[f64]) -> Vec<i64> {
    let mut order: Vec<usize> = (0..averages.len()).collect();
    // Stable sort keeps roster order among ties.
    order.sort_by(|&a, &b| {
        averages[b]
            .partial_cmp(&averages[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut ranks = vec![0_i64; averages.len()];
    let mut prev: Option<(f64, i64)> = None;
    for (pos, &idx) in order.iter().enumerate() {
        let avg = averages[idx];
        let rank = match prev {
            Some((prev_avg, prev_rank)) if prev_avg == avg => prev_rank,
            _ => (pos + 1) as i64,
        };
        ranks[idx] = rank;
        prev = Some((avg, rank));
    }
    ranks
}

pub fn cohort_stats(values: &[f64]) -> Option<CohortStats> {
    if values.is_empty() {
        return None;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0_f64;
    for &v in values {
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    let mean = (sum / values.len() as f64).clamp(min, max);
    Some(CohortStats { min, max, mean })
}
