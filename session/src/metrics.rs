//! Per-provider utilization statistics over a simulation session,
//! computed the way the bot's rolling-window indicators guard against
//! empty/degenerate samples rather than dividing by zero.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationStats {
    pub mean: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

/// Difference between two `UtilizationStats` readings, the shape
/// `metrics()` returns when asked to diff a session against another
/// session or against live state. Every field is `left - right`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationStatsDiff {
    pub mean: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
}

pub fn diff_stats(left: &UtilizationStats, right: &UtilizationStats) -> UtilizationStatsDiff {
    UtilizationStatsDiff {
        mean: left.mean - right.mean,
        stdev: left.stdev - right.stdev,
        min: left.min - right.min,
        max: left.max - right.max,
    }
}

/// `None` when `values` is empty; a single sample reports `stdev = 0.0`
/// rather than `NaN`.
pub fn compute_stats(values: &[f64]) -> Option<UtilizationStats> {
    if values.is_empty() {
        return None;
    }

    let samples = values.len();
    let sum: f64 = values.iter().sum();
    let mean = sum / samples as f64;

    let variance = if samples > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples as f64
    } else {
        0.0
    };

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    Some(UtilizationStats { mean, stdev: variance.sqrt(), min, max, samples })
}
