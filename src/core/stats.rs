//! Order statistics over sorted sample buffers.
//!
//! Every query on a sorted buffer is a binary search (`partition_point`), so
//! percentile ranks and tail probabilities stay O(log n) at 10^7 samples.

use super::types::{DensityGrid, DistributionSummary, HistogramBin, SimulationSummary};

/// Arithmetic mean; `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; `0.0` for fewer than two samples.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Linear interpolation between order statistics at rank `(n - 1) * p`.
///
/// `p` is clamped to `[0, 1]`; `NaN` for an empty buffer.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = p.clamp(0.0, 1.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] * (1.0 - w) + sorted[upper] * w
    }
}

/// Percentage of samples strictly greater than `threshold`.
pub fn probability_above(sorted: &[f64], threshold: f64) -> f64 {
    if sorted.is_empty() || threshold.is_nan() {
        return f64::NAN;
    }
    let first_above = sorted.partition_point(|&x| x <= threshold);
    (sorted.len() - first_above) as f64 / sorted.len() as f64 * 100.0
}

/// Percentage of samples `<= value`; `NaN` for a non-finite value or empty buffer.
pub fn percentile_rank(sorted: &[f64], value: f64) -> f64 {
    if sorted.is_empty() || !value.is_finite() {
        return f64::NAN;
    }
    sorted.partition_point(|&x| x <= value) as f64 / sorted.len() as f64 * 100.0
}

/// Equal-width bins over `[lo, hi]`; samples outside the range land in the edge bins.
pub fn histogram(sorted: &[f64], bins: usize, lo: f64, hi: f64) -> Vec<HistogramBin> {
    if bins == 0 || sorted.is_empty() || !(lo.is_finite() && hi.is_finite()) || hi < lo {
        return Vec::new();
    }
    let width = (hi - lo) / bins as f64;
    let mut counts = vec![0_u64; bins];
    for &x in sorted {
        counts[bin_index(x, lo, width, bins)] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            lower: lo + i as f64 * width,
            upper: lo + (i + 1) as f64 * width,
            count,
        })
        .collect()
}

fn bin_index(x: f64, lo: f64, width: f64, bins: usize) -> usize {
    if width <= 0.0 || x <= lo {
        return 0;
    }
    let idx = ((x - lo) / width) as usize;
    idx.min(bins - 1)
}

fn edges(lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let width = (hi - lo) / bins as f64;
    (0..=bins).map(|i| lo + i as f64 * width).collect()
}

/// 2-D histogram of index-paired samples over their own min/max ranges.
pub fn density_2d(xs: &[f64], ys: &[f64], bins: usize) -> DensityGrid {
    let n = xs.len().min(ys.len());
    let empty = DensityGrid {
        x_edges: Vec::new(),
        y_edges: Vec::new(),
        counts: Vec::new(),
        max_count: 0,
    };
    if n == 0 || bins == 0 {
        return empty;
    }

    let bounds = |values: &[f64]| {
        values[..n]
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    };
    let (x_lo, x_hi) = bounds(xs);
    let (y_lo, y_hi) = bounds(ys);
    if !(x_lo.is_finite() && x_hi.is_finite() && y_lo.is_finite() && y_hi.is_finite()) {
        return empty;
    }

    let x_width = (x_hi - x_lo) / bins as f64;
    let y_width = (y_hi - y_lo) / bins as f64;
    let mut counts = vec![vec![0_u64; bins]; bins];
    for (&x, &y) in xs[..n].iter().zip(&ys[..n]) {
        let col = bin_index(x, x_lo, x_width, bins);
        let row = bin_index(y, y_lo, y_width, bins);
        counts[row][col] += 1;
    }
    let max_count = counts.iter().flatten().copied().max().unwrap_or(0);

    DensityGrid {
        x_edges: edges(x_lo, x_hi, bins),
        y_edges: edges(y_lo, y_hi, bins),
        counts,
        max_count,
    }
}

impl DistributionSummary {
    pub fn from_sorted(sorted: &[f64]) -> Self {
        Self {
            mean: mean(sorted),
            std_dev: std_dev(sorted),
            median: percentile(sorted, 0.5),
            p05: percentile(sorted, 0.05),
            p95: percentile(sorted, 0.95),
        }
    }
}

impl SimulationSummary {
    pub fn from_sorted(
        sorted: &[f64],
        current_price: f64,
        mode_scenario_price: Option<f64>,
    ) -> Self {
        Self {
            mean: mean(sorted),
            std_dev: std_dev(sorted),
            median: percentile(sorted, 0.5),
            p05: percentile(sorted, 0.05),
            p95: percentile(sorted, 0.95),
            min: sorted.first().copied().unwrap_or(f64::NAN),
            max: sorted.last().copied().unwrap_or(f64::NAN),
            prob_above_current_price: probability_above(sorted, current_price),
            mode_scenario_price,
            mode_scenario_percentile: mode_scenario_price.map(|p| percentile_rank(sorted, p)),
            current_price_percentile: percentile_rank(sorted, current_price),
        }
    }
}
