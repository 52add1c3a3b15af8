//! Deterministic price grids over (g, r) for the scenario table and heatmap.

use super::types::{
    PriceLattice, ScenarioMatrix, SensitivityReport, ValuationInputs, ValueRange,
};

/// Points per axis of the dense lattice.
pub const LATTICE_SIZE: usize = 50;

impl ValueRange {
    /// Min/max over the defined cells; `None` when no cell is defined.
    pub fn from_cells<'a>(cells: impl IntoIterator<Item = &'a Option<f64>>) -> Option<Self> {
        cells
            .into_iter()
            .flatten()
            .fold(None, |range: Option<ValueRange>, &v| {
                Some(match range {
                    None => ValueRange { min: v, max: v },
                    Some(r) => ValueRange {
                        min: r.min.min(v),
                        max: r.max.max(v),
                    },
                })
            })
    }

    pub fn union(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(ValueRange {
                min: a.min.min(b.min),
                max: a.max.max(b.max),
            }),
            (a, None) => a,
            (None, b) => b,
        }
    }

    /// Position of `value` inside the range, in `[0, 1]`.
    pub fn normalize(&self, value: f64) -> f64 {
        let width = self.max - self.min;
        if width <= 0.0 {
            return 0.5;
        }
        ((value - self.min) / width).clamp(0.0, 1.0)
    }
}

fn axis(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..n)
            .map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

fn evaluate(inputs: &ValuationInputs, growth: &[f64], discount: &[f64]) -> Vec<Vec<Option<f64>>> {
    growth
        .iter()
        .map(|&g| discount.iter().map(|&r| inputs.price_at(g, r)).collect())
        .collect()
}

/// Rows `g ∈ {max, mode, min}`, columns `r ∈ {min, mode, max}` (or the fixed rate).
pub fn scenario_matrix(inputs: &ValuationInputs) -> ScenarioMatrix {
    let growth_rates = vec![inputs.growth.max, inputs.growth.mode, inputs.growth.min];
    let discount_rates = if inputs.discount.is_fixed() {
        vec![inputs.discount.mode()]
    } else {
        vec![
            inputs.discount.min(),
            inputs.discount.mode(),
            inputs.discount.max(),
        ]
    };
    let cells = evaluate(inputs, &growth_rates, &discount_rates);
    let range = ValueRange::from_cells(cells.iter().flatten());
    ScenarioMatrix {
        growth_rates,
        discount_rates,
        cells,
        range,
    }
}

/// `n x n` regular lattice over `[g_min, g_max] x [r_min, r_max]`; a fixed rate gives one column.
pub fn price_lattice(inputs: &ValuationInputs, n: usize) -> PriceLattice {
    let growth_axis = axis(inputs.growth.min, inputs.growth.max, n);
    let discount_axis = if inputs.discount.is_fixed() {
        axis(inputs.discount.mode(), inputs.discount.mode(), n.min(1))
    } else {
        axis(inputs.discount.min(), inputs.discount.max(), n)
    };
    let cells = evaluate(inputs, &growth_axis, &discount_axis);
    let range = ValueRange::from_cells(cells.iter().flatten());
    PriceLattice {
        growth_axis,
        discount_axis,
        cells,
        range,
    }
}

pub fn sensitivity_report(inputs: &ValuationInputs, n: usize) -> SensitivityReport {
    let scenarios = scenario_matrix(inputs);
    let lattice = price_lattice(inputs, n);
    let combined_range = ValueRange::union(scenarios.range, lattice.range);
    SensitivityReport {
        scenarios,
        lattice,
        combined_range,
    }
}
