use serde::Serialize;

use super::error::ValuationError;

/// `(min, mode, max)` of a triangular distribution.
///
/// `min == mode == max` is a legal, constant distribution.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriangularParams {
    pub min: f64,
    pub mode: f64,
    pub max: f64,
}

impl TriangularParams {
    pub fn new(min: f64, mode: f64, max: f64) -> Self {
        Self { min, mode, max }
    }

    pub fn constant(value: f64) -> Self {
        Self::new(value, value, value)
    }

    pub fn is_degenerate(&self) -> bool {
        self.min == self.max
    }

    pub fn mean(&self) -> f64 {
        (self.min + self.mode + self.max) / 3.0
    }

    pub(crate) fn validate(&self, field: &'static str) -> Result<(), ValuationError> {
        if !(self.min.is_finite() && self.mode.is_finite() && self.max.is_finite()) {
            return Err(ValuationError::invalid(field, "min, mode and max must be finite"));
        }
        if self.min > self.mode {
            return Err(ValuationError::invalid(
                field,
                format!("min ({}) must be <= mode ({})", self.min, self.mode),
            ));
        }
        if self.mode > self.max {
            return Err(ValuationError::invalid(
                field,
                format!("mode ({}) must be <= max ({})", self.mode, self.max),
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DiscountRate {
    Fixed(f64),
    Triangular(TriangularParams),
}

impl DiscountRate {
    pub fn min(&self) -> f64 {
        match self {
            DiscountRate::Fixed(r) => *r,
            DiscountRate::Triangular(t) => t.min,
        }
    }

    pub fn mode(&self) -> f64 {
        match self {
            DiscountRate::Fixed(r) => *r,
            DiscountRate::Triangular(t) => t.mode,
        }
    }

    pub fn max(&self) -> f64 {
        match self {
            DiscountRate::Fixed(r) => *r,
            DiscountRate::Triangular(t) => t.max,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, DiscountRate::Fixed(_))
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValuationMode {
    Historical,
    Forecast,
}

/// The cash-flow base a run prices against.
#[derive(Clone, Debug, PartialEq)]
pub enum CashFlowBasis {
    /// Base FCF already derived from historical operating cash flow and capex.
    Historical { base_fcf: f64 },
    /// Explicit forecast, year 1 first. Any horizon length >= 1.
    Forecast { cash_flows: Vec<f64> },
}

impl CashFlowBasis {
    pub fn mode(&self) -> ValuationMode {
        match self {
            CashFlowBasis::Historical { .. } => ValuationMode::Historical,
            CashFlowBasis::Forecast { .. } => ValuationMode::Forecast,
        }
    }
}

/// Convention used to back-solve the implied quantities of the reverse run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImpliedBasis {
    /// `EV * (r - g)` and `r - base / EV`: the base FCF is read as next year's cash flow.
    #[default]
    NextYear,
    /// Inverts `EV = base * (1 + g) / (r - g)` exactly.
    CurrentYear,
}

/// Validated, immutable description of one valuation run.
#[derive(Clone, Debug)]
pub struct ValuationInputs {
    pub cash_flows: CashFlowBasis,
    pub growth: TriangularParams,
    pub discount: DiscountRate,
    pub net_debt: f64,
    pub shares_outstanding: f64,
    pub current_price: f64,
    pub trial_count: usize,
    pub seed: Option<String>,
    pub implied_basis: ImpliedBasis,
}

impl ValuationInputs {
    pub fn mode(&self) -> ValuationMode {
        self.cash_flows.mode()
    }

    /// `current_price * shares + net_debt`.
    pub fn market_enterprise_value(&self) -> f64 {
        self.current_price * self.shares_outstanding + self.net_debt
    }

    /// Bytes held by a full forward sample buffer.
    pub fn expected_buffer_bytes(&self) -> usize {
        self.trial_count.saturating_mul(std::mem::size_of::<f64>())
    }

    pub fn validate(&self) -> Result<(), ValuationError> {
        self.growth.validate("growth")?;
        match &self.discount {
            DiscountRate::Fixed(r) if !r.is_finite() => {
                return Err(ValuationError::invalid("discount", "fixed rate must be finite"));
            }
            DiscountRate::Fixed(_) => {}
            DiscountRate::Triangular(t) => t.validate("discount")?,
        }
        match &self.cash_flows {
            CashFlowBasis::Historical { base_fcf } if !base_fcf.is_finite() => {
                return Err(ValuationError::invalid("base_fcf", "must be finite"));
            }
            CashFlowBasis::Historical { .. } => {}
            CashFlowBasis::Forecast { cash_flows } => {
                if cash_flows.is_empty() {
                    return Err(ValuationError::invalid(
                        "forecast_cash_flows",
                        "at least one forecast year is required",
                    ));
                }
                if let Some(idx) = cash_flows.iter().position(|cf| !cf.is_finite()) {
                    return Err(ValuationError::invalid(
                        "forecast_cash_flows",
                        format!("year {} is not finite", idx + 1),
                    ));
                }
            }
        }
        if !self.net_debt.is_finite() {
            return Err(ValuationError::invalid("net_debt", "must be finite"));
        }
        if !(self.shares_outstanding.is_finite() && self.shares_outstanding > 0.0) {
            return Err(ValuationError::invalid(
                "shares_outstanding",
                format!("must be > 0, got {}", self.shares_outstanding),
            ));
        }
        if !(self.current_price.is_finite() && self.current_price >= 0.0) {
            return Err(ValuationError::invalid(
                "current_price",
                format!("must be >= 0, got {}", self.current_price),
            ));
        }
        if self.trial_count == 0 {
            return Err(ValuationError::invalid("trial_count", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.processed as f64 / self.total as f64
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Decision-level statistics of a completed forward run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p05: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
    pub prob_above_current_price: f64,
    pub mode_scenario_price: Option<f64>,
    pub mode_scenario_percentile: Option<f64>,
    pub current_price_percentile: f64,
}

/// Location and spread of one sorted sample series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p05: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
}

/// 2-D histogram; `counts[y][x]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DensityGrid {
    pub x_edges: Vec<f64>,
    pub y_edges: Vec<f64>,
    pub counts: Vec<Vec<u64>>,
    pub max_count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// Coarse scenario cross-table. Rows follow `growth_rates`, columns `discount_rates`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioMatrix {
    pub growth_rates: Vec<f64>,
    pub discount_rates: Vec<f64>,
    pub cells: Vec<Vec<Option<f64>>>,
    pub range: Option<ValueRange>,
}

impl ScenarioMatrix {
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.cells.get(row).and_then(|r| r.get(col)).copied().flatten()
    }
}

/// Dense regular lattice over the configured g and r ranges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceLattice {
    pub growth_axis: Vec<f64>,
    pub discount_axis: Vec<f64>,
    pub cells: Vec<Vec<Option<f64>>>,
    pub range: Option<ValueRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityReport {
    pub scenarios: ScenarioMatrix,
    pub lattice: PriceLattice,
    pub combined_range: Option<ValueRange>,
}
