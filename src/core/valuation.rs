//! DCF pricing: perpetual-growth (historical base) and explicit forecast.

use serde::Serialize;

use super::types::{CashFlowBasis, ValuationInputs};

/// Spread below which a sampled `(g, r)` pair is discarded inside a simulation.
pub const DISCARD_EPSILON: f64 = 1e-4;

/// Years of history that feed the base FCF.
pub const MAX_HISTORY_YEARS: usize = 5;

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearCashFlow {
    pub operating_cash_flow: f64,
    pub capital_expenditure: f64,
}

impl YearCashFlow {
    pub fn free_cash_flow(&self) -> f64 {
        self.operating_cash_flow - self.capital_expenditure
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Averaging {
    #[default]
    Simple,
    /// Weights `1..N`, the most recent year weighted `N`.
    RecencyWeighted,
}

/// Historical cash flows, oldest year first.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoricalCashFlows {
    pub years: Vec<YearCashFlow>,
    pub averaging: Averaging,
}

impl HistoricalCashFlows {
    /// The most recent (at most five) years actually used.
    pub fn window(&self) -> &[YearCashFlow] {
        let start = self.years.len().saturating_sub(MAX_HISTORY_YEARS);
        &self.years[start..]
    }

    /// Mean FCF over the window, or `None` when there is no history.
    pub fn base_fcf(&self) -> Option<f64> {
        let window = self.window();
        if window.is_empty() {
            return None;
        }
        let base = match self.averaging {
            Averaging::Simple => {
                window.iter().map(YearCashFlow::free_cash_flow).sum::<f64>() / window.len() as f64
            }
            Averaging::RecencyWeighted => {
                let mut weighted = 0.0;
                let mut weights = 0.0;
                for (idx, year) in window.iter().enumerate() {
                    let w = (idx + 1) as f64;
                    weighted += w * year.free_cash_flow();
                    weights += w;
                }
                weighted / weights
            }
        };
        Some(base)
    }
}

/// `fcf_next / (r - g)`.
pub fn terminal_value(fcf_next: f64, g: f64, r: f64) -> f64 {
    fcf_next / (r - g)
}

fn per_share(enterprise_value: f64, net_debt: f64, shares: f64) -> Option<f64> {
    let price = (enterprise_value - net_debt) / shares;
    price.is_finite().then_some(price)
}

/// Perpetual-growth price on a historical base FCF.
pub fn historical_price(base_fcf: f64, g: f64, r: f64, net_debt: f64, shares: f64) -> Option<f64> {
    if r - g <= 0.0 {
        return None;
    }
    let fcf1 = base_fcf * (1.0 + g);
    per_share(terminal_value(fcf1, g, r), net_debt, shares)
}

/// Explicit forecast discounted year by year, terminal value anchored on the last year.
pub fn forecast_price(
    cash_flows: &[f64],
    g: f64,
    r: f64,
    net_debt: f64,
    shares: f64,
) -> Option<f64> {
    if r - g <= 0.0 {
        return None;
    }
    let last = *cash_flows.last()?;
    let growth = 1.0 + r;
    let mut factor = 1.0;
    let mut present_value = 0.0;
    for cf in cash_flows {
        factor *= growth;
        present_value += cf / factor;
    }
    let tv = terminal_value(last * (1.0 + g), g, r);
    per_share(present_value + tv / factor, net_debt, shares)
}

impl CashFlowBasis {
    /// Price per share, or `None` when `r - g <= 0` or the result is not finite.
    pub fn price(&self, g: f64, r: f64, net_debt: f64, shares: f64) -> Option<f64> {
        match self {
            CashFlowBasis::Historical { base_fcf } => {
                historical_price(*base_fcf, g, r, net_debt, shares)
            }
            CashFlowBasis::Forecast { cash_flows } => {
                forecast_price(cash_flows, g, r, net_debt, shares)
            }
        }
    }

    /// Like [`CashFlowBasis::price`] but also rejects `r - g <= min_spread`.
    pub fn price_with_spread(
        &self,
        g: f64,
        r: f64,
        net_debt: f64,
        shares: f64,
        min_spread: f64,
    ) -> Option<f64> {
        if r - g <= min_spread {
            return None;
        }
        self.price(g, r, net_debt, shares)
    }

    /// Cash flow the reverse run solves against: the historical base, or forecast year 1.
    pub fn reverse_base_fcf(&self) -> f64 {
        match self {
            CashFlowBasis::Historical { base_fcf } => *base_fcf,
            CashFlowBasis::Forecast { cash_flows } => cash_flows.first().copied().unwrap_or(0.0),
        }
    }
}

impl ValuationInputs {
    pub fn price_at(&self, g: f64, r: f64) -> Option<f64> {
        self.cash_flows
            .price(g, r, self.net_debt, self.shares_outstanding)
    }

    /// Price at `(growth.mode, discount.mode)`.
    pub fn mode_scenario_price(&self) -> Option<f64> {
        self.price_at(self.growth.mode, self.discount.mode())
    }
}
