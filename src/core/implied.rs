//! Reverse ("implied") Monte Carlo: what the market price requires.
//!
//! Each trial draws a fresh `(g, r)` pair and back-solves, against the observed
//! enterprise value, the base FCF that would justify today's price and the
//! growth rate that would justify it given the actual base FCF.

use tracing::{debug, info, warn};

use super::engine::{
    CancelToken, ChunkCursor, LARGE_RUN_TRIALS, RunState, SampleBuffer, Step, reserve_buffer,
};
use super::error::ValuationError;
use super::rng::UniformSource;
use super::stats::{density_2d, percentile_rank, probability_above};
use super::types::{DensityGrid, DistributionSummary, ImpliedBasis, Progress, ValuationInputs};

/// Resolution of the implied-FCF x implied-g density grid.
pub const DENSITY_BINS: usize = 40;

const IMPLIED_STREAM: u32 = 1;

/// `(implied_fcf, implied_g)` for one draw.
pub fn implied_pair(basis: ImpliedBasis, ev: f64, base_fcf: f64, g: f64, r: f64) -> (f64, f64) {
    match basis {
        ImpliedBasis::NextYear => (ev * (r - g), r - base_fcf / ev),
        ImpliedBasis::CurrentYear => (
            ev * (r - g) / (1.0 + g),
            (ev * r - base_fcf) / (ev + base_fcf),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct ImpliedOutcome {
    /// Index-paired with `implied_growth`, in trial order.
    pub implied_fcf: Vec<f64>,
    pub implied_growth: Vec<f64>,
    pub sorted_fcf: SampleBuffer,
    pub sorted_growth: SampleBuffer,
    pub fcf_summary: DistributionSummary,
    pub growth_summary: DistributionSummary,
    pub market_enterprise_value: f64,
    pub base_fcf: f64,
    /// Share of draws whose implied FCF is at or below the actual base FCF.
    pub base_fcf_percentile: f64,
    /// Share of draws whose implied growth exceeds the analyst's mode growth.
    pub prob_growth_above_mode: f64,
    pub density: DensityGrid,
}

#[derive(Debug)]
pub struct ImpliedRun {
    inputs: ValuationInputs,
    rng: UniformSource,
    market_ev: f64,
    base_fcf: f64,
    implied_fcf: Vec<f64>,
    implied_growth: Vec<f64>,
    cursor: ChunkCursor,
}

impl ImpliedRun {
    pub fn new(inputs: &ValuationInputs) -> Result<Self, ValuationError> {
        inputs.validate()?;
        let market_ev = inputs.market_enterprise_value();
        if !(market_ev > 0.0) {
            return Err(ValuationError::NonPositiveEnterpriseValue(market_ev));
        }
        let base_fcf = inputs.cash_flows.reverse_base_fcf();
        if inputs.trial_count > LARGE_RUN_TRIALS {
            warn!(
                trials = inputs.trial_count,
                peak_bytes = inputs.expected_buffer_bytes().saturating_mul(4),
                "large implied run"
            );
        }
        info!(
            trials = inputs.trial_count,
            market_ev,
            base_fcf,
            basis = ?inputs.implied_basis,
            "starting implied simulation"
        );
        Ok(Self {
            inputs: inputs.clone(),
            rng: UniformSource::for_stream(inputs.seed.as_deref(), IMPLIED_STREAM),
            market_ev,
            base_fcf,
            implied_fcf: reserve_buffer(inputs.trial_count)?,
            implied_growth: reserve_buffer(inputs.trial_count)?,
            cursor: ChunkCursor::new(inputs.trial_count),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.cursor.set_chunk_size(chunk_size);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cursor.set_cancel_token(cancel);
        self
    }

    pub fn state(&self) -> RunState {
        self.cursor.state()
    }

    pub fn progress(&self) -> Progress {
        self.cursor.progress()
    }

    pub fn market_enterprise_value(&self) -> f64 {
        self.market_ev
    }

    pub fn step(&mut self) -> Result<Step, ValuationError> {
        let Some(trials) = self.cursor.begin_chunk()? else {
            return Ok(Step::Finished(self.cursor.progress()));
        };

        let basis = self.inputs.implied_basis;
        for _ in 0..trials {
            let g = self.inputs.growth.sample(&mut self.rng);
            let r = self.inputs.discount.sample(&mut self.rng);
            let (fcf, growth) = implied_pair(basis, self.market_ev, self.base_fcf, g, r);
            self.implied_fcf.push(fcf);
            self.implied_growth.push(growth);
        }

        let step = self.cursor.end_chunk(trials);
        debug!(
            processed = step.progress().processed,
            total = step.progress().total,
            "implied chunk done"
        );
        Ok(step)
    }

    pub fn finish(self) -> Result<ImpliedOutcome, ValuationError> {
        self.cursor.ensure_completed()?;

        let sorted_fcf = SampleBuffer::from_unsorted(self.implied_fcf.clone());
        let sorted_growth = SampleBuffer::from_unsorted(self.implied_growth.clone());
        let density = density_2d(&self.implied_fcf, &self.implied_growth, DENSITY_BINS);
        let fcf_summary = DistributionSummary::from_sorted(sorted_fcf.as_slice());
        let growth_summary = DistributionSummary::from_sorted(sorted_growth.as_slice());
        let base_fcf_percentile = percentile_rank(sorted_fcf.as_slice(), self.base_fcf);
        let prob_growth_above_mode =
            probability_above(sorted_growth.as_slice(), self.inputs.growth.mode);
        info!(
            trials = self.inputs.trial_count,
            median_implied_fcf = fcf_summary.median,
            median_implied_growth = growth_summary.median,
            "implied simulation complete"
        );

        Ok(ImpliedOutcome {
            implied_fcf: self.implied_fcf,
            implied_growth: self.implied_growth,
            sorted_fcf,
            sorted_growth,
            fcf_summary,
            growth_summary,
            market_enterprise_value: self.market_ev,
            base_fcf: self.base_fcf,
            base_fcf_percentile,
            prob_growth_above_mode,
            density,
        })
    }
}

pub fn run_implied(
    inputs: &ValuationInputs,
    mut on_progress: impl FnMut(Progress),
) -> Result<ImpliedOutcome, ValuationError> {
    let mut run = ImpliedRun::new(inputs)?;
    loop {
        let step = run.step()?;
        on_progress(step.progress());
        if let Step::Finished(_) = step {
            break;
        }
    }
    run.finish()
}
