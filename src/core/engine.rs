use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::ValuationError;
use super::rng::UniformSource;
use super::stats::{histogram, percentile};
use super::types::{HistogramBin, Progress, SimulationSummary, ValuationInputs};
use super::valuation::DISCARD_EPSILON;

/// Trials evaluated between two yield points.
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Price histogram resolution; the range spans p01..p99 with tails clamped into the edge bins.
pub const HISTOGRAM_BINS: usize = 60;

/// Trial counts above this are logged as memory-heavy.
///
/// A forward run holds 8 bytes per trial. A reverse run peaks at 32 bytes per
/// trial while `finish` builds the sorted copies of both paired sequences.
pub const LARGE_RUN_TRIALS: usize = 5_000_000;

pub(crate) const FORWARD_STREAM: u32 = 0;

/// Cooperative abort flag, observed only at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Outcome of one call to `step`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// One chunk ran; more remain.
    Yielded(Progress),
    /// All trials have run; call `finish`.
    Finished(Progress),
}

impl Step {
    pub fn progress(&self) -> Progress {
        match self {
            Step::Yielded(p) | Step::Finished(p) => *p,
        }
    }
}

/// Chunk bookkeeping and the `Idle -> Running -> {Completed | Aborted}` machine
/// shared by both drivers.
#[derive(Debug)]
pub(crate) struct ChunkCursor {
    processed: usize,
    total: usize,
    chunk_size: usize,
    state: RunState,
    cancel: CancelToken,
}

impl ChunkCursor {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            processed: 0,
            total,
            chunk_size: DEFAULT_CHUNK_SIZE,
            state: RunState::Idle,
            cancel: CancelToken::new(),
        }
    }

    pub(crate) fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub(crate) fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress {
            processed: self.processed,
            total: self.total,
        }
    }

    /// Number of trials in the next chunk, or `None` once the run is complete.
    pub(crate) fn begin_chunk(&mut self) -> Result<Option<usize>, ValuationError> {
        match self.state {
            RunState::Completed => return Ok(None),
            RunState::Aborted => return Err(self.aborted()),
            RunState::Idle | RunState::Running => {}
        }
        if self.cancel.is_cancelled() {
            self.state = RunState::Aborted;
            return Err(self.aborted());
        }
        self.state = RunState::Running;
        Ok(Some(self.chunk_size.min(self.total - self.processed)))
    }

    pub(crate) fn end_chunk(&mut self, trials: usize) -> Step {
        self.processed += trials;
        let progress = self.progress();
        if progress.is_complete() {
            self.state = RunState::Completed;
            Step::Finished(progress)
        } else {
            Step::Yielded(progress)
        }
    }

    pub(crate) fn ensure_completed(&self) -> Result<(), ValuationError> {
        match self.state {
            RunState::Completed => Ok(()),
            RunState::Aborted => Err(self.aborted()),
            RunState::Idle | RunState::Running => Err(ValuationError::RunIncomplete {
                processed: self.processed,
                total: self.total,
            }),
        }
    }

    fn aborted(&self) -> ValuationError {
        ValuationError::Aborted {
            processed: self.processed,
            total: self.total,
        }
    }
}

/// Reserves room for `trials` values without aborting on allocation failure.
pub(crate) fn reserve_buffer(trials: usize) -> Result<Vec<f64>, ValuationError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(trials)
        .map_err(|_| ValuationError::BufferAllocation { trials })?;
    Ok(buffer)
}

/// Valid prices of a finished run, sorted ascending and no longer mutable.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer(Vec<f64>);

impl SampleBuffer {
    pub(crate) fn from_unsorted(mut values: Vec<f64>) -> Self {
        values.sort_unstable_by(|a, b| a.total_cmp(b));
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOutcome {
    pub samples: SampleBuffer,
    pub summary: SimulationSummary,
    pub histogram: Vec<HistogramBin>,
    pub trial_count: usize,
    pub valid_count: usize,
}

impl ForwardOutcome {
    pub fn discarded_count(&self) -> usize {
        self.trial_count - self.valid_count
    }
}

/// Forward Monte Carlo driver. Owns its sample buffer until `finish`.
#[derive(Debug)]
pub struct ForwardRun {
    inputs: ValuationInputs,
    rng: UniformSource,
    prices: Vec<f64>,
    cursor: ChunkCursor,
}

impl ForwardRun {
    pub fn new(inputs: &ValuationInputs) -> Result<Self, ValuationError> {
        inputs.validate()?;
        if inputs.trial_count > LARGE_RUN_TRIALS {
            warn!(
                trials = inputs.trial_count,
                buffer_bytes = inputs.expected_buffer_bytes(),
                "large forward run"
            );
        }
        let rng = UniformSource::for_stream(inputs.seed.as_deref(), FORWARD_STREAM);
        info!(
            trials = inputs.trial_count,
            mode = ?inputs.mode(),
            seeded = rng.is_seeded(),
            "starting forward simulation"
        );
        Ok(Self {
            inputs: inputs.clone(),
            rng,
            prices: reserve_buffer(inputs.trial_count)?,
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

    /// Runs one chunk of trials and returns control to the caller.
    pub fn step(&mut self) -> Result<Step, ValuationError> {
        let Some(trials) = self.cursor.begin_chunk()? else {
            return Ok(Step::Finished(self.cursor.progress()));
        };

        let inputs = &self.inputs;
        for _ in 0..trials {
            let g = inputs.growth.sample(&mut self.rng);
            let r = inputs.discount.sample(&mut self.rng);
            if let Some(price) = inputs.cash_flows.price_with_spread(
                g,
                r,
                inputs.net_debt,
                inputs.shares_outstanding,
                DISCARD_EPSILON,
            ) {
                self.prices.push(price);
            }
        }

        let step = self.cursor.end_chunk(trials);
        debug!(
            processed = step.progress().processed,
            total = step.progress().total,
            valid = self.prices.len(),
            "forward chunk done"
        );
        Ok(step)
    }

    /// Sorts the buffer and derives the summary.
    pub fn finish(self) -> Result<ForwardOutcome, ValuationError> {
        self.cursor.ensure_completed()?;
        let trial_count = self.inputs.trial_count;
        if self.prices.is_empty() {
            warn!(trials = trial_count, "forward run produced no valid trials");
            return Err(ValuationError::NoValidTrials { trial_count });
        }

        let samples = SampleBuffer::from_unsorted(self.prices);
        let sorted = samples.as_slice();
        let summary = SimulationSummary::from_sorted(
            sorted,
            self.inputs.current_price,
            self.inputs.mode_scenario_price(),
        );
        let histogram = histogram(
            sorted,
            HISTOGRAM_BINS,
            percentile(sorted, 0.01),
            percentile(sorted, 0.99),
        );
        let valid_count = samples.len();
        info!(
            trials = trial_count,
            valid = valid_count,
            median = summary.median,
            "forward simulation complete"
        );

        Ok(ForwardOutcome {
            samples,
            summary,
            histogram,
            trial_count,
            valid_count,
        })
    }
}

/// Drives a forward run to completion, reporting progress after every chunk.
pub fn run_forward(
    inputs: &ValuationInputs,
    mut on_progress: impl FnMut(Progress),
) -> Result<ForwardOutcome, ValuationError> {
    let mut run = ForwardRun::new(inputs)?;
    loop {
        let step = run.step()?;
        on_progress(step.progress());
        if let Step::Finished(_) = step {
            break;
        }
    }
    run.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{historical_inputs, sample_inputs};
    use crate::core::types::{DiscountRate, TriangularParams};
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    #[test]
    fn chunks_report_progress_until_finished() {
        let mut inputs = sample_inputs();
        inputs.trial_count = 25;
        let mut run = ForwardRun::new(&inputs).expect("valid").with_chunk_size(10);
        assert_eq!(run.state(), RunState::Idle);

        assert_eq!(
            run.step().expect("chunk"),
            Step::Yielded(Progress {
                processed: 10,
                total: 25
            })
        );
        assert_eq!(run.state(), RunState::Running);
        assert_eq!(
            run.step().expect("chunk"),
            Step::Yielded(Progress {
                processed: 20,
                total: 25
            })
        );
        assert_eq!(
            run.step().expect("chunk"),
            Step::Finished(Progress {
                processed: 25,
                total: 25
            })
        );
        assert_eq!(run.state(), RunState::Completed);
        // Stepping a completed run is a no-op.
        assert!(matches!(run.step(), Ok(Step::Finished(_))));

        let outcome = run.finish().expect("completed");
        assert_eq!(outcome.trial_count, 25);
    }

    #[test]
    fn run_forward_emits_one_progress_per_chunk() {
        let mut inputs = sample_inputs();
        inputs.trial_count = 120_001;
        let mut seen = Vec::new();
        let outcome = run_forward(&inputs, |p| seen.push(p.processed)).expect("run");
        assert_eq!(seen, vec![50_000, 100_000, 120_001]);
        assert_eq!(outcome.valid_count + outcome.discarded_count(), 120_001);
    }

    #[test]
    fn cancel_token_aborts_at_the_next_boundary() {
        let mut inputs = sample_inputs();
        inputs.trial_count = 100;
        let token = CancelToken::new();
        let mut run = ForwardRun::new(&inputs)
            .expect("valid")
            .with_chunk_size(10)
            .with_cancel_token(token.clone());
        run.step().expect("first chunk");
        token.cancel();

        let err = run.step().expect_err("must abort");
        assert_eq!(
            err,
            ValuationError::Aborted {
                processed: 10,
                total: 100
            }
        );
        assert_eq!(run.state(), RunState::Aborted);
        assert!(matches!(run.finish(), Err(ValuationError::Aborted { .. })));
    }

    #[test]
    fn finish_before_completion_is_rejected() {
        let mut inputs = sample_inputs();
        inputs.trial_count = 100;
        let mut run = ForwardRun::new(&inputs).expect("valid").with_chunk_size(10);
        run.step().expect("chunk");
        assert_eq!(
            run.finish().expect_err("incomplete"),
            ValuationError::RunIncomplete {
                processed: 10,
                total: 100
            }
        );
    }

    #[test]
    fn invalid_inputs_are_rejected_before_sampling() {
        let mut inputs = sample_inputs();
        inputs.growth = TriangularParams::new(0.05, 0.03, 0.06);
        assert!(matches!(
            ForwardRun::new(&inputs),
            Err(ValuationError::InvalidInput {
                field: "growth",
                ..
            })
        ));
    }

    #[test]
    fn discarded_trials_never_reach_the_buffer() {
        let mut inputs = historical_inputs(100.0, 0.0, 100.0);
        inputs.growth = TriangularParams::new(0.03, 0.05, 0.12);
        inputs.discount = DiscountRate::Fixed(0.04);
        inputs.trial_count = 20_000;

        let outcome = run_forward(&inputs, |_| {}).expect("some valid trials");
        assert!(outcome.valid_count > 0);
        assert!(outcome.valid_count < outcome.trial_count);

        // Price is increasing in g for r fixed, so the largest admissible g bounds every price.
        let bound = inputs
            .price_at(0.04 - DISCARD_EPSILON, 0.04)
            .expect("defined at the boundary");
        for &price in outcome.samples.as_slice() {
            assert!(price.is_finite());
            assert!(price < bound);
            // Invert the Gordon formula to recover the sampled growth rate.
            let ev = price * 100.0;
            let g = (ev * 0.04 - 100.0) / (ev + 100.0);
            assert!(g < 0.04 - DISCARD_EPSILON + 1e-9);
        }
    }

    #[test]
    fn unreservable_trial_counts_fail_without_panicking() {
        assert_eq!(
            reserve_buffer(usize::MAX / 4),
            Err(ValuationError::BufferAllocation {
                trials: usize::MAX / 4
            })
        );
        assert!(reserve_buffer(16).expect("small buffer").capacity() >= 16);

        let mut inputs = sample_inputs();
        inputs.trial_count = usize::MAX / 4;
        assert!(matches!(
            ForwardRun::new(&inputs),
            Err(ValuationError::BufferAllocation { .. })
        ));
    }

    #[test]
    fn overlapping_ranges_yield_no_valid_trials() {
        let mut inputs = historical_inputs(100.0, 0.0, 100.0);
        inputs.growth = TriangularParams::new(0.08, 0.10, 0.12);
        inputs.discount = DiscountRate::Fixed(0.05);
        inputs.trial_count = 10_000;

        let err = run_forward(&inputs, |_| {}).expect_err("degenerate run");
        assert_eq!(
            err,
            ValuationError::NoValidTrials {
                trial_count: 10_000
            }
        );
    }

    #[test]
    fn samples_are_sorted_and_summary_is_ordered() {
        let inputs = sample_inputs();
        let outcome = run_forward(&inputs, |_| {}).expect("run");
        let s = outcome.samples.as_slice();
        assert!(s.windows(2).all(|w| w[0] <= w[1]));
        let summary = &outcome.summary;
        assert!(summary.min <= summary.p05);
        assert!(summary.p05 <= summary.median);
        assert!(summary.median <= summary.p95);
        assert!(summary.p95 <= summary.max);
        assert_eq!(
            outcome.histogram.iter().map(|b| b.count).sum::<u64>(),
            outcome.valid_count as u64
        );
    }

    #[test]
    fn constant_inputs_collapse_to_the_mode_price() {
        let mut inputs = historical_inputs(100.0, 0.0, 100.0);
        inputs.growth = TriangularParams::constant(0.05);
        inputs.discount = DiscountRate::Fixed(0.10);
        inputs.current_price = 20.0;
        inputs.trial_count = 500;

        let outcome = run_forward(&inputs, |_| {}).expect("run");
        let summary = &outcome.summary;
        assert!((summary.mean - 21.0).abs() < 1e-9);
        assert!((summary.median - 21.0).abs() < 1e-9);
        assert_eq!(summary.mode_scenario_price, inputs.mode_scenario_price());
        assert_eq!(summary.prob_above_current_price, 100.0);
        assert_eq!(summary.current_price_percentile, 0.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(16))]

        #[test]
        fn prop_same_seed_reruns_are_identical(
            seed in "[a-zA-Z0-9]{1,12}",
            trials in 1usize..5_000,
            chunk in 1usize..2_000,
            fixed_discount in any::<bool>()
        ) {
            let mut inputs = sample_inputs();
            inputs.seed = Some(seed);
            inputs.trial_count = trials;
            if fixed_discount {
                inputs.discount = DiscountRate::Fixed(0.09);
            }

            let a = run_forward(&inputs, |_| {}).expect("run a");
            let mut run_b = ForwardRun::new(&inputs).expect("valid").with_chunk_size(chunk);
            while let Step::Yielded(_) = run_b.step().expect("chunk") {}
            let b = run_b.finish().expect("run b");

            prop_assert_eq!(a.samples.as_slice(), b.samples.as_slice());
            prop_assert_eq!(&a.summary, &b.summary);
            prop_assert!(a.valid_count <= trials);
        }
    }
}
