mod engine;
mod error;
mod implied;
mod rng;
mod sensitivity;
pub mod stats;
mod types;
mod valuation;

pub use engine::{
    CancelToken, DEFAULT_CHUNK_SIZE, ForwardOutcome, ForwardRun, HISTOGRAM_BINS, RunState,
    SampleBuffer, Step, run_forward,
};
pub use error::ValuationError;
pub use implied::{DENSITY_BINS, ImpliedOutcome, ImpliedRun, implied_pair, run_implied};
pub use rng::{Mulberry32, UniformSource, hash_seed};
pub use sensitivity::{LATTICE_SIZE, price_lattice, scenario_matrix, sensitivity_report};
pub use types::{
    CashFlowBasis, DensityGrid, DiscountRate, DistributionSummary, HistogramBin, ImpliedBasis,
    PriceLattice, Progress, ScenarioMatrix, SensitivityReport, SimulationSummary,
    TriangularParams, ValuationInputs, ValuationMode, ValueRange,
};
pub use valuation::{
    Averaging, DISCARD_EPSILON, HistoricalCashFlows, YearCashFlow, forecast_price,
    historical_price,
};
