use thiserror::Error;

/// Failures surfaced by the valuation core.
///
/// Per-trial non-finite prices are not errors; they are filtered out of the
/// sample buffer by the drivers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValuationError {
    /// An input record broke one of its invariants; no sampling was done.
    #[error("invalid input `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// `current_price * shares + net_debt` must be positive for the reverse run.
    #[error("market enterprise value must be > 0, got {0}")]
    NonPositiveEnterpriseValue(f64),

    /// Every sampled (g, r) pair was discarded because r - g was too small.
    #[error("no valid trials: all {trial_count} sampled (g, r) pairs had r - g <= 1e-4")]
    NoValidTrials { trial_count: usize },

    /// The sample buffer for `trials` values could not be reserved.
    #[error("cannot allocate a sample buffer for {trials} trials")]
    BufferAllocation { trials: usize },

    /// The cancel token was observed at a chunk boundary.
    #[error("run aborted after {processed} of {total} trials")]
    Aborted { processed: usize, total: usize },

    /// `finish` was called before every chunk ran.
    #[error("run incomplete: {processed} of {total} trials processed")]
    RunIncomplete { processed: usize, total: usize },
}

impl ValuationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}
