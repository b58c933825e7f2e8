use std::fmt;

use thiserror::Error;

/// Invalid inputs, detected before any simulation runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("trade set is empty")]
    EmptyTrades,
    #[error("trade at index {index} is not a finite number")]
    NonFiniteTrade { index: usize },
    #[error("sequence_length must be > 0")]
    SequenceLength,
    #[error("initial_capital must be finite and > 0, got {0}")]
    InitialCapital(f64),
    #[error("tail_percentage must be in (0, 100), got {0}")]
    TailPercentage(f64),
    #[error("drawdown_tolerance must be in (0, 1], got {0}")]
    DrawdownTolerance(f64),
    #[error("number_equity_in_cdf must be > 0")]
    SampleCount,
    #[error("number_repetitions must be >= 1")]
    Repetitions,
    #[error("search bracket [{min}, {max}] must be finite with 0 <= min < max")]
    SearchBracket { min: f64, max: f64 },
    #[error("initial_fraction {0} must lie inside the search bracket")]
    InitialFraction(f64),
    #[error("search accuracy must be finite and > 0, got {0}")]
    Accuracy(f64),
    #[error("search min_step must be finite and > 0, got {0}")]
    MinStep(f64),
    #[error("search max_iterations must be > 0")]
    MaxIterations,
    #[error("invalid synthetic trade distribution: {0}")]
    SyntheticDistribution(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BudgetExhausted {
    IterationLimit,
    TimeBudget,
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetExhausted::IterationLimit => f.write_str("iteration limit reached"),
            BudgetExhausted::TimeBudget => f.write_str("time budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error(
        "safe-f search did not converge on repetition {repetition} after {iterations} iterations \
         ({reason}); last fraction {last_fraction:.4}"
    )]
    ConvergenceFailure {
        repetition: u32,
        iterations: u32,
        last_fraction: f64,
        last_tail_risk: Option<f64>,
        reason: BudgetExhausted,
    },
}

impl NormalizationError {
    /// Name of the pipeline phase that produced the error.
    pub fn phase(&self) -> &'static str {
        match self {
            NormalizationError::Configuration(_) => "configuration",
            NormalizationError::ConvergenceFailure { .. } => "safe-f search",
        }
    }
}
