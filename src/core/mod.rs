mod engine;
mod error;
mod normalize;
mod solver;
mod trades;
mod types;

pub use engine::{
    Distribution, DistributionBuilder, EquityPath, PathSummary, Resampler, TRADING_DAYS_PER_YEAR,
    annualized_return, estimate_car25, simulate_equity, summarize_path, tail_risk,
};
pub use error::{BudgetExhausted, ConfigError, NormalizationError};
pub use normalize::{risk_normalization, run_risk_normalization, validate_config};
pub use solver::solve_safe_f;
pub use trades::{TradeSet, generate_trade_list};
pub use types::{
    Car25Estimate, NormalizationResult, RepetitionResult, SafeFSolution, SearchConfig,
    SearchIteration, SearchStrategy, SearchTermination, SimulationConfig, Statistic,
    TradeWeighting,
};
