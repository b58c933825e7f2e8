use std::time::Duration;

use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TradeWeighting {
    Uniform,
    /// Trade `i` (0 = oldest) is drawn with weight `i + 1`.
    Triangular,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchStrategy {
    Bisection,
    /// `f <- f * tolerance / tail_risk`, clamped into the bracket.
    Proportional,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Statistic {
    MaxDrawdown,
    TerminalEquity,
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub sequence_length: usize,
    pub initial_capital: f64,
    pub tail_percentage: f64,
    pub drawdown_tolerance: f64,
    pub number_equity_in_cdf: usize,
    pub number_repetitions: usize,
    pub weighting: TradeWeighting,
    pub seed: u64,
    pub parallel: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sequence_length: 504,
            initial_capital: 100_000.0,
            tail_percentage: 5.0,
            drawdown_tolerance: 0.10,
            number_equity_in_cdf: 1_000,
            number_repetitions: 1,
            weighting: TradeWeighting::Uniform,
            seed: 42,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    pub strategy: SearchStrategy,
    pub min_fraction: f64,
    pub max_fraction: f64,
    pub initial_fraction: f64,
    pub accuracy: f64,
    pub min_step: f64,
    pub max_iterations: u32,
    /// Reuse the same trial seeds for every evaluation within one repetition.
    pub common_random_numbers: bool,
    pub time_budget: Option<Duration>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::Bisection,
            min_fraction: 0.0,
            max_fraction: 2.0,
            initial_fraction: 1.0,
            accuracy: 0.003,
            min_step: 1e-4,
            max_iterations: 50,
            common_random_numbers: true,
            time_budget: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchTermination {
    WithinAccuracy,
    StepBelowMinimum,
    UpperBoundSafe,
    LowerBoundBreached,
}

impl SearchTermination {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchTermination::WithinAccuracy => "within-accuracy",
            SearchTermination::StepBelowMinimum => "step-below-minimum",
            SearchTermination::UpperBoundSafe => "upper-bound-safe",
            SearchTermination::LowerBoundBreached => "lower-bound-breached",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub fraction: f64,
    pub tail_risk: f64,
}

#[derive(Debug, Clone)]
pub struct SafeFSolution {
    pub safe_f: f64,
    pub tail_risk: f64,
    pub termination: SearchTermination,
    pub iterations: Vec<SearchIteration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Car25Estimate {
    pub terminal_wealth_25: f64,
    pub car25: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepetitionResult {
    pub repetition: u32,
    pub safe_f: f64,
    pub car25: f64,
    pub tail_risk: f64,
    pub terminal_wealth_25: f64,
    pub termination: SearchTermination,
    pub iterations: Vec<SearchIteration>,
}

#[derive(Debug, Clone)]
pub struct NormalizationResult {
    /// Safe-f of the first repetition.
    pub safe_f: f64,
    /// CAR25 of the first repetition.
    pub car25: f64,
    pub repetitions: Vec<RepetitionResult>,
}
