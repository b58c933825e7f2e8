use std::time::Instant;

use tracing::{debug, info, warn};

use super::engine::{Distribution, DistributionBuilder, derive_seed, tail_risk};
use super::error::{BudgetExhausted, NormalizationError};
use super::types::{
    SafeFSolution, SearchConfig, SearchIteration, SearchStrategy, SearchTermination,
    SimulationConfig, Statistic,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Candidate {
    UpperProbe,
    LowerProbe,
    Interior,
}

#[derive(Debug)]
enum SearchPhase {
    Initial,
    Simulate,
    Evaluate(Distribution),
    Adjust { tail_risk: f64 },
    Converged(SearchTermination),
    MaxIterationsExceeded(BudgetExhausted),
}

#[derive(Debug)]
struct SearchState {
    phase: SearchPhase,
    candidate: Candidate,
    fraction: f64,
    tail_risk: Option<f64>,
    lower: f64,
    lower_tail: f64,
    upper: f64,
    iteration: u32,
    trace: Vec<SearchIteration>,
}

impl SearchState {
    fn new(search: &SearchConfig) -> Self {
        Self {
            phase: SearchPhase::Initial,
            candidate: Candidate::UpperProbe,
            fraction: search.max_fraction,
            tail_risk: None,
            lower: search.min_fraction,
            // Zero exposure never draws down.
            lower_tail: 0.0,
            upper: search.max_fraction,
            iteration: 0,
            trace: Vec::with_capacity(search.max_iterations.min(64) as usize),
        }
    }

    fn adjust(&mut self, measured: f64, tolerance: f64, search: &SearchConfig) -> SearchPhase {
        let within_accuracy = (measured - tolerance).abs() <= search.accuracy;

        match self.candidate {
            Candidate::UpperProbe => {
                if measured <= tolerance + search.accuracy {
                    return SearchPhase::Converged(SearchTermination::UpperBoundSafe);
                }
                if search.min_fraction > 0.0 {
                    self.candidate = Candidate::LowerProbe;
                    self.fraction = search.min_fraction;
                    return SearchPhase::Simulate;
                }
                self.first_interior(search)
            }
            Candidate::LowerProbe => {
                if within_accuracy {
                    return SearchPhase::Converged(SearchTermination::WithinAccuracy);
                }
                if measured > tolerance {
                    return SearchPhase::Converged(SearchTermination::LowerBoundBreached);
                }
                self.lower_tail = measured;
                self.first_interior(search)
            }
            Candidate::Interior if within_accuracy => {
                SearchPhase::Converged(SearchTermination::WithinAccuracy)
            }
            Candidate::Interior => match search.strategy {
                SearchStrategy::Bisection => {
                    if measured > tolerance {
                        self.upper = self.fraction;
                    } else {
                        self.lower = self.fraction;
                        self.lower_tail = measured;
                    }

                    if self.upper - self.lower < search.min_step {
                        // The lower end is the last fraction measured at or under tolerance.
                        self.fraction = self.lower;
                        self.tail_risk = Some(self.lower_tail);
                        return SearchPhase::Converged(SearchTermination::StepBelowMinimum);
                    }

                    self.fraction = 0.5 * (self.lower + self.upper);
                    SearchPhase::Simulate
                }
                SearchStrategy::Proportional => {
                    let next = if measured <= 0.0 {
                        search.max_fraction
                    } else {
                        self.fraction * tolerance / measured
                    }
                    .clamp(search.min_fraction, search.max_fraction);

                    if (next - self.fraction).abs() < search.min_step {
                        if measured > tolerance && self.fraction <= search.min_fraction {
                            return SearchPhase::Converged(SearchTermination::LowerBoundBreached);
                        }
                        return SearchPhase::Converged(SearchTermination::StepBelowMinimum);
                    }

                    self.fraction = next;
                    SearchPhase::Simulate
                }
            },
        }
    }

    fn first_interior(&mut self, search: &SearchConfig) -> SearchPhase {
        self.candidate = Candidate::Interior;
        self.fraction = match search.strategy {
            SearchStrategy::Bisection => 0.5 * (self.lower + self.upper),
            SearchStrategy::Proportional => search.initial_fraction,
        };
        SearchPhase::Simulate
    }
}

/// Searches for the largest fraction whose tail drawdown meets `drawdown_tolerance`.
pub fn solve_safe_f(
    builder: &DistributionBuilder<'_>,
    config: &SimulationConfig,
    search: &SearchConfig,
    repetition: u32,
) -> Result<SafeFSolution, NormalizationError> {
    let started = Instant::now();
    let mut state = SearchState::new(search);

    loop {
        let phase = std::mem::replace(&mut state.phase, SearchPhase::Initial);
        state.phase = match phase {
            SearchPhase::Initial => {
                state.candidate = Candidate::UpperProbe;
                state.fraction = search.max_fraction;
                SearchPhase::Simulate
            }
            SearchPhase::Simulate => {
                if state.iteration >= search.max_iterations {
                    SearchPhase::MaxIterationsExceeded(BudgetExhausted::IterationLimit)
                } else if search
                    .time_budget
                    .is_some_and(|budget| started.elapsed() >= budget)
                {
                    SearchPhase::MaxIterationsExceeded(BudgetExhausted::TimeBudget)
                } else {
                    state.iteration += 1;
                    let stream = if search.common_random_numbers {
                        0
                    } else {
                        state.iteration
                    };
                    let seed = derive_seed(config.seed, repetition, stream);
                    SearchPhase::Evaluate(builder.build(
                        state.fraction,
                        Statistic::MaxDrawdown,
                        seed,
                    ))
                }
            }
            SearchPhase::Evaluate(distribution) => {
                let measured = tail_risk(&distribution, config.tail_percentage);
                state.tail_risk = Some(measured);
                state.trace.push(SearchIteration {
                    iteration: state.iteration,
                    lower_bound: state.lower,
                    upper_bound: state.upper,
                    fraction: state.fraction,
                    tail_risk: measured,
                });
                debug!(
                    repetition,
                    iteration = state.iteration,
                    fraction = state.fraction,
                    tail_risk = measured,
                    lower = state.lower,
                    upper = state.upper,
                    "evaluated safe-f candidate"
                );
                SearchPhase::Adjust {
                    tail_risk: measured,
                }
            }
            SearchPhase::Adjust { tail_risk } => {
                state.adjust(tail_risk, config.drawdown_tolerance, search)
            }
            SearchPhase::Converged(termination) => {
                let solution = SafeFSolution {
                    safe_f: state.fraction,
                    tail_risk: state.tail_risk.unwrap_or(0.0),
                    termination,
                    iterations: state.trace,
                };
                if termination == SearchTermination::LowerBoundBreached {
                    warn!(
                        repetition,
                        safe_f = solution.safe_f,
                        tail_risk = solution.tail_risk,
                        "lowest permitted fraction already breaches drawdown tolerance"
                    );
                } else {
                    info!(
                        repetition,
                        safe_f = solution.safe_f,
                        tail_risk = solution.tail_risk,
                        iterations = solution.iterations.len(),
                        ?termination,
                        "safe-f search converged"
                    );
                }
                return Ok(solution);
            }
            SearchPhase::MaxIterationsExceeded(reason) => {
                return Err(NormalizationError::ConvergenceFailure {
                    repetition,
                    iterations: state.iteration,
                    last_fraction: state.fraction,
                    last_tail_risk: state.tail_risk,
                    reason,
                });
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::trades::TradeSet;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    fn volatile_trades() -> TradeSet {
        TradeSet::new(vec![0.02, -0.02, 0.015, -0.015, 0.01, -0.01, 0.005, 0.0])
            .expect("valid trades")
    }

    fn test_config() -> SimulationConfig {
        SimulationConfig {
            sequence_length: 252,
            number_equity_in_cdf: 500,
            seed: 7,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn flat_trades_stop_at_upper_bound() {
        let trades = TradeSet::new(vec![0.0; 25]).expect("valid trades");
        let config = test_config();
        let search = SearchConfig::default();
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let solution = solve_safe_f(&builder, &config, &search, 0).expect("must solve");
        assert_eq!(solution.termination, SearchTermination::UpperBoundSafe);
        assert_eq!(solution.safe_f, search.max_fraction);
        assert_eq!(solution.tail_risk, 0.0);
        assert_eq!(solution.iterations.len(), 1);
    }

    #[test]
    fn bisection_lands_within_accuracy_of_tolerance() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig::default();
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let solution = solve_safe_f(&builder, &config, &search, 0).expect("must solve");
        assert!(matches!(
            solution.termination,
            SearchTermination::WithinAccuracy | SearchTermination::StepBelowMinimum
        ));
        assert!(solution.safe_f > search.min_fraction);
        assert!(solution.safe_f < search.max_fraction);
        assert_close(
            solution.tail_risk,
            config.drawdown_tolerance,
            search.accuracy,
        );

        // Upper probe first, then the bracket midpoint.
        assert_eq!(solution.iterations[0].fraction, 2.0);
        assert_eq!(solution.iterations[1].fraction, 1.0);
        for step in &solution.iterations {
            assert!(step.lower_bound <= step.fraction && step.fraction <= step.upper_bound);
        }

        let remeasured = tail_risk(
            &builder.build(
                solution.safe_f,
                Statistic::MaxDrawdown,
                derive_seed(config.seed, 0, 0),
            ),
            config.tail_percentage,
        );
        assert_eq!(remeasured, solution.tail_risk);
    }

    #[test]
    fn proportional_strategy_converges() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig {
            strategy: SearchStrategy::Proportional,
            ..SearchConfig::default()
        };
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let solution = solve_safe_f(&builder, &config, &search, 0).expect("must solve");
        assert_eq!(solution.termination, SearchTermination::WithinAccuracy);
        assert_close(
            solution.tail_risk,
            config.drawdown_tolerance,
            search.accuracy,
        );
        assert_eq!(solution.iterations[1].fraction, search.initial_fraction);
    }

    #[test]
    fn fresh_draws_keep_fraction_inside_bracket() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig {
            common_random_numbers: false,
            ..SearchConfig::default()
        };
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let solution = solve_safe_f(&builder, &config, &search, 0).expect("must solve");
        assert!((search.min_fraction..=search.max_fraction).contains(&solution.safe_f));
        assert!(solution.tail_risk <= config.drawdown_tolerance + search.accuracy);
    }

    #[test]
    fn breached_lower_bound_is_reported_not_searched() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig {
            min_fraction: 1.5,
            max_fraction: 2.0,
            ..SearchConfig::default()
        };
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let solution = solve_safe_f(&builder, &config, &search, 0).expect("must return result");
        assert_eq!(solution.termination, SearchTermination::LowerBoundBreached);
        assert_eq!(solution.safe_f, 1.5);
        assert!(solution.tail_risk > config.drawdown_tolerance);
        assert_eq!(solution.iterations.len(), 2);
    }

    #[test]
    fn iteration_limit_surfaces_convergence_failure() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig {
            max_iterations: 1,
            ..SearchConfig::default()
        };
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let err = solve_safe_f(&builder, &config, &search, 3).expect_err("must fail");
        assert_eq!(err.phase(), "safe-f search");
        match err {
            NormalizationError::ConvergenceFailure {
                repetition,
                iterations,
                last_tail_risk,
                reason,
                ..
            } => {
                assert_eq!(repetition, 3);
                assert_eq!(iterations, 1);
                assert!(last_tail_risk.is_some());
                assert_eq!(reason, BudgetExhausted::IterationLimit);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn exhausted_time_budget_stops_before_simulating() {
        let trades = volatile_trades();
        let config = test_config();
        let search = SearchConfig {
            time_budget: Some(Duration::ZERO),
            ..SearchConfig::default()
        };
        let builder = DistributionBuilder::new(&trades, &config).expect("builder");

        let err = solve_safe_f(&builder, &config, &search, 0).expect_err("must fail");
        assert!(matches!(
            err,
            NormalizationError::ConvergenceFailure {
                iterations: 0,
                reason: BudgetExhausted::TimeBudget,
                ..
            }
        ));
    }
}
