use rayon::prelude::*;
use tracing::{info, warn};

use super::engine::{DistributionBuilder, derive_seed, estimate_car25};
use super::error::{ConfigError, NormalizationError};
use super::solver::solve_safe_f;
use super::trades::TradeSet;
use super::types::{NormalizationResult, RepetitionResult, SearchConfig, SimulationConfig};

const CAR25_STREAM: u32 = u32::MAX;

/// Estimates `(safe_f, car25)` for `trades` with default search settings and seed.
pub fn risk_normalization(
    trades: &[f64],
    sequence_length: usize,
    initial_capital: f64,
    tail_percentage: f64,
    drawdown_tolerance: f64,
    number_equity_in_cdf: usize,
) -> Result<(f64, f64), NormalizationError> {
    let trades = TradeSet::new(trades.to_vec())?;
    let config = SimulationConfig {
        sequence_length,
        initial_capital,
        tail_percentage,
        drawdown_tolerance,
        number_equity_in_cdf,
        ..SimulationConfig::default()
    };
    let result = run_risk_normalization(&trades, &config, &SearchConfig::default())?;
    Ok((result.safe_f, result.car25))
}

pub fn run_risk_normalization(
    trades: &TradeSet,
    config: &SimulationConfig,
    search: &SearchConfig,
) -> Result<NormalizationResult, NormalizationError> {
    validate_config(config, search)?;
    let builder = DistributionBuilder::new(trades, config)?;

    let repetitions = config.number_repetitions as u32;
    let repetitions: Vec<RepetitionResult> = if config.parallel {
        (0..repetitions)
            .into_par_iter()
            .map(|repetition| run_repetition(&builder, config, search, repetition))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        (0..repetitions)
            .map(|repetition| run_repetition(&builder, config, search, repetition))
            .collect::<Result<Vec<_>, _>>()?
    };

    let first = &repetitions[0];
    Ok(NormalizationResult {
        safe_f: first.safe_f,
        car25: first.car25,
        repetitions,
    })
}

fn run_repetition(
    builder: &DistributionBuilder<'_>,
    config: &SimulationConfig,
    search: &SearchConfig,
    repetition: u32,
) -> Result<RepetitionResult, NormalizationError> {
    let solution = solve_safe_f(builder, config, search, repetition)?;
    let estimate = estimate_car25(
        builder,
        solution.safe_f,
        derive_seed(config.seed, repetition, CAR25_STREAM),
    );

    if estimate.terminal_wealth_25 <= 0.0 {
        warn!(
            repetition,
            safe_f = solution.safe_f,
            "lower quartile of terminal equity is ruined; CAR25 reported as -100%"
        );
    }
    info!(
        repetition,
        safe_f = solution.safe_f,
        terminal_wealth_25 = estimate.terminal_wealth_25,
        car25 = estimate.car25,
        "repetition complete"
    );

    Ok(RepetitionResult {
        repetition,
        safe_f: solution.safe_f,
        car25: estimate.car25,
        tail_risk: solution.tail_risk,
        terminal_wealth_25: estimate.terminal_wealth_25,
        termination: solution.termination,
        iterations: solution.iterations,
    })
}

pub fn validate_config(config: &SimulationConfig, search: &SearchConfig) -> Result<(), ConfigError> {
    if config.sequence_length == 0 {
        return Err(ConfigError::SequenceLength);
    }
    if !config.initial_capital.is_finite() || config.initial_capital <= 0.0 {
        return Err(ConfigError::InitialCapital(config.initial_capital));
    }
    if !(config.tail_percentage > 0.0 && config.tail_percentage < 100.0) {
        return Err(ConfigError::TailPercentage(config.tail_percentage));
    }
    if !(config.drawdown_tolerance > 0.0 && config.drawdown_tolerance <= 1.0) {
        return Err(ConfigError::DrawdownTolerance(config.drawdown_tolerance));
    }
    if config.number_equity_in_cdf == 0 {
        return Err(ConfigError::SampleCount);
    }
    if config.number_repetitions == 0 || config.number_repetitions > u32::MAX as usize {
        return Err(ConfigError::Repetitions);
    }
    if !search.min_fraction.is_finite()
        || !search.max_fraction.is_finite()
        || search.min_fraction < 0.0
        || search.max_fraction <= search.min_fraction
    {
        return Err(ConfigError::SearchBracket {
            min: search.min_fraction,
            max: search.max_fraction,
        });
    }
    if !(search.min_fraction..=search.max_fraction).contains(&search.initial_fraction) {
        return Err(ConfigError::InitialFraction(search.initial_fraction));
    }
    if !search.accuracy.is_finite() || search.accuracy <= 0.0 {
        return Err(ConfigError::Accuracy(search.accuracy));
    }
    if !search.min_step.is_finite() || search.min_step <= 0.0 {
        return Err(ConfigError::MinStep(search.min_step));
    }
    if search.max_iterations == 0 {
        return Err(ConfigError::MaxIterations);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SearchTermination, generate_trade_list};

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

    fn quick_config() -> SimulationConfig {
        SimulationConfig {
            sequence_length: 252,
            number_equity_in_cdf: 400,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn all_flat_trades_give_upper_bound_and_zero_car25() {
        let (safe_f, car25) =
            risk_normalization(&[0.0; 50], 504, 100_000.0, 5.0, 0.10, 200).expect("must solve");
        assert_eq!(safe_f, SearchConfig::default().max_fraction);
        assert_eq!(car25, 0.0);
    }

    #[test]
    fn default_entry_point_is_reproducible() {
        let trades = generate_trade_list(300, 0.0005, 0.012, 17).expect("valid distribution");
        let first = risk_normalization(trades.returns(), 252, 100_000.0, 5.0, 0.10, 300)
            .expect("must solve");
        let second = risk_normalization(trades.returns(), 252, 100_000.0, 5.0, 0.10, 300)
            .expect("must solve");
        assert_eq!(first, second);
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let trades = volatile_trades();
        let mut config = quick_config();
        config.number_repetitions = 3;
        let search = SearchConfig::default();

        let parallel = run_risk_normalization(&trades, &config, &search).expect("must solve");
        config.parallel = false;
        let sequential = run_risk_normalization(&trades, &config, &search).expect("must solve");

        assert_eq!(parallel.repetitions.len(), 3);
        for (a, b) in parallel.repetitions.iter().zip(&sequential.repetitions) {
            assert_eq!(a.repetition, b.repetition);
            assert_eq!(a.safe_f, b.safe_f);
            assert_eq!(a.car25, b.car25);
            assert_eq!(a.terminal_wealth_25, b.terminal_wealth_25);
        }
    }

    #[test]
    fn repetitions_are_independent_and_exposed() {
        let trades = volatile_trades();
        let mut config = quick_config();
        config.number_repetitions = 4;
        let search = SearchConfig::default();

        let result = run_risk_normalization(&trades, &config, &search).expect("must solve");
        assert_eq!(result.repetitions.len(), 4);
        assert_eq!(result.safe_f, result.repetitions[0].safe_f);
        assert_eq!(result.car25, result.repetitions[0].car25);

        let distinct = result
            .repetitions
            .iter()
            .skip(1)
            .any(|r| r.safe_f != result.repetitions[0].safe_f);
        assert!(distinct, "repetitions should use independent draws");

        for rep in &result.repetitions {
            assert!((search.min_fraction..=search.max_fraction).contains(&rep.safe_f));
            assert_close(rep.tail_risk, config.drawdown_tolerance, search.accuracy);
            assert!(rep.car25 > -1.0);
            assert!(!rep.iterations.is_empty());
        }
    }

    #[test]
    fn total_loss_trades_report_degenerate_outcome() {
        let trades = TradeSet::new(vec![-1.0, 0.01]).expect("valid trades");
        let config = SimulationConfig {
            sequence_length: 20,
            number_equity_in_cdf: 200,
            ..SimulationConfig::default()
        };
        let search = SearchConfig {
            min_fraction: 1.0,
            max_fraction: 2.0,
            ..SearchConfig::default()
        };

        let result = run_risk_normalization(&trades, &config, &search).expect("must return");
        let rep = &result.repetitions[0];
        assert_eq!(rep.termination, SearchTermination::LowerBoundBreached);
        assert_eq!(rep.safe_f, 1.0);
        assert_eq!(rep.terminal_wealth_25, 0.0);
        assert_eq!(rep.car25, -1.0);
    }

    #[test]
    fn rejects_invalid_configuration_eagerly() {
        let search = SearchConfig::default();
        let cases = [
            (
                SimulationConfig {
                    sequence_length: 0,
                    ..SimulationConfig::default()
                },
                ConfigError::SequenceLength,
            ),
            (
                SimulationConfig {
                    initial_capital: 0.0,
                    ..SimulationConfig::default()
                },
                ConfigError::InitialCapital(0.0),
            ),
            (
                SimulationConfig {
                    tail_percentage: 100.0,
                    ..SimulationConfig::default()
                },
                ConfigError::TailPercentage(100.0),
            ),
            (
                SimulationConfig {
                    drawdown_tolerance: 1.5,
                    ..SimulationConfig::default()
                },
                ConfigError::DrawdownTolerance(1.5),
            ),
            (
                SimulationConfig {
                    number_equity_in_cdf: 0,
                    ..SimulationConfig::default()
                },
                ConfigError::SampleCount,
            ),
            (
                SimulationConfig {
                    number_repetitions: 0,
                    ..SimulationConfig::default()
                },
                ConfigError::Repetitions,
            ),
        ];

        for (config, expected) in cases {
            assert_eq!(validate_config(&config, &search), Err(expected));
        }

        let config = SimulationConfig::default();
        let bad_bracket = SearchConfig {
            min_fraction: 2.0,
            max_fraction: 1.0,
            ..SearchConfig::default()
        };
        assert!(matches!(
            validate_config(&config, &bad_bracket),
            Err(ConfigError::SearchBracket { .. })
        ));
        let bad_accuracy = SearchConfig {
            accuracy: 0.0,
            ..SearchConfig::default()
        };
        assert_eq!(
            validate_config(&config, &bad_accuracy),
            Err(ConfigError::Accuracy(0.0))
        );
    }

    #[test]
    fn empty_trades_fail_as_configuration_error() {
        let err = risk_normalization(&[], 504, 100_000.0, 5.0, 0.10, 1000).expect_err("must fail");
        assert_eq!(err, NormalizationError::Configuration(ConfigError::EmptyTrades));
        assert_eq!(err.phase(), "configuration");
    }
}
