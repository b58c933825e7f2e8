use rand::distributions::{Distribution as _, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::error::ConfigError;
use super::trades::TradeSet;
use super::types::{Car25Estimate, SimulationConfig, Statistic, TradeWeighting};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

const CAR25_PERCENTILE: f64 = 25.0;

/// Bootstrap sampler over a fixed trade set.
#[derive(Debug, Clone)]
pub struct Resampler<'a> {
    trades: &'a [f64],
    weights: Option<WeightedIndex<f64>>,
}

impl<'a> Resampler<'a> {
    pub fn new(trades: &'a TradeSet, weighting: TradeWeighting) -> Result<Self, ConfigError> {
        let weights = match weighting {
            TradeWeighting::Uniform => None,
            TradeWeighting::Triangular => Some(
                WeightedIndex::new((1..=trades.len()).map(|w| w as f64))
                    .map_err(|_| ConfigError::EmptyTrades)?,
            ),
        };
        Ok(Self {
            trades: trades.returns(),
            weights,
        })
    }

    pub fn draw_one<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let index = match &self.weights {
            Some(weights) => weights.sample(rng),
            None => rng.gen_range(0..self.trades.len()),
        };
        self.trades[index]
    }

    /// Draws `length` trades independently, with replacement.
    pub fn draw<R: Rng + ?Sized>(&self, length: usize, rng: &mut R) -> Vec<f64> {
        (0..length).map(|_| self.draw_one(&mut *rng)).collect()
    }
}

/// Equity marked after every trade, with the drawdown from the running peak.
#[derive(Debug, Clone, PartialEq)]
pub struct EquityPath {
    pub equity: Vec<f64>,
    pub drawdown: Vec<f64>,
}

impl EquityPath {
    pub fn max_drawdown(&self) -> f64 {
        self.drawdown.iter().copied().fold(0.0, f64::max)
    }

    pub fn terminal_equity(&self) -> f64 {
        self.equity.last().copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSummary {
    pub max_drawdown: f64,
    pub terminal_equity: f64,
}

pub fn simulate_equity(returns: &[f64], fraction: f64, initial_capital: f64) -> EquityPath {
    let mut equity = Vec::with_capacity(returns.len() + 1);
    let mut drawdown = Vec::with_capacity(returns.len() + 1);

    let mut current = initial_capital;
    let mut peak = initial_capital;
    equity.push(current);
    drawdown.push(drawdown_from_peak(peak, current));

    for &trade in returns {
        current = step_equity(current, fraction, trade);
        peak = peak.max(current);
        equity.push(current);
        drawdown.push(drawdown_from_peak(peak, current));
    }

    EquityPath { equity, drawdown }
}

/// Same update rule as [`simulate_equity`] without keeping the path.
pub fn summarize_path<I>(returns: I, fraction: f64, initial_capital: f64) -> PathSummary
where
    I: IntoIterator<Item = f64>,
{
    let mut current = initial_capital;
    let mut peak = initial_capital;
    let mut max_drawdown = 0.0_f64;

    for trade in returns {
        current = step_equity(current, fraction, trade);
        peak = peak.max(current);
        max_drawdown = max_drawdown.max(drawdown_from_peak(peak, current));
    }

    PathSummary {
        max_drawdown,
        terminal_equity: current,
    }
}

// Ruin is absorbing: once equity hits zero it stays there. Growth saturates
// at f64::MAX so drawdowns stay finite.
fn step_equity(equity: f64, fraction: f64, trade: f64) -> f64 {
    let growth = 1.0 + fraction * trade;
    if equity <= 0.0 || growth <= 0.0 {
        0.0
    } else {
        (equity * growth).min(f64::MAX)
    }
}

fn drawdown_from_peak(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    (peak - equity) / peak
}

/// Sorted sample of simulated outcomes, read as an empirical CDF.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    sorted: Vec<f64>,
}

impl Distribution {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.sort_by(|a, b| a.total_cmp(b));
        Self { sorted: samples }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.sorted
    }

    /// Rank-interpolated percentile, `p` in [0, 100]. Never leaves the sample range.
    pub fn percentile(&self, p: f64) -> f64 {
        let values = &self.sorted;
        if values.is_empty() {
            return 0.0;
        }

        let n = values.len();
        if n == 1 {
            return values[0];
        }

        let rank = (p.clamp(0.0, 100.0) / 100.0) * (n as f64 - 1.0);
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;

        if lower == upper {
            values[lower]
        } else {
            let w = rank - lower as f64;
            values[lower] + (values[upper] - values[lower]) * w
        }
    }
}

/// Drawdown at the `(100 - tail_percentage)`th percentile.
pub fn tail_risk(distribution: &Distribution, tail_percentage: f64) -> f64 {
    distribution.percentile(100.0 - tail_percentage)
}

/// Runs independent resample-and-simulate trials at one fraction.
#[derive(Debug, Clone)]
pub struct DistributionBuilder<'a> {
    resampler: Resampler<'a>,
    sequence_length: usize,
    initial_capital: f64,
    trials: usize,
    parallel: bool,
}

impl<'a> DistributionBuilder<'a> {
    pub fn new(trades: &'a TradeSet, config: &SimulationConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            resampler: Resampler::new(trades, config.weighting)?,
            sequence_length: config.sequence_length,
            initial_capital: config.initial_capital,
            trials: config.number_equity_in_cdf,
            parallel: config.parallel,
        })
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn build(&self, fraction: f64, statistic: Statistic, stream_seed: u64) -> Distribution {
        let run_trial = |trial_id: usize| {
            let mut rng = StdRng::seed_from_u64(trial_seed(stream_seed, trial_id));
            let summary = self.run_trial(fraction, &mut rng);
            match statistic {
                Statistic::MaxDrawdown => summary.max_drawdown,
                Statistic::TerminalEquity => summary.terminal_equity,
            }
        };

        let samples: Vec<f64> = if self.parallel {
            (0..self.trials).into_par_iter().map(run_trial).collect()
        } else {
            (0..self.trials).map(run_trial).collect()
        };

        Distribution::from_samples(samples)
    }

    fn run_trial(&self, fraction: f64, rng: &mut StdRng) -> PathSummary {
        summarize_path(
            (0..self.sequence_length).map(|_| self.resampler.draw_one(&mut *rng)),
            fraction,
            self.initial_capital,
        )
    }
}

/// Compound annual growth over `sequence_length` daily trades; ruin is -100%.
pub fn annualized_return(terminal_equity: f64, initial_capital: f64, sequence_length: usize) -> f64 {
    if terminal_equity <= 0.0 {
        return -1.0;
    }
    (terminal_equity / initial_capital).powf(TRADING_DAYS_PER_YEAR / sequence_length as f64) - 1.0
}

pub fn estimate_car25(
    builder: &DistributionBuilder<'_>,
    safe_f: f64,
    stream_seed: u64,
) -> Car25Estimate {
    let distribution = builder.build(safe_f, Statistic::TerminalEquity, stream_seed);
    let terminal_wealth_25 = distribution.percentile(CAR25_PERCENTILE);
    Car25Estimate {
        terminal_wealth_25,
        car25: annualized_return(
            terminal_wealth_25,
            builder.initial_capital(),
            builder.sequence_length(),
        ),
    }
}

pub(crate) fn derive_seed(base_seed: u64, stream: u32, index: u32) -> u64 {
    let mixed = base_seed ^ ((stream as u64) << 32) ^ index as u64;
    splitmix64(mixed)
}

// The stream seed is hashed first so nearby stream seeds never share trials.
fn trial_seed(stream_seed: u64, trial: usize) -> u64 {
    derive_seed(splitmix64(stream_seed), 0, trial as u32)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}
