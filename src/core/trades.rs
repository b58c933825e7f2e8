use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Normal};

use super::error::ConfigError;

/// Immutable daily fractional returns (0.01 = +1%), oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSet {
    returns: Arc<[f64]>,
}

impl TradeSet {
    pub fn new(returns: Vec<f64>) -> Result<Self, ConfigError> {
        if returns.is_empty() {
            return Err(ConfigError::EmptyTrades);
        }
        if let Some(index) = returns.iter().position(|r| !r.is_finite()) {
            return Err(ConfigError::NonFiniteTrade { index });
        }
        Ok(Self {
            returns: returns.into(),
        })
    }

    pub fn returns(&self) -> &[f64] {
        &self.returns
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }
}

/// Draws `number_trades` returns from a normal distribution.
pub fn generate_trade_list(
    number_trades: usize,
    mean_gain: f64,
    std_dev: f64,
    seed: u64,
) -> Result<TradeSet, ConfigError> {
    if number_trades == 0 {
        return Err(ConfigError::EmptyTrades);
    }
    if !mean_gain.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
        return Err(ConfigError::SyntheticDistribution(format!(
            "mean {mean_gain} and standard deviation {std_dev} must be finite, deviation >= 0"
        )));
    }
    let normal = Normal::new(mean_gain, std_dev)
        .map_err(|e| ConfigError::SyntheticDistribution(e.to_string()))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let returns = (0..number_trades).map(|_| normal.sample(&mut rng)).collect();
    TradeSet::new(returns)
}
