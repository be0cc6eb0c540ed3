use std::collections::VecDeque;

use super::{Signal, Strategy};
use crate::error::{EngineError, EngineResult};
use crate::types::{MarketBar, ParamSet};

/// Rate-of-change breakout over a fixed lookback.
///
/// Momentum is `(price_now / price_lookback_ago - 1) * 100`. BUY above
/// `threshold`, SELL below `-threshold`.
#[derive(Debug, Clone)]
pub struct MomentumStrategy {
    lookback_period: usize,
    threshold: f64,
    window: VecDeque<f64>,
}

impl MomentumStrategy {
    pub fn new(lookback_period: usize, threshold: f64) -> EngineResult<Self> {
        if lookback_period == 0 {
            return Err(EngineError::InvalidParameter(
                "momentum lookback must be at least 1".to_string(),
            ));
        }
        if !(threshold >= 0.0 && threshold.is_finite()) {
            return Err(EngineError::InvalidParameter(format!(
                "momentum threshold must be non-negative, got {threshold}"
            )));
        }

        Ok(Self {
            lookback_period,
            threshold,
            window: VecDeque::with_capacity(lookback_period + 1),
        })
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "Momentum"
    }

    fn description(&self) -> &str {
        "Buys on strong positive rate of change and sells on strong negative rate of change"
    }

    fn params(&self) -> ParamSet {
        ParamSet::from([
            ("lookbackPeriod".to_string(), self.lookback_period as f64),
            ("threshold".to_string(), self.threshold),
        ])
    }

    fn initialize(&mut self) {
        self.window.clear();
    }

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal> {
        self.window.push_back(bar.close_f64());
        if self.window.len() > self.lookback_period + 1 {
            self.window.pop_front();
        }
        if self.window.len() <= self.lookback_period {
            return Ok(Signal::Hold);
        }

        let (Some(&past), Some(&current)) = (self.window.front(), self.window.back()) else {
            return Ok(Signal::Hold);
        };
        if past == 0.0 {
            return Ok(Signal::Hold);
        }

        let momentum = (current / past - 1.0) * 100.0;
        if momentum > self.threshold {
            Ok(Signal::Buy)
        } else if momentum < -self.threshold {
            Ok(Signal::Sell)
        } else {
            Ok(Signal::Hold)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::make_bars;

    fn run(strategy: &mut MomentumStrategy, prices: &[f64]) -> Vec<Signal> {
        make_bars(prices)
            .iter()
            .map(|b| strategy.on_bar(b).unwrap())
            .collect()
    }

    #[test]
    fn test_holds_until_lookback_filled() {
        let mut strategy = MomentumStrategy::new(3, 5.0).unwrap();
        let out = run(&mut strategy, &[10.0, 20.0, 30.0]);
        assert!(out.iter().all(|s| *s == Signal::Hold));
    }

    #[test]
    fn test_compares_against_price_lookback_bars_ago() {
        let mut strategy = MomentumStrategy::new(2, 5.0).unwrap();
        // bar 2: 10.6 vs 10.0 -> +6%; bar 3: 10.0 vs 10.3 -> -2.9%; bar 4: 9.0 vs 10.6 -> -15%
        let out = run(&mut strategy, &[10.0, 10.3, 10.6, 10.0, 9.0]);
        assert_eq!(
            out,
            vec![Signal::Hold, Signal::Hold, Signal::Buy, Signal::Hold, Signal::Sell]
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut strategy = MomentumStrategy::new(1, 0.0).unwrap();
        let out = run(&mut strategy, &[100.0, 100.0, 101.0]);
        assert_eq!(out, vec![Signal::Hold, Signal::Hold, Signal::Buy]);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(MomentumStrategy::new(0, 5.0).is_err());
        assert!(MomentumStrategy::new(5, -1.0).is_err());
    }
}
