use ta::Reset;

use super::{Signal, Strategy};
use crate::error::{EngineError, EngineResult};
use crate::indicators::Rsi;
use crate::types::{MarketBar, ParamSet};

/// Mean reversion on RSI levels.
///
/// BUY while RSI is below the oversold line, SELL while it is above the
/// overbought line. The first reading is always a HOLD.
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    period: usize,
    overbought: f64,
    oversold: f64,
    rsi: Rsi,
    readings: usize,
}

impl RsiStrategy {
    pub fn new(period: usize, overbought: f64, oversold: f64) -> EngineResult<Self> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(overbought) || !in_range(oversold) || oversold >= overbought {
            return Err(EngineError::InvalidParameter(format!(
                "RSI thresholds must satisfy 0 <= oversold < overbought <= 100, got {oversold}/{overbought}"
            )));
        }

        Ok(Self {
            period,
            overbought,
            oversold,
            rsi: Rsi::new(period)?,
            readings: 0,
        })
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "RSI"
    }

    fn description(&self) -> &str {
        "Buys when RSI drops below the oversold level and sells when it rises above the overbought level"
    }

    fn params(&self) -> ParamSet {
        ParamSet::from([
            ("period".to_string(), self.period as f64),
            ("overbought".to_string(), self.overbought),
            ("oversold".to_string(), self.oversold),
        ])
    }

    fn initialize(&mut self) {
        self.rsi.reset();
        self.readings = 0;
    }

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal> {
        let current = self.rsi.update(bar.close_f64());
        self.readings += 1;
        if self.readings < 2 {
            return Ok(Signal::Hold);
        }

        if current < self.oversold {
            Ok(Signal::Buy)
        } else if current > self.overbought {
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

    #[test]
    fn test_falling_prices_signal_oversold() {
        let mut strategy = RsiStrategy::new(3, 70.0, 30.0).unwrap();
        // RSI stays neutral for 3 bars, then the window is all losses -> 0
        let out: Vec<Signal> = make_bars(&[10.0, 9.0, 8.0, 7.0, 6.0])
            .iter()
            .map(|b| strategy.on_bar(b).unwrap())
            .collect();
        assert_eq!(
            out,
            vec![Signal::Hold, Signal::Hold, Signal::Hold, Signal::Buy, Signal::Buy]
        );
    }

    #[test]
    fn test_rising_prices_signal_overbought() {
        let mut strategy = RsiStrategy::new(3, 70.0, 30.0).unwrap();
        let out: Vec<Signal> = make_bars(&[10.0, 11.0, 12.0, 13.0])
            .iter()
            .map(|b| strategy.on_bar(b).unwrap())
            .collect();
        assert_eq!(out[3], Signal::Sell);
    }

    #[test]
    fn test_single_bar_holds() {
        let mut strategy = RsiStrategy::new(14, 70.0, 30.0).unwrap();
        let bar = &make_bars(&[42.0])[0];
        assert_eq!(strategy.on_bar(bar).unwrap(), Signal::Hold);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        assert!(RsiStrategy::new(14, 30.0, 70.0).is_err());
        assert!(RsiStrategy::new(14, 120.0, 30.0).is_err());
    }
}
