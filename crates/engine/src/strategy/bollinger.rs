use ta::Reset;

use super::{Signal, Strategy};
use crate::error::EngineResult;
use crate::indicators::{Bollinger, BollingerOutput};
use crate::types::{MarketBar, ParamSet};

/// Band re-entry strategy on Bollinger bands.
///
/// BUY when the close climbs back inside from below the lower band, SELL
/// when it falls back inside from above the upper band. Signals come from
/// the crosses alone; the engine ignores a BUY while long and a SELL while
/// flat.
#[derive(Debug, Clone)]
pub struct BollingerBreakout {
    period: usize,
    multiplier: f64,
    bands: Bollinger,
    prev: Option<(f64, BollingerOutput)>,
}

impl BollingerBreakout {
    pub fn new(period: usize, multiplier: f64) -> EngineResult<Self> {
        Ok(Self {
            period,
            multiplier,
            bands: Bollinger::new(period, multiplier)?,
            prev: None,
        })
    }
}

impl Strategy for BollingerBreakout {
    fn name(&self) -> &str {
        "Bollinger Breakout"
    }

    fn description(&self) -> &str {
        "Buys when price re-enters the bands from below and sells when it re-enters from above"
    }

    fn params(&self) -> ParamSet {
        ParamSet::from([
            ("period".to_string(), self.period as f64),
            ("multiplier".to_string(), self.multiplier),
        ])
    }

    fn initialize(&mut self) {
        self.bands.reset();
        self.prev = None;
    }

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal> {
        let close = bar.close_f64();
        let band = self.bands.update(close);
        if !self.bands.is_ready() {
            return Ok(Signal::Hold);
        }

        let Some((prev_close, prev_band)) = self.prev.replace((close, band)) else {
            return Ok(Signal::Hold);
        };

        if prev_close < prev_band.lower && close > band.lower {
            Ok(Signal::Buy)
        } else if prev_close > prev_band.upper && close < band.upper {
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

    fn run(strategy: &mut BollingerBreakout, prices: &[f64]) -> Vec<Signal> {
        make_bars(prices)
            .iter()
            .map(|b| strategy.on_bar(b).unwrap())
            .collect()
    }

    #[test]
    fn test_flat_series_never_trades() {
        let mut strategy = BollingerBreakout::new(3, 2.0).unwrap();
        let out = run(&mut strategy, &[10.0; 10]);
        // close equals both bands every bar, so it is never strictly outside
        assert!(out.iter().all(|s| *s == Signal::Hold));
    }

    #[test]
    fn test_rebound_from_lower_band_buys_then_exit_sells() {
        let mut strategy = BollingerBreakout::new(3, 1.0).unwrap();
        // bar 3: 7 sits below its lower band; bar 4 recovers inside
        // bar 6: 14 pierces the upper band; bar 7 falls back inside
        let out = run(&mut strategy, &[10.0, 10.0, 10.0, 7.0, 9.0, 10.0, 14.0, 12.0]);
        assert_eq!(out[4], Signal::Buy);
        assert_eq!(out[7], Signal::Sell);
        let trades = out.iter().filter(|s| **s != Signal::Hold).count();
        assert_eq!(trades, 2);
    }

    #[test]
    fn test_second_rebound_buys_again_without_a_sell() {
        let mut strategy = BollingerBreakout::new(3, 1.0).unwrap();
        // bar 4 and bar 8 both recover from below the lower band
        let out = run(&mut strategy, &[10.0, 10.0, 10.0, 7.0, 9.0, 9.0, 9.0, 6.0, 8.0]);
        assert_eq!(out[4], Signal::Buy);
        assert_eq!(out[8], Signal::Buy);
        assert!(!out.contains(&Signal::Sell));
    }

    #[test]
    fn test_initialize_resets_band_state() {
        let mut strategy = BollingerBreakout::new(3, 1.0).unwrap();
        let prices = [10.0, 10.0, 10.0, 7.0, 9.0];
        let first = run(&mut strategy, &prices);
        strategy.initialize();
        assert_eq!(run(&mut strategy, &prices), first);
    }
}
