//! Streaming indicator calculators
//!
//! Every indicator consumes one sample per call to `update` (or `ta::Next::next`)
//! and returns its value after incorporating that sample. `ta::Reset` clears all
//! state as if the indicator had just been constructed.

use std::collections::VecDeque;

use ta::indicators::StandardDeviation;
use ta::{Next, Period, Reset};

use crate::error::{EngineError, EngineResult};

fn check_period(name: &str, period: usize) -> EngineResult<()> {
    if period == 0 {
        return Err(EngineError::InvalidParameter(format!(
            "{name} period must be at least 1"
        )));
    }
    Ok(())
}

// ============================================================================
// Simple moving average
// ============================================================================

/// Arithmetic mean of the most recent `period` samples.
///
/// Before `period` samples have been seen, the mean of whatever is available
/// is returned, so the first update returns its input unchanged.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
}

impl Sma {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("SMA", period)?;
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period + 1),
        })
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        self.value()
    }

    /// Current mean, 0 before the first sample
    pub fn value(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.period
    }
}

impl Next<f64> for Sma {
    type Output = f64;

    fn next(&mut self, input: f64) -> f64 {
        self.update(input)
    }
}

impl Reset for Sma {
    fn reset(&mut self) {
        self.window.clear();
    }
}

impl Period for Sma {
    fn period(&self) -> usize {
        self.period
    }
}

// ============================================================================
// Exponential moving average
// ============================================================================

/// EMA with smoothing factor 2 / (period + 1), seeded with the first sample
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: f64,
    current: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("EMA", period)?;
        Ok(Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            current: None,
        })
    }

    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.current {
            None => value,
            Some(current) => self.alpha * value + (1.0 - self.alpha) * current,
        };
        self.current = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.current.unwrap_or(0.0)
    }
}

impl Next<f64> for Ema {
    type Output = f64;

    fn next(&mut self, input: f64) -> f64 {
        self.update(input)
    }
}

impl Reset for Ema {
    fn reset(&mut self) {
        self.current = None;
    }
}

impl Period for Ema {
    fn period(&self) -> usize {
        self.period
    }
}

// ============================================================================
// Relative strength index
// ============================================================================

/// Neutral reading reported until the gain/loss window is full
pub const RSI_NEUTRAL: f64 = 50.0;

/// RSI over simple averages of the last `period` gains and losses
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    gains: VecDeque<f64>,
    losses: VecDeque<f64>,
    prev: Option<f64>,
}

impl Rsi {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("RSI", period)?;
        Ok(Self {
            period,
            gains: VecDeque::with_capacity(period + 1),
            losses: VecDeque::with_capacity(period + 1),
            prev: None,
        })
    }

    pub fn update(&mut self, value: f64) -> f64 {
        let Some(prev) = self.prev.replace(value) else {
            return RSI_NEUTRAL;
        };

        let change = value - prev;
        self.gains.push_back(change.max(0.0));
        self.losses.push_back((-change).max(0.0));
        if self.gains.len() > self.period {
            self.gains.pop_front();
            self.losses.pop_front();
        }

        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.gains.len() < self.period {
            return RSI_NEUTRAL;
        }

        let avg_gain = self.gains.iter().sum::<f64>() / self.period as f64;
        let avg_loss = self.losses.iter().sum::<f64>() / self.period as f64;
        if avg_loss == 0.0 {
            return 100.0;
        }

        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

impl Next<f64> for Rsi {
    type Output = f64;

    fn next(&mut self, input: f64) -> f64 {
        self.update(input)
    }
}

impl Reset for Rsi {
    fn reset(&mut self) {
        self.gains.clear();
        self.losses.clear();
        self.prev = None;
    }
}

impl Period for Rsi {
    fn period(&self) -> usize {
        self.period
    }
}

// ============================================================================
// Bollinger bands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA middle band with bounds at `multiplier` population standard deviations
#[derive(Debug, Clone)]
pub struct Bollinger {
    sma: Sma,
    sd: StandardDeviation,
    multiplier: f64,
    seen: usize,
}

impl Bollinger {
    pub fn new(period: usize, multiplier: f64) -> EngineResult<Self> {
        check_period("Bollinger", period)?;
        if !(multiplier > 0.0 && multiplier.is_finite()) {
            return Err(EngineError::InvalidParameter(format!(
                "Bollinger multiplier must be positive, got {multiplier}"
            )));
        }
        let sd = StandardDeviation::new(period).map_err(|_| {
            EngineError::InvalidParameter(format!("invalid Bollinger period {period}"))
        })?;

        Ok(Self {
            sma: Sma::new(period)?,
            sd,
            multiplier,
            seen: 0,
        })
    }

    pub fn update(&mut self, value: f64) -> BollingerOutput {
        self.seen += 1;
        let middle = self.sma.update(value);
        let deviation = self.sd.next(value);
        BollingerOutput {
            upper: middle + self.multiplier * deviation,
            middle,
            lower: middle - self.multiplier * deviation,
        }
    }

    /// True once a full window has been observed
    pub fn is_ready(&self) -> bool {
        self.seen >= self.sma.period()
    }
}

impl Next<f64> for Bollinger {
    type Output = BollingerOutput;

    fn next(&mut self, input: f64) -> BollingerOutput {
        self.update(input)
    }
}

impl Reset for Bollinger {
    fn reset(&mut self) {
        self.sma.reset();
        self.sd.reset();
        self.seen = 0;
    }
}

impl Period for Bollinger {
    fn period(&self) -> usize {
        self.sma.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_sma_bootstrap_and_eviction() {
        let mut sma = Sma::new(5).unwrap();
        assert_eq!(sma.update(7.5), 7.5);

        let mut sma = Sma::new(5).unwrap();
        let mut last = 0.0;
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            last = sma.update(v);
        }
        assert_eq!(last, 3.0);
        assert!(sma.is_full());

        // 6 evicts 1 -> mean of [2, 3, 4, 5, 6]
        assert_eq!(sma.update(6.0), 4.0);
    }

    #[test]
    fn test_sma_partial_window_is_mean_of_available() {
        let mut sma = Sma::new(4).unwrap();
        sma.update(10.0);
        assert_eq!(sma.update(20.0), 15.0);
        assert!(!sma.is_full());
    }

    #[test]
    fn test_ema_seeds_then_smooths() {
        let mut ema = Ema::new(3).unwrap();
        assert_eq!(ema.update(10.0), 10.0);
        // alpha = 0.5
        assert!((ema.update(20.0) - 15.0).abs() < EPS);
        assert!((ema.update(15.0) - 15.0).abs() < EPS);
    }

    #[test]
    fn test_rsi_first_update_is_neutral() {
        for v in [0.01, 100.0, 12345.0] {
            let mut rsi = Rsi::new(14).unwrap();
            assert_eq!(rsi.update(v), 50.0);
        }
    }

    #[test]
    fn test_rsi_neutral_until_window_full() {
        let mut rsi = Rsi::new(3).unwrap();
        assert_eq!(rsi.update(1.0), 50.0);
        assert_eq!(rsi.update(3.0), 50.0);
        assert_eq!(rsi.update(2.0), 50.0);
        // gains [2, 0, 2], losses [0, 1, 0] -> RS = 4 -> 80
        assert!((rsi.update(4.0) - 80.0).abs() < EPS);
    }

    #[test]
    fn test_rsi_no_losses_is_100() {
        let mut rsi = Rsi::new(3).unwrap();
        let mut last = 0.0;
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            last = rsi.update(v);
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_rsi_window_slides() {
        let mut rsi = Rsi::new(2).unwrap();
        for v in [1.0, 2.0, 1.0] {
            rsi.update(v);
        }
        // gains [1, 0], losses [0, 1]
        assert!((rsi.value() - 50.0).abs() < EPS);
        // window now [0, 0] gains and [1, 1] losses
        assert!(rsi.update(0.0).abs() < EPS);
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let mut sma = Sma::new(3).unwrap();
        let mut rsi = Rsi::new(3).unwrap();
        let mut ema = Ema::new(3).unwrap();
        for v in [5.0, 6.0, 7.0, 8.0] {
            sma.update(v);
            rsi.update(v);
            ema.update(v);
        }
        sma.reset();
        rsi.reset();
        ema.reset();
        assert_eq!(sma.update(42.0), 42.0);
        assert_eq!(rsi.update(42.0), 50.0);
        assert_eq!(ema.update(42.0), 42.0);
    }

    #[test]
    fn test_ta_next_trait_matches_update() {
        let mut a = Sma::new(3).unwrap();
        let mut b = Sma::new(3).unwrap();
        for v in [1.0, 4.0, 9.0, 16.0] {
            assert_eq!(a.next(v), b.update(v));
        }
        assert_eq!(a.period(), 3);
    }

    #[test]
    fn test_bollinger_bands_bracket_middle() {
        let mut bb = Bollinger::new(4, 2.0).unwrap();
        let mut out = bb.update(10.0);
        assert_eq!(out.upper, out.lower);
        assert!(!bb.is_ready());

        for v in [12.0, 8.0, 10.0] {
            out = bb.update(v);
        }
        assert!(bb.is_ready());
        assert!((out.middle - 10.0).abs() < EPS);
        // population sd of [10, 12, 8, 10] = sqrt(2)
        let sd = 2f64.sqrt();
        assert!((out.upper - (10.0 + 2.0 * sd)).abs() < 1e-6);
        assert!((out.lower - (10.0 - 2.0 * sd)).abs() < 1e-6);
    }

    #[test]
    fn test_constructors_reject_zero_period() {
        assert!(Sma::new(0).is_err());
        assert!(Ema::new(0).is_err());
        assert!(Rsi::new(0).is_err());
        assert!(Bollinger::new(0, 2.0).is_err());
        assert!(Bollinger::new(20, 0.0).is_err());
    }
}
