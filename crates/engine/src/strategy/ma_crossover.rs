use serde::{Deserialize, Serialize};
use ta::Reset;

use super::{Signal, Strategy};
use crate::error::{EngineError, EngineResult};
use crate::indicators::{Ema, Sma};
use crate::types::{MarketBar, ParamSet};

/// Averaging used for both legs of the crossover
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovingAverageKind {
    #[default]
    Simple,
    Exponential,
}

#[derive(Debug, Clone)]
enum Average {
    Simple(Sma),
    Exponential(Ema),
}

impl Average {
    fn new(kind: MovingAverageKind, period: usize) -> EngineResult<Self> {
        Ok(match kind {
            MovingAverageKind::Simple => Average::Simple(Sma::new(period)?),
            MovingAverageKind::Exponential => Average::Exponential(Ema::new(period)?),
        })
    }

    fn update(&mut self, value: f64) -> f64 {
        match self {
            Average::Simple(sma) => sma.update(value),
            Average::Exponential(ema) => ema.update(value),
        }
    }

    fn reset(&mut self) {
        match self {
            Average::Simple(sma) => sma.reset(),
            Average::Exponential(ema) => ema.reset(),
        }
    }
}

/// Golden cross / death cross on a fast and a slow moving average.
///
/// BUY when the fast average moves from at-or-below the slow one to strictly
/// above it, SELL on the mirror move. Nothing is emitted until two readings of
/// both averages exist.
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    name: &'static str,
    fast_period: usize,
    slow_period: usize,
    fast: Average,
    slow: Average,
    prev: Option<(f64, f64)>,
}

impl MovingAverageCrossover {
    pub fn new(fast_period: usize, slow_period: usize) -> EngineResult<Self> {
        Self::with_kind(fast_period, slow_period, MovingAverageKind::Simple)
    }

    pub fn with_kind(
        fast_period: usize,
        slow_period: usize,
        kind: MovingAverageKind,
    ) -> EngineResult<Self> {
        if fast_period >= slow_period {
            return Err(EngineError::InvalidParameter(format!(
                "fast period ({fast_period}) must be shorter than slow period ({slow_period})"
            )));
        }

        Ok(Self {
            name: match kind {
                MovingAverageKind::Simple => "MA Crossover",
                MovingAverageKind::Exponential => "EMA Crossover",
            },
            fast_period,
            slow_period,
            fast: Average::new(kind, fast_period)?,
            slow: Average::new(kind, slow_period)?,
            prev: None,
        })
    }
}

impl Strategy for MovingAverageCrossover {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Buys when the fast moving average crosses above the slow one and sells on the reverse cross"
    }

    fn params(&self) -> ParamSet {
        ParamSet::from([
            ("fastPeriod".to_string(), self.fast_period as f64),
            ("slowPeriod".to_string(), self.slow_period as f64),
        ])
    }

    fn initialize(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.prev = None;
    }

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal> {
        let price = bar.close_f64();
        let fast = self.fast.update(price);
        let slow = self.slow.update(price);

        let Some((prev_fast, prev_slow)) = self.prev.replace((fast, slow)) else {
            return Ok(Signal::Hold);
        };

        if prev_fast <= prev_slow && fast > slow {
            Ok(Signal::Buy)
        } else if prev_fast >= prev_slow && fast < slow {
            Ok(Signal::Sell)
        } else {
            Ok(Signal::Hold)
        }
    }
}
