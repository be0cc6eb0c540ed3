//! Strategy abstraction and the declarative strategy catalogue
//!
//! A strategy receives bars one at a time and answers with a [`Signal`].
//! Strategies are described by [`StrategySpec`], a serde-tagged value that the
//! API, the CLI and the optimizer turn into a boxed [`Strategy`].

mod bollinger;
mod ma_crossover;
mod ml;
mod momentum;
mod rsi;

pub use bollinger::BollingerBreakout;
pub use ma_crossover::{MovingAverageCrossover, MovingAverageKind};
pub use ml::{LinearRegression, MlStrategy};
pub use momentum::MomentumStrategy;
pub use rsi::RsiStrategy;

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{MarketBar, ParamSet};

/// Per-bar trading decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// A non-HOLD signal together with the bar that triggered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub index: usize,
    pub timestamp: i64,
    pub price: Decimal,
    pub signal: Signal,
}

/// Bar-by-bar signal generator driven by the backtest engine
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Parameters the strategy was built with, keyed as the optimizer names them
    fn params(&self) -> ParamSet;

    /// Clear all per-run state. Called at the start of every run.
    fn initialize(&mut self);

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal>;

    /// Called once after the last bar of a run
    fn on_exit(&mut self) {}
}

// ============================================================================
// Declarative strategy description
// ============================================================================

/// Serializable description of one of the built-in strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategySpec {
    MovingAverage {
        fast_period: usize,
        slow_period: usize,
        #[serde(default)]
        average: MovingAverageKind,
    },
    Rsi {
        period: usize,
        overbought: f64,
        oversold: f64,
    },
    Momentum {
        lookback_period: usize,
        threshold: f64,
    },
    Ml {
        lookback: usize,
        train_period: usize,
        threshold: f64,
    },
    Bollinger {
        period: usize,
        multiplier: f64,
    },
}

impl StrategySpec {
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategySpec::MovingAverage { .. } => StrategyKind::MovingAverage,
            StrategySpec::Rsi { .. } => StrategyKind::Rsi,
            StrategySpec::Momentum { .. } => StrategyKind::Momentum,
            StrategySpec::Ml { .. } => StrategyKind::Ml,
            StrategySpec::Bollinger { .. } => StrategyKind::Bollinger,
        }
    }

    /// Instantiate a fresh strategy
    pub fn build(&self) -> EngineResult<Box<dyn Strategy>> {
        let strategy: Box<dyn Strategy> = match *self {
            StrategySpec::MovingAverage {
                fast_period,
                slow_period,
                average,
            } => Box::new(MovingAverageCrossover::with_kind(
                fast_period,
                slow_period,
                average,
            )?),
            StrategySpec::Rsi {
                period,
                overbought,
                oversold,
            } => Box::new(RsiStrategy::new(period, overbought, oversold)?),
            StrategySpec::Momentum {
                lookback_period,
                threshold,
            } => Box::new(MomentumStrategy::new(lookback_period, threshold)?),
            StrategySpec::Ml {
                lookback,
                train_period,
                threshold,
            } => Box::new(MlStrategy::new(lookback, train_period, threshold)?),
            StrategySpec::Bollinger { period, multiplier } => {
                Box::new(BollingerBreakout::new(period, multiplier)?)
            }
        };
        Ok(strategy)
    }
}

/// The built-in strategy families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    MovingAverage,
    Rsi,
    Momentum,
    Ml,
    Bollinger,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::MovingAverage,
        StrategyKind::Rsi,
        StrategyKind::Momentum,
        StrategyKind::Ml,
        StrategyKind::Bollinger,
    ];

    /// Parameter names accepted by [`StrategyKind::spec_from_params`]
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            StrategyKind::MovingAverage => &["fastPeriod", "slowPeriod"],
            StrategyKind::Rsi => &["period", "overbought", "oversold"],
            StrategyKind::Momentum => &["lookbackPeriod", "threshold"],
            StrategyKind::Ml => &["lookback", "trainPeriod", "threshold"],
            StrategyKind::Bollinger => &["period", "multiplier"],
        }
    }

    pub fn default_spec(&self) -> StrategySpec {
        match self {
            StrategyKind::MovingAverage => StrategySpec::MovingAverage {
                fast_period: 12,
                slow_period: 26,
                average: MovingAverageKind::Simple,
            },
            StrategyKind::Rsi => StrategySpec::Rsi {
                period: 14,
                overbought: 70.0,
                oversold: 30.0,
            },
            StrategyKind::Momentum => StrategySpec::Momentum {
                lookback_period: 20,
                threshold: 5.0,
            },
            StrategyKind::Ml => StrategySpec::Ml {
                lookback: 10,
                train_period: 50,
                threshold: 0.01,
            },
            StrategyKind::Bollinger => StrategySpec::Bollinger {
                period: 20,
                multiplier: 2.0,
            },
        }
    }

    /// Build a spec from named parameters, falling back to defaults for missing keys.
    ///
    /// Unknown parameter names are rejected so a misspelt optimizer range fails
    /// loudly instead of silently searching nothing.
    pub fn spec_from_params(&self, params: &ParamSet) -> EngineResult<StrategySpec> {
        let names = self.param_names();
        if let Some(unknown) = params.keys().find(|k| !names.contains(&k.as_str())) {
            return Err(EngineError::InvalidParameter(format!(
                "'{unknown}' is not a parameter of {self} (expected one of {})",
                names.join(", ")
            )));
        }

        let spec = match self.default_spec() {
            StrategySpec::MovingAverage {
                fast_period,
                slow_period,
                average,
            } => StrategySpec::MovingAverage {
                fast_period: period_param(params, "fastPeriod", fast_period)?,
                slow_period: period_param(params, "slowPeriod", slow_period)?,
                average,
            },
            StrategySpec::Rsi {
                period,
                overbought,
                oversold,
            } => StrategySpec::Rsi {
                period: period_param(params, "period", period)?,
                overbought: float_param(params, "overbought", overbought)?,
                oversold: float_param(params, "oversold", oversold)?,
            },
            StrategySpec::Momentum {
                lookback_period,
                threshold,
            } => StrategySpec::Momentum {
                lookback_period: period_param(params, "lookbackPeriod", lookback_period)?,
                threshold: float_param(params, "threshold", threshold)?,
            },
            StrategySpec::Ml {
                lookback,
                train_period,
                threshold,
            } => StrategySpec::Ml {
                lookback: period_param(params, "lookback", lookback)?,
                train_period: period_param(params, "trainPeriod", train_period)?,
                threshold: float_param(params, "threshold", threshold)?,
            },
            StrategySpec::Bollinger { period, multiplier } => StrategySpec::Bollinger {
                period: period_param(params, "period", period)?,
                multiplier: float_param(params, "multiplier", multiplier)?,
            },
        };
        Ok(spec)
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::MovingAverage => write!(f, "moving-average"),
            StrategyKind::Rsi => write!(f, "rsi"),
            StrategyKind::Momentum => write!(f, "momentum"),
            StrategyKind::Ml => write!(f, "ml"),
            StrategyKind::Bollinger => write!(f, "bollinger"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "moving-average" | "moving_average" | "ma" | "sma" => Ok(StrategyKind::MovingAverage),
            "rsi" => Ok(StrategyKind::Rsi),
            "momentum" => Ok(StrategyKind::Momentum),
            "ml" | "linear-regression" => Ok(StrategyKind::Ml),
            "bollinger" | "boll" => Ok(StrategyKind::Bollinger),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown strategy type '{other}'"
            ))),
        }
    }
}

fn float_param(params: &ParamSet, key: &str, default: f64) -> EngineResult<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) if v.is_finite() => Ok(*v),
        Some(v) => Err(EngineError::InvalidParameter(format!(
            "{key} must be finite, got {v}"
        ))),
    }
}

fn period_param(params: &ParamSet, key: &str, default: usize) -> EngineResult<usize> {
    let Some(&value) = params.get(key) else {
        return Ok(default);
    };
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 1.0 {
        return Err(EngineError::InvalidParameter(format!(
            "{key} must be a whole number >= 1, got {value}"
        )));
    }
    Ok(rounded as usize)
}
