//! Types for the backtesting engine

use std::collections::BTreeMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Named numeric strategy parameters, ordered by name
pub type ParamSet = BTreeMap<String, f64>;

/// One OHLCV sample for a fixed interval (daily for the built-in sources)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBar {
    pub symbol: String,
    /// Bar timestamp in Unix milliseconds (UTC)
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl MarketBar {
    /// Close price as f64 for indicator math
    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

/// Configuration for a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    /// Commission as a fraction of notional (0.001 = 0.1%)
    pub commission_rate: Decimal,
    /// Fill price widening as a fraction of the close, applied against the trade
    pub slippage: Decimal,
    pub allow_short: bool,
    /// Fraction of available cash deployed per entry, in (0, 1]
    pub position_size: Decimal,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(100000),
            commission_rate: dec!(0.001),
            slippage: dec!(0.0005),
            allow_short: false,
            position_size: Decimal::ONE,
        }
    }
}

impl BacktestConfig {
    /// Reject configurations that cannot produce a meaningful simulation
    pub fn validate(&self) -> EngineResult<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if self.commission_rate < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(format!(
                "commission_rate must be >= 0, got {}",
                self.commission_rate
            )));
        }
        if self.slippage < Decimal::ZERO || self.slippage >= Decimal::ONE {
            return Err(EngineError::InvalidConfig(format!(
                "slippage must be in [0, 1), got {}",
                self.slippage
            )));
        }
        if self.position_size <= Decimal::ZERO || self.position_size > Decimal::ONE {
            return Err(EngineError::InvalidConfig(format!(
                "position_size must be in (0, 1], got {}",
                self.position_size
            )));
        }
        Ok(())
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// A round trip in the trade ledger. Exit fields stay `None` while open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: i64,
    pub entry_price: Decimal,
    pub exit_time: Option<i64>,
    pub exit_price: Option<Decimal>,
    pub shares: u64,
    pub side: TradeSide,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub status: TradeStatus,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
    /// Signed share count held after this bar
    pub position: i64,
}

/// Itemised trading costs accumulated over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub commission: Decimal,
    pub transfer: Decimal,
    pub stamp_duty: Decimal,
    pub slippage: Decimal,
    pub total: Decimal,
}

impl CostBreakdown {
    pub fn add(&mut self, commission: Decimal, transfer: Decimal, stamp_duty: Decimal, slippage: Decimal) {
        self.commission += commission;
        self.transfer += transfer;
        self.stamp_duty += stamp_duty;
        self.slippage += slippage;
        self.total += commission + transfer + stamp_duty + slippage;
    }
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub symbol: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    /// Percent
    pub total_return: f64,
    /// Percent, geometric over elapsed calendar years
    pub annual_return: f64,
    pub sharpe_ratio: f64,
    /// Percent, peak to trough
    pub max_drawdown: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Percent
    pub win_rate: f64,
    #[serde(with = "serde_ratio")]
    pub profit_factor: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub params: ParamSet,
    pub costs: CostBreakdown,
    /// Config the run was made with
    #[serde(default)]
    pub config: BacktestConfig,
}

/// JSON has no infinity, so non-finite ratios travel as strings
pub mod serde_ratio {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if *value > 0.0 {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                "Infinity" | "inf" => Ok(f64::INFINITY),
                "-Infinity" | "-inf" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid ratio '{other}'"))),
            },
        }
    }
}
