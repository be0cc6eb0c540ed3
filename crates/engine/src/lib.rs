//! ETF Backtester Engine: strategies, backtesting and optimization
//!
//! Provides:
//! - Indicator library (SMA, EMA, RSI, Bollinger) on the `ta` traits
//! - Five built-in strategies behind one `Strategy` trait
//! - Cash/share backtest engine with commission, slippage and shorting
//! - Cost-aware signal backtest with the A-share ETF fee schedule
//! - Grid and genetic parameter optimizer
//! - EastMoney / Sina market data clients with a synthetic fallback

pub mod api;
pub mod cost_backtest;
pub mod data;
pub mod engine;
pub mod error;
pub mod fees;
pub mod indicators;
pub mod optimizer;
pub mod service;
pub mod store;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use api::{EastMoneyClient, SinaClient};
pub use cost_backtest::{backtest_with_costs, collect_signals, CostAwareResult, CostedTrade};
pub use data::{
    DataSource, DataSourceKind, DataSourceRegistry, SymbolInfo, SyntheticDataSource,
    WithSyntheticFallback,
};
pub use engine::{BacktestEngine, EngineState};
pub use error::{EngineError, EngineResult};
pub use fees::{calculate_trading_costs, FeeSchedule, OrderSide, TradeCosts};
pub use indicators::{Bollinger, BollingerOutput, Ema, Rsi, Sma};
pub use optimizer::{
    grid_combinations, GeneticConfig, OptimizationMetric, OptimizationResult, OptimizeProgress,
    OptimizeStatus, OptimizeSummary, Optimizer, ParameterRange, ProgressSnapshot, SearchMethod,
};
pub use service::{BacktestRequest, BacktestService, CostBacktestRequest, OptimizeRequest};
pub use store::{MemoryResultStore, ResultStore};
pub use strategy::{
    BollingerBreakout, MlStrategy, MomentumStrategy, MovingAverageCrossover, MovingAverageKind,
    RsiStrategy, Signal, SignalEvent, Strategy, StrategyKind, StrategySpec,
};
pub use types::*;
