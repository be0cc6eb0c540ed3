//! Where completed backtest results are kept between requests

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use persistence::repository::{BacktestRepository, BacktestRunRecord};
use persistence::Database;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::types::BacktestResult;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist `result`, returning its id
    async fn save_result(&self, result: &BacktestResult) -> EngineResult<i64>;

    /// Most recently saved result, if any
    async fn latest_result(&self) -> EngineResult<Option<BacktestResult>>;
}

/// Dedup key: strategy, params, symbol, time range and the full run config
pub fn params_hash(result: &BacktestResult) -> String {
    let params = serde_json::to_string(&result.params).unwrap_or_default();
    let config = serde_json::to_string(&result.config).unwrap_or_default();
    let input = format!(
        "{}:{}:{}:{}:{}:{}",
        result.strategy_name, params, result.symbol, result.start_time, result.end_time, config
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

fn ratio_text(value: f64) -> String {
    if value.is_infinite() && value > 0.0 {
        "Infinity".to_string()
    } else {
        value.to_string()
    }
}

/// Flatten a result into a database row
pub fn result_to_record(result: &BacktestResult) -> EngineResult<BacktestRunRecord> {
    let to_json = |e: serde_json::Error| EngineError::Store(format!("serialize result: {e}"));
    Ok(BacktestRunRecord {
        id: None,
        params_hash: params_hash(result),
        strategy_name: result.strategy_name.clone(),
        strategy_params: serde_json::to_string(&result.params).map_err(to_json)?,
        symbol: result.symbol.clone(),
        start_time: result.start_time,
        end_time: result.end_time,
        initial_capital: result.initial_capital.to_string(),
        final_capital: result.final_capital.to_string(),
        total_return: result.total_return.to_string(),
        annual_return: result.annual_return.to_string(),
        sharpe_ratio: result.sharpe_ratio.to_string(),
        max_drawdown: result.max_drawdown.to_string(),
        win_rate: result.win_rate.to_string(),
        profit_factor: ratio_text(result.profit_factor),
        total_trades: i64::from(result.total_trades),
        total_costs: Some(result.costs.total.to_string()),
        result_json: serde_json::to_string(result).map_err(to_json)?,
        created_at: None,
    })
}

/// Rebuild the full result stored in a row
pub fn record_to_result(record: &BacktestRunRecord) -> EngineResult<BacktestResult> {
    serde_json::from_str(&record.result_json)
        .map_err(|e| EngineError::Store(format!("decode result {:?}: {e}", record.id)))
}

/// Process-local store, for tests and the CLI
#[derive(Default)]
pub struct MemoryResultStore {
    results: RwLock<Vec<BacktestResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save_result(&self, result: &BacktestResult) -> EngineResult<i64> {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        results.push(result.clone());
        Ok(results.len() as i64)
    }

    async fn latest_result(&self) -> EngineResult<Option<BacktestResult>> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        Ok(results.last().cloned())
    }
}

#[async_trait]
impl ResultStore for Database {
    async fn save_result(&self, result: &BacktestResult) -> EngineResult<i64> {
        let record = result_to_record(result)?;
        BacktestRepository::new(self.pool())
            .save(&record)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))
    }

    async fn latest_result(&self) -> EngineResult<Option<BacktestResult>> {
        let record = BacktestRepository::new(self.pool())
            .get_latest()
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        record.as_ref().map(record_to_result).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BacktestEngine;
    use crate::strategy::test_support::make_bars;
    use crate::strategy::MovingAverageCrossover;
    use crate::types::{
        BacktestConfig, CostBreakdown, EquityPoint, ParamSet, Trade, TradeSide, TradeStatus,
    };
    use persistence::repository::BacktestRepository;
    use rust_decimal_macros::dec;

    fn sample_result(strategy_name: &str, fast: f64) -> BacktestResult {
        BacktestResult {
            strategy_name: strategy_name.to_string(),
            symbol: "sh510300".to_string(),
            start_time: 0,
            end_time: 86_400_000,
            initial_capital: dec!(100000),
            final_capital: dec!(101000),
            total_return: 1.0,
            annual_return: 0.0,
            sharpe_ratio: 1.25,
            max_drawdown: 0.5,
            total_trades: 1,
            winning_trades: 1,
            losing_trades: 0,
            win_rate: 100.0,
            profit_factor: f64::INFINITY,
            equity_curve: vec![
                EquityPoint { time: 0, equity: dec!(100000), position: 100 },
                EquityPoint { time: 86_400_000, equity: dec!(101000), position: 0 },
            ],
            trades: vec![Trade {
                entry_time: 0,
                entry_price: dec!(100),
                exit_time: Some(86_400_000),
                exit_price: Some(dec!(110)),
                shares: 100,
                side: TradeSide::Long,
                pnl: dec!(1000),
                pnl_pct: dec!(10),
                status: TradeStatus::Closed,
            }],
            params: ParamSet::from([("fastPeriod".to_string(), fast)]),
            costs: CostBreakdown::default(),
            config: BacktestConfig::default(),
        }
    }

    #[test]
    fn test_params_hash_separates_parameter_sets() {
        let a = sample_result("MA Crossover", 5.0);
        let b = sample_result("MA Crossover", 6.0);
        assert_eq!(params_hash(&a), params_hash(&a.clone()));
        assert_ne!(params_hash(&a), params_hash(&b));
        assert_eq!(params_hash(&a).len(), 64);

        let mut c = a.clone();
        c.config.slippage = dec!(0.002);
        assert_ne!(params_hash(&a), params_hash(&c));
        let mut d = a.clone();
        d.config.allow_short = true;
        assert_ne!(params_hash(&a), params_hash(&d));
    }

    #[test]
    fn test_record_keeps_infinite_profit_factor_readable() {
        let record = result_to_record(&sample_result("MA Crossover", 5.0)).unwrap();
        assert_eq!(record.profit_factor, "Infinity");
        assert_eq!(record.total_trades, 1);
        assert_eq!(record_to_result(&record).unwrap(), sample_result("MA Crossover", 5.0));
    }

    #[tokio::test]
    async fn test_memory_store_returns_latest() {
        let store = MemoryResultStore::new();
        assert!(store.latest_result().await.unwrap().is_none());

        store.save_result(&sample_result("MA Crossover", 5.0)).await.unwrap();
        let id = store.save_result(&sample_result("RSI", 14.0)).await.unwrap();
        assert_eq!(id, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest_result().await.unwrap().unwrap().strategy_name, "RSI");
    }

    #[tokio::test]
    async fn test_database_store_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let result = sample_result("MA Crossover", 5.0);

        db.save_result(&result).await.unwrap();
        db.save_result(&sample_result("RSI", 14.0)).await.unwrap();
        db.save_result(&result).await.unwrap();

        let latest = db.latest_result().await.unwrap().unwrap();
        assert_eq!(latest, result);
    }

    #[tokio::test]
    async fn test_runs_differing_only_in_config_are_kept_apart() {
        let prices = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0, 18.0, 19.0];
        let run = |commission_rate| {
            let config = BacktestConfig {
                commission_rate,
                ..BacktestConfig::default()
            };
            let strategy = MovingAverageCrossover::new(2, 4).unwrap();
            let mut engine = BacktestEngine::new(Box::new(strategy), config).unwrap();
            engine.load_data(make_bars(&prices));
            engine.run().unwrap()
        };
        let cheap = run(dec!(0));
        let dear = run(dec!(0.01));
        assert_ne!(cheap.final_capital, dear.final_capital);

        let db = Database::in_memory().await.unwrap();
        db.save_result(&cheap).await.unwrap();
        db.save_result(&dear).await.unwrap();

        let stats = BacktestRepository::new(db.pool()).get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(db.latest_result().await.unwrap().unwrap(), dear);
    }
}
