//! Backtest service: loads bars, runs the CPU-bound work off the async
//! runtime and keeps the last result in an injected store.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::task::{spawn_blocking, JoinError};
use tracing::{debug, info, warn};

use crate::cost_backtest::{backtest_with_costs, collect_signals, CostAwareResult};
use crate::data::{DataSourceKind, DataSourceRegistry};
use crate::engine::BacktestEngine;
use crate::error::{EngineError, EngineResult};
use crate::fees::FeeSchedule;
use crate::optimizer::{
    GeneticConfig, OptimizationMetric, OptimizationResult, OptimizeProgress, OptimizeSummary,
    Optimizer, ParameterRange, SearchMethod, MAX_GRID_COMBINATIONS,
};
use crate::store::ResultStore;
use crate::strategy::{StrategyKind, StrategySpec};
use crate::types::{BacktestConfig, BacktestResult, MarketBar, ParamSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Registry default when absent
    #[serde(default)]
    pub source: Option<DataSourceKind>,
    pub strategy: StrategySpec,
    #[serde(default)]
    pub config: BacktestConfig,
}

fn default_capital() -> Decimal {
    dec!(100000)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBacktestRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub source: Option<DataSourceKind>,
    pub strategy: StrategySpec,
    #[serde(default = "default_capital")]
    pub initial_capital: Decimal,
    #[serde(default)]
    pub fees: FeeSchedule,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub source: Option<DataSourceKind>,
    pub strategy: StrategyKind,
    pub ranges: Vec<ParameterRange>,
    #[serde(default)]
    pub metric: OptimizationMetric,
    #[serde(default = "default_true")]
    pub maximize: bool,
    #[serde(default)]
    pub method: SearchMethod,
    #[serde(default)]
    pub genetic: GeneticConfig,
    #[serde(default)]
    pub config: BacktestConfig,
}

fn worker_failed(e: JoinError) -> EngineError {
    EngineError::Strategy(format!("backtest worker failed: {e}"))
}

/// Entry point for callers (HTTP handlers, CLI commands)
#[derive(Clone)]
pub struct BacktestService {
    registry: Arc<DataSourceRegistry>,
    store: Option<Arc<dyn ResultStore>>,
}

impl BacktestService {
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self {
            registry,
            store: None,
        }
    }

    /// Keep every completed backtest in `store`
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &DataSourceRegistry {
        &self.registry
    }

    pub async fn load_bars(
        &self,
        source: Option<DataSourceKind>,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<MarketBar>> {
        self.registry.load(source, symbol, start, end).await
    }

    pub async fn run_backtest(&self, request: BacktestRequest) -> EngineResult<BacktestResult> {
        request.config.validate()?;
        let strategy = request.strategy.build()?;
        let bars = self
            .load_bars(request.source, &request.symbol, request.start, request.end)
            .await?;

        let config = request.config;
        let result = spawn_blocking(move || {
            let mut engine = BacktestEngine::new(strategy, config)?;
            engine.load_data(bars);
            engine.run()
        })
        .await
        .map_err(worker_failed)??;

        self.remember(&result).await;
        Ok(result)
    }

    pub async fn run_cost_backtest(
        &self,
        request: CostBacktestRequest,
    ) -> EngineResult<CostAwareResult> {
        let mut strategy = request.strategy.build()?;
        let bars = self
            .load_bars(request.source, &request.symbol, request.start, request.end)
            .await?;

        let capital = request.initial_capital;
        let fees = request.fees;
        spawn_blocking(move || {
            let signals = collect_signals(strategy.as_mut(), &bars)?;
            debug!(signals = signals.len(), "Collected strategy signals");
            backtest_with_costs(&bars, &signals, capital, &fees)
        })
        .await
        .map_err(worker_failed)?
    }

    /// Run a search, reporting through `progress`. The best result is kept
    /// in the store like any other backtest.
    pub async fn run_optimization(
        &self,
        request: OptimizeRequest,
        progress: Arc<OptimizeProgress>,
    ) -> EngineResult<OptimizationResult> {
        if !progress.try_start(request.method) {
            return Err(EngineError::InvalidConfig(
                "an optimization is already running".to_string(),
            ));
        }
        self.run_claimed_optimization(request, progress).await
    }

    /// Like [`BacktestService::run_optimization`] for a caller that already
    /// won [`OptimizeProgress::try_start`]
    pub async fn run_claimed_optimization(
        &self,
        request: OptimizeRequest,
        progress: Arc<OptimizeProgress>,
    ) -> EngineResult<OptimizationResult> {
        let outcome = self.optimize(request.clone(), Arc::clone(&progress)).await;
        match &outcome {
            Ok(result) => {
                progress.finish(OptimizeSummary {
                    method: request.method,
                    metric: request.metric,
                    best_params: result.best_params.clone(),
                    best_value: request.metric.value(&result.best_result),
                    evaluations: result.all_results.len(),
                });
                self.remember(&result.best_result).await;
            }
            Err(e) => {
                warn!(error = %e, "Optimization stopped");
                progress.fail(e);
            }
        }
        outcome
    }

    /// Checks that need no market data: ranges, parameter names and configs
    pub fn validate_optimization(&self, request: &OptimizeRequest) -> EngineResult<()> {
        let kind = request.strategy;
        let names = kind.param_names();
        for range in &request.ranges {
            range.validate()?;
            if !names.contains(&range.name.as_str()) {
                return Err(EngineError::InvalidParameter(format!(
                    "'{}' is not a parameter of {kind} (expected one of {})",
                    range.name,
                    names.join(", ")
                )));
            }
        }
        request.config.validate()?;
        match request.method {
            SearchMethod::Grid => {
                let count = request
                    .ranges
                    .iter()
                    .fold(1u64, |n, r| n.saturating_mul(r.count()));
                if count > MAX_GRID_COMBINATIONS {
                    return Err(EngineError::TooManyCombinations {
                        count,
                        limit: MAX_GRID_COMBINATIONS,
                    });
                }
            }
            SearchMethod::Genetic => request.genetic.validate()?,
        }
        Ok(())
    }

    async fn optimize(
        &self,
        request: OptimizeRequest,
        progress: Arc<OptimizeProgress>,
    ) -> EngineResult<OptimizationResult> {
        self.validate_optimization(&request)?;
        let kind = request.strategy;

        let bars = self
            .load_bars(request.source, &request.symbol, request.start, request.end)
            .await?;

        info!(
            strategy = %kind,
            method = %request.method,
            ranges = request.ranges.len(),
            "Optimization requested"
        );

        spawn_blocking(move || {
            let optimizer = Optimizer::new(
                move |params: &ParamSet| kind.spec_from_params(params)?.build(),
                bars,
                request.config,
            )
            .with_metric(request.metric, request.maximize)
            .with_progress(progress);

            match request.method {
                SearchMethod::Grid => optimizer.grid_search(&request.ranges),
                SearchMethod::Genetic => optimizer.genetic_search(&request.ranges, &request.genetic),
            }
        })
        .await
        .map_err(worker_failed)?
    }

    /// Most recent stored result; `None` without a store
    pub async fn last_result(&self) -> EngineResult<Option<BacktestResult>> {
        match &self.store {
            Some(store) => store.latest_result().await,
            None => Ok(None),
        }
    }

    // a result is still returned to the caller when saving fails
    async fn remember(&self, result: &BacktestResult) {
        if let Some(store) = &self.store {
            match store.save_result(result).await {
                Ok(id) => debug!(id, "Backtest result saved"),
                Err(e) => warn!(error = %e, "Failed to save backtest result"),
            }
        }
    }
}
