//! JSON API consumed by the dashboard

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use engine::{
    BacktestRequest, BacktestService, CostBacktestRequest, DataSourceKind, EngineError,
    OptimizeProgress, OptimizeRequest, ProgressSnapshot,
};
use persistence::repository::{BacktestRepository, BacktestRunRecord};
use persistence::{Database, DbError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::APP_VERSION;

#[derive(Clone)]
pub struct AppState {
    pub service: BacktestService,
    pub db: Arc<Database>,
    pub optimize_progress: Arc<OptimizeProgress>,
}

/// Error body `{ "success": false, "error": ... }` with a matching status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = if e.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        error!("Database error: {}", e);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
        }));
        (self.status, body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_backtest))
        .route("/backtest/costs", post(api_cost_backtest))
        .route("/backtest/latest", get(api_latest_backtest))
        .route("/backtests", get(api_list_backtests))
        .route("/backtests/stats", get(api_backtest_stats))
        .route("/optimize", post(api_start_optimization))
        .route("/optimize/status", get(api_optimize_status))
        .route("/optimize/cancel", post(api_cancel_optimization))
        .route("/data/bars", get(api_bars))
        .route("/data/symbols", get(api_symbols))
        .with_state(state)
}

// ============================================================================
// Backtests
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "etf-backtester",
        "version": APP_VERSION,
    }))
}

/// POST /api/backtest
async fn api_backtest(
    State(state): State<AppState>,
    Json(request): Json<BacktestRequest>,
) -> ApiResult {
    info!(
        symbol = %request.symbol,
        strategy = %request.strategy.kind(),
        "Backtest requested"
    );
    let result = state.service.run_backtest(request).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

/// POST /api/backtest/costs
async fn api_cost_backtest(
    State(state): State<AppState>,
    Json(request): Json<CostBacktestRequest>,
) -> ApiResult {
    let result = state.service.run_cost_backtest(request).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

/// GET /api/backtest/latest
async fn api_latest_backtest(State(state): State<AppState>) -> ApiResult {
    let result = state.service.last_result().await?;
    Ok(Json(json!({ "success": true, "result": result })))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
    strategy: Option<String>,
    symbol: Option<String>,
}

fn default_limit() -> i64 {
    20
}

/// Listing row; the full result stays behind `/backtest/latest`
#[derive(Debug, Serialize)]
struct RunSummary {
    id: Option<i64>,
    strategy_name: String,
    strategy_params: Value,
    symbol: String,
    start_time: i64,
    end_time: i64,
    initial_capital: String,
    final_capital: String,
    total_return: String,
    annual_return: String,
    sharpe_ratio: String,
    max_drawdown: String,
    win_rate: String,
    profit_factor: String,
    total_trades: i64,
    total_costs: Option<String>,
    created_at: Option<i64>,
}

impl From<BacktestRunRecord> for RunSummary {
    fn from(r: BacktestRunRecord) -> Self {
        Self {
            id: r.id,
            strategy_name: r.strategy_name,
            strategy_params: serde_json::from_str(&r.strategy_params).unwrap_or(Value::Null),
            symbol: r.symbol,
            start_time: r.start_time,
            end_time: r.end_time,
            initial_capital: r.initial_capital,
            final_capital: r.final_capital,
            total_return: r.total_return,
            annual_return: r.annual_return,
            sharpe_ratio: r.sharpe_ratio,
            max_drawdown: r.max_drawdown,
            win_rate: r.win_rate,
            profit_factor: r.profit_factor,
            total_trades: r.total_trades,
            total_costs: r.total_costs,
            created_at: r.created_at,
        }
    }
}

/// GET /api/backtests: stored runs, newest first
async fn api_list_backtests(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult {
    let limit = params.limit.clamp(1, 500);
    let offset = params.offset.max(0);
    let repo = BacktestRepository::new(state.db.pool());
    let (records, total) = repo
        .list_paginated(limit, offset, params.strategy.as_deref(), params.symbol.as_deref())
        .await?;
    let data: Vec<RunSummary> = records.into_iter().map(RunSummary::from).collect();

    Ok(Json(json!({
        "success": true,
        "data": data,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/backtests/stats
async fn api_backtest_stats(State(state): State<AppState>) -> ApiResult {
    let stats = BacktestRepository::new(state.db.pool()).get_stats().await?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

// ============================================================================
// Optimizer
// ============================================================================

/// POST /api/optimize: start a search in the background
async fn api_start_optimization(
    State(state): State<AppState>,
    Json(request): Json<OptimizeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.service.validate_optimization(&request)?;

    if !state.optimize_progress.try_start(request.method) {
        let pct = state.optimize_progress.progress_pct();
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({
                "success": false,
                "error": format!("Optimization already in progress ({:.0}% complete)", pct),
            })),
        ));
    }

    info!(
        strategy = %request.strategy,
        symbol = %request.symbol,
        method = %request.method,
        metric = %request.metric,
        "Starting parameter optimization"
    );

    let service = state.service.clone();
    let progress = state.optimize_progress.clone();
    tokio::spawn(async move {
        if let Err(e) = service.run_claimed_optimization(request, progress).await {
            error!("Optimization failed: {}", e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Optimization started",
        })),
    ))
}

/// GET /api/optimize/status
async fn api_optimize_status(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.optimize_progress.snapshot())
}

/// POST /api/optimize/cancel
async fn api_cancel_optimization(State(state): State<AppState>) -> Json<Value> {
    if !state.optimize_progress.is_running() {
        return Json(json!({
            "success": false,
            "message": "No optimization is running",
        }));
    }
    state.optimize_progress.cancel();
    info!("Optimization cancel requested");
    Json(json!({
        "success": true,
        "message": "Cancellation requested",
    }))
}

// ============================================================================
// Market data
// ============================================================================

#[derive(Debug, Deserialize)]
struct BarsParams {
    symbol: String,
    start: NaiveDate,
    end: NaiveDate,
    source: Option<DataSourceKind>,
}

/// GET /api/data/bars
async fn api_bars(State(state): State<AppState>, Query(params): Query<BarsParams>) -> ApiResult {
    let bars = state
        .service
        .load_bars(params.source, &params.symbol, params.start, params.end)
        .await?;
    Ok(Json(json!({
        "success": true,
        "symbol": params.symbol,
        "count": bars.len(),
        "bars": bars,
    })))
}

/// GET /api/data/symbols
async fn api_symbols(State(state): State<AppState>) -> Json<Value> {
    let registry = state.service.registry();
    Json(json!({
        "success": true,
        "etfs": registry.etf_catalog(),
        "indices": registry.index_catalog(),
        "sources": registry.kinds(),
        "default_source": registry.default_kind(),
    }))
}
