//! ETF Backtester: strategy backtesting and parameter optimization for
//! exchange-traded funds
//!
//! Usage:
//!   etf-backtester serve --port 3001
//!   etf-backtester backtest --symbol sh510300 --strategy ma
//!   etf-backtester optimize --strategy rsi --range period:6:24:2
//!   etf-backtester history --stats

mod api;
mod config;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use engine::{
    BacktestConfig, BacktestRequest, BacktestResult, BacktestService, CostAwareResult,
    CostBacktestRequest, DataSourceKind, FeeSchedule, GeneticConfig, OptimizationMetric,
    OptimizationResult, OptimizeProgress, OptimizeRequest, OptimizeStatus, ParamSet,
    ParameterRange, SearchMethod, StrategyKind, StrategySpec,
};
use persistence::repository::BacktestRepository;
use persistence::Database;
use rust_decimal::Decimal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::api::AppState;
use crate::config::AppConfig;

pub const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "etf-backtester")]
#[command(about = "Backtest and optimize trading strategies on A-share ETFs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override ETF_BACKTEST_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Override ETF_BACKTEST_DATA_SOURCE (eastmoney, sina, synthetic)
    #[arg(long, global = true)]
    source: Option<DataSourceKind>,

    #[command(subcommand)]
    command: Commands,
}

/// Symbol and date range shared by the run commands
#[derive(Args, Clone)]
struct MarketArgs {
    /// Symbol, with or without exchange prefix
    #[arg(long, default_value = "sh510300")]
    symbol: String,
    /// First day (YYYY-MM-DD), defaults to one year before --end
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last day (YYYY-MM-DD), defaults to today
    #[arg(long)]
    end: Option<NaiveDate>,
}

impl MarketArgs {
    fn range(&self) -> (NaiveDate, NaiveDate) {
        let end = self.end.unwrap_or_else(|| Utc::now().date_naive());
        let start = self.start.unwrap_or(end - Duration::days(365));
        (start, end)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the web server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
    /// Run one backtest from CLI (no web server)
    Backtest {
        #[command(flatten)]
        market: MarketArgs,
        /// moving-average, rsi, momentum, ml, bollinger
        #[arg(long, default_value = "moving-average")]
        strategy: StrategyKind,
        /// Strategy parameter, repeatable: --param fastPeriod=5
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, f64)>,
        #[arg(long, default_value = "100000")]
        capital: Decimal,
        #[arg(long, default_value = "0.001")]
        commission: Decimal,
        #[arg(long, default_value = "0.0005")]
        slippage: Decimal,
        #[arg(long)]
        allow_short: bool,
        /// Run the long-only backtest with itemised A-share fees instead
        #[arg(long)]
        costs: bool,
        /// Number of trades to list
        #[arg(long, default_value_t = 10)]
        show_trades: usize,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// Search strategy parameters from CLI
    Optimize {
        #[command(flatten)]
        market: MarketArgs,
        #[arg(long, default_value = "moving-average")]
        strategy: StrategyKind,
        /// Range per parameter, repeatable: --range fastPeriod:3:15:1
        #[arg(long = "range", value_parser = parse_range, required = true)]
        ranges: Vec<ParameterRange>,
        /// sharpeRatio, totalReturn, annualReturn, maxDrawdown, winRate, profitFactor, ...
        #[arg(long, default_value = "sharpeRatio")]
        metric: OptimizationMetric,
        /// Prefer lower metric values
        #[arg(long)]
        minimize: bool,
        /// grid or genetic
        #[arg(long, default_value = "grid")]
        method: SearchMethod,
        #[arg(long, default_value_t = 20)]
        population: usize,
        #[arg(long, default_value_t = 10)]
        generations: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value = "100000")]
        capital: Decimal,
        /// Number of top results to print
        #[arg(long, default_value_t = 10)]
        top_n: usize,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
    },
    /// List stored backtest runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
        /// Print aggregate stats instead of the list
        #[arg(long)]
        stats: bool,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,etf_backtester=debug")
    } else {
        EnvFilter::new("info,engine=info,etf_backtester=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// `name=value`
fn parse_param(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    Ok((name.trim().to_string(), value))
}

/// `name:min:max:step`
fn parse_range(s: &str) -> Result<ParameterRange, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let &[name, min, max, step] = parts.as_slice() else {
        return Err(format!("expected name:min:max:step, got '{s}'"));
    };
    let num = |v: &str| {
        v.trim()
            .parse::<f64>()
            .map_err(|_| format!("'{v}' is not a number"))
    };
    let range = ParameterRange::new(name.trim(), num(min)?, num(max)?, num(step)?);
    range.validate().map_err(|e| e.to_string())?;
    Ok(range)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    let mut config = AppConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(source) = cli.source {
        config.data_source = source;
    }

    match cli.command {
        Commands::Serve { host, port } => {
            cmd_serve(&config, &host, port).await?;
        }
        Commands::Backtest {
            market,
            strategy,
            params,
            capital,
            commission,
            slippage,
            allow_short,
            costs,
            show_trades,
            export,
        } => {
            let spec = strategy.spec_from_params(&params.into_iter().collect::<ParamSet>())?;
            let backtest_config = BacktestConfig {
                initial_capital: capital,
                commission_rate: commission,
                slippage,
                allow_short,
                ..BacktestConfig::default()
            };
            cmd_backtest(&config, market, spec, backtest_config, costs, show_trades, export).await?;
        }
        Commands::Optimize {
            market,
            strategy,
            ranges,
            metric,
            minimize,
            method,
            population,
            generations,
            seed,
            capital,
            top_n,
            export,
        } => {
            let (start, end) = market.range();
            let request = OptimizeRequest {
                symbol: market.symbol,
                start,
                end,
                source: Some(config.data_source),
                strategy,
                ranges,
                metric,
                maximize: !minimize,
                method,
                genetic: GeneticConfig {
                    population_size: population,
                    generations,
                    seed,
                    ..GeneticConfig::default()
                },
                config: BacktestConfig {
                    initial_capital: capital,
                    ..BacktestConfig::default()
                },
            };
            cmd_optimize(&config, request, top_n, export).await?;
        }
        Commands::History {
            limit,
            strategy,
            symbol,
            stats,
        } => {
            cmd_history(&config, limit, strategy, symbol, stats).await?;
        }
    }

    Ok(())
}

async fn open_database(config: &AppConfig) -> anyhow::Result<Arc<Database>> {
    let db = Database::new(&config.db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    Ok(Arc::new(db))
}

async fn build_service(config: &AppConfig) -> anyhow::Result<(BacktestService, Arc<Database>)> {
    let db = open_database(config).await?;
    let registry = config
        .registry()
        .context("Failed to set up market data sources")?;
    let service = BacktestService::new(Arc::new(registry)).with_store(db.clone());
    Ok((service, db))
}

// ============================================================================
// Serve command: Axum web server
// ============================================================================

async fn cmd_serve(config: &AppConfig, host: &str, port: u16) -> anyhow::Result<()> {
    info!("ETF Backtester v{} starting...", APP_VERSION);

    let (service, db) = build_service(config).await?;
    info!("Database initialized: {}", config.db_path.display());

    let state = AppState {
        service,
        db,
        optimize_progress: Arc::new(OptimizeProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // dist/ next to the executable wins over ./dist
    let exe_path = std::env::current_exe().unwrap_or_default();
    let exe_dir = exe_path.parent().unwrap_or(std::path::Path::new("."));
    let dist_dir = exe_dir.join("dist");
    let static_dir = if dist_dir.exists() {
        dist_dir
    } else {
        PathBuf::from("dist")
    };

    let app = axum::Router::new()
        .nest("/api", api::router(state))
        .fallback_service(ServeDir::new(&static_dir))
        .layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== ETF Backtester v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  POST /api/backtest            - Run a backtest");
    println!("  POST /api/backtest/costs      - Run a backtest with itemised fees");
    println!("  GET  /api/backtest/latest     - Most recent result");
    println!("  GET  /api/backtests           - Stored runs (paginated)");
    println!("  GET  /api/backtests/stats     - Stored run stats");
    println!("  POST /api/optimize            - Start parameter optimization");
    println!("  GET  /api/optimize/status     - Poll optimization progress");
    println!("  POST /api/optimize/cancel     - Cancel running optimization");
    println!("  GET  /api/data/bars           - Daily bars for a symbol");
    println!("  GET  /api/data/symbols        - ETF and index catalogue");
    println!("\n  Data source: {}", config.data_source);
    println!("  Database: {}", config.db_path.display());
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(
    config: &AppConfig,
    market: MarketArgs,
    spec: StrategySpec,
    backtest_config: BacktestConfig,
    costs: bool,
    show_trades: usize,
    export: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== ETF Backtester v{} ===", APP_VERSION);
    let (start, end) = market.range();
    println!(
        "Symbol: {} | {} .. {} | Source: {} | Strategy: {}",
        market.symbol,
        start,
        end,
        config.data_source,
        spec.kind()
    );

    let (service, _db) = build_service(config).await?;

    let json = if costs {
        let result = service
            .run_cost_backtest(CostBacktestRequest {
                symbol: market.symbol,
                start,
                end,
                source: Some(config.data_source),
                strategy: spec,
                initial_capital: backtest_config.initial_capital,
                fees: FeeSchedule::etf(backtest_config.slippage),
            })
            .await?;
        print_cost_result(&result, show_trades);
        serde_json::to_string_pretty(&result)?
    } else {
        let result = service
            .run_backtest(BacktestRequest {
                symbol: market.symbol,
                start,
                end,
                source: Some(config.data_source),
                strategy: spec,
                config: backtest_config,
            })
            .await?;
        print_result(&result, show_trades);
        serde_json::to_string_pretty(&result)?
    };

    if let Some(export_path) = export {
        std::fs::write(&export_path, &json)?;
        println!("\nResult exported to {}", export_path);
    }
    Ok(())
}

fn print_result(r: &BacktestResult, show_trades: usize) {
    println!("\n{} on {}", r.strategy_name, r.symbol);
    println!("  {}", "-".repeat(40));
    println!("  {:<18} {:>20}", "Initial capital", r.initial_capital.round_dp(2));
    println!("  {:<18} {:>20}", "Final capital", r.final_capital.round_dp(2));
    println!("  {:<18} {:>19.2}%", "Total return", r.total_return);
    println!("  {:<18} {:>19.2}%", "Annual return", r.annual_return);
    println!("  {:<18} {:>20.3}", "Sharpe ratio", r.sharpe_ratio);
    println!("  {:<18} {:>19.2}%", "Max drawdown", r.max_drawdown);
    println!(
        "  {:<18} {:>20}",
        "Trades (W/L)",
        format!("{} ({}/{})", r.total_trades, r.winning_trades, r.losing_trades)
    );
    println!("  {:<18} {:>19.1}%", "Win rate", r.win_rate);
    println!("  {:<18} {:>20.2}", "Profit factor", r.profit_factor);
    println!("  {:<18} {:>20}", "Costs paid", r.costs.total.round_dp(2));

    if show_trades == 0 || r.trades.is_empty() {
        return;
    }
    println!("\nFirst {} trades:", r.trades.len().min(show_trades));
    println!(
        "  {:>3}  {:<6} {:<10} {:>9} {:<10} {:>9} {:>8} {:>12}",
        "#", "Side", "Entry", "Price", "Exit", "Price", "Shares", "PnL"
    );
    println!("  {}", "-".repeat(75));
    for (i, t) in r.trades.iter().take(show_trades).enumerate() {
        println!(
            "  {:>3}  {:<6} {:<10} {:>9} {:<10} {:>9} {:>8} {:>+12.2}",
            i + 1,
            format!("{:?}", t.side),
            format_day(t.entry_time),
            t.entry_price.round_dp(3),
            t.exit_time.map(format_day).unwrap_or_default(),
            t.exit_price.map(|p| p.round_dp(3).to_string()).unwrap_or_default(),
            t.shares,
            t.pnl,
        );
    }
}

fn print_cost_result(r: &CostAwareResult, show_trades: usize) {
    println!("\nLong-only backtest with A-share ETF fees");
    println!("  {}", "-".repeat(40));
    println!("  {:<22} {:>16}", "Initial capital", r.initial_capital.round_dp(2));
    println!("  {:<22} {:>16}", "Final asset", r.final_asset.round_dp(2));
    println!("  {:<22} {:>15.2}%", "Total return", r.total_return);
    println!("  {:<22} {:>15.2}%", "Return without costs", r.return_without_costs);
    println!("  {:<22} {:>15.2}%", "Cost impact", r.cost_impact);
    println!("  {:<22} {:>16}", "Trades", r.total_trades);
    println!("  {:<22} {:>16}", "Commission", r.costs.commission.round_dp(2));
    println!("  {:<22} {:>16}", "Transfer fee", r.costs.transfer.round_dp(2));
    println!("  {:<22} {:>16}", "Stamp duty", r.costs.stamp_duty.round_dp(2));
    println!("  {:<22} {:>16}", "Slippage", r.costs.slippage.round_dp(2));

    if show_trades == 0 || r.trades.is_empty() {
        return;
    }
    println!("\nFirst {} fills:", r.trades.len().min(show_trades));
    for t in r.trades.iter().take(show_trades) {
        println!(
            "  {:<10} {:<4} {:>8} @ {:>8}  costs {:>8} ({:.3}%)",
            format_day(t.timestamp),
            format!("{:?}", t.side),
            t.shares,
            t.price.round_dp(3),
            t.costs.total.round_dp(2),
            t.cost_pct,
        );
    }
}

fn format_day(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

// ============================================================================
// Optimize command
// ============================================================================

async fn cmd_optimize(
    config: &AppConfig,
    request: OptimizeRequest,
    top_n: usize,
    export: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== ETF Backtester v{} ===", APP_VERSION);
    println!(
        "Optimizing {} on {} | {} search | {} ({})",
        request.strategy,
        request.symbol,
        request.method,
        request.metric,
        if request.maximize { "maximize" } else { "minimize" }
    );
    println!("Press Ctrl+C to cancel\n");

    let (service, _db) = build_service(config).await?;
    let progress = Arc::new(OptimizeProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let metric = request.metric;
    let maximize = request.maximize;
    let progress_clone = progress.clone();
    let handle =
        tokio::spawn(async move { service.run_optimization(request, progress_clone).await });

    // Progress display loop
    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        if !progress.is_running() {
            continue;
        }
        let pct = progress.progress_pct();
        let completed = progress.completed.load(Ordering::Relaxed);
        let total = progress.total.load(Ordering::Relaxed);

        let bar_len = 30;
        let filled = ((pct as usize) * bar_len / 100).min(bar_len);
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
        print!("\r  [{}] {:.0}% ({}/{})   ", bar, pct, completed, total);
    }

    let outcome = handle.await.context("optimization task panicked")?;
    match progress.snapshot().status {
        OptimizeStatus::Cancelled => {
            println!("\r  Cancelled.                                        ");
            return Ok(());
        }
        OptimizeStatus::Complete => {
            println!("\r  Complete!                                         ");
        }
        _ => {}
    }
    let result = outcome?;

    print_optimization(&result, metric, maximize, top_n);

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&export_path, &json)?;
        println!("\nResults exported to {}", export_path);
    }
    Ok(())
}

fn print_optimization(
    result: &OptimizationResult,
    metric: OptimizationMetric,
    maximize: bool,
    top_n: usize,
) {
    let mut ranked: Vec<_> = result.all_results.iter().collect();
    ranked.sort_by(|a, b| {
        let (a, b) = (metric.value(&a.result), metric.value(&b.result));
        if maximize {
            b.total_cmp(&a)
        } else {
            a.total_cmp(&b)
        }
    });
    ranked.dedup_by(|a, b| a.params == b.params);

    println!(
        "\nBest parameters: {}",
        format_params(&result.best_params)
    );
    println!("\nTop {} of {} evaluations:", ranked.len().min(top_n), result.all_results.len());
    println!(
        "  {:>3}  {:<36} {:>12} {:>9} {:>8} {:>7}",
        "#", "Params", metric.as_str(), "Return%", "DD%", "Trades"
    );
    println!("  {}", "-".repeat(82));
    for (i, e) in ranked.iter().take(top_n).enumerate() {
        println!(
            "  {:>3}  {:<36} {:>12.4} {:>8.2}% {:>7.2}% {:>7}",
            i + 1,
            format_params(&e.params),
            metric.value(&e.result),
            e.result.total_return,
            e.result.max_drawdown,
            e.result.total_trades,
        );
    }
}

fn format_params(params: &ParamSet) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// History command
// ============================================================================

async fn cmd_history(
    config: &AppConfig,
    limit: i64,
    strategy: Option<String>,
    symbol: Option<String>,
    stats: bool,
) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let repo = BacktestRepository::new(db.pool());

    if stats {
        let stats = repo.get_stats().await?;
        println!("\nStored runs: {}", stats.total_runs);
        println!("  Strategies: {}", stats.unique_strategies);
        println!("  Symbols: {}", stats.unique_symbols);
        println!(
            "  Best return: {}% ({})",
            stats.best_total_return, stats.best_strategy_name
        );
        println!("  Average Sharpe: {:.3}", stats.avg_sharpe_ratio);
        return Ok(());
    }

    let (records, total) = repo
        .list_paginated(limit, 0, strategy.as_deref(), symbol.as_deref())
        .await?;
    if records.is_empty() {
        println!("\nNo stored backtests.");
        return Ok(());
    }

    println!("\n{} of {} stored runs:", records.len(), total);
    println!(
        "  {:>5}  {:<20} {:<10} {:<23} {:>10} {:>8} {:>7}",
        "ID", "Strategy", "Symbol", "Range", "Return%", "Sharpe", "Trades"
    );
    println!("  {}", "-".repeat(90));
    for r in &records {
        let num = |s: &str| s.parse::<f64>().unwrap_or(0.0);
        println!(
            "  {:>5}  {:<20} {:<10} {:<23} {:>10.2} {:>8.3} {:>7}",
            r.id.unwrap_or_default(),
            r.strategy_name,
            r.symbol,
            format!("{}..{}", format_day(r.start_time), format_day(r.end_time)),
            num(r.total_return.as_str()),
            num(r.sharpe_ratio.as_str()),
            r.total_trades,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("fastPeriod=5").unwrap(), ("fastPeriod".to_string(), 5.0));
        assert_eq!(parse_param(" threshold = 0.5 ").unwrap(), ("threshold".to_string(), 0.5));
        assert!(parse_param("fastPeriod").is_err());
        assert!(parse_param("fastPeriod=fast").is_err());
    }

    #[test]
    fn test_parse_range() {
        let range = parse_range("period:6:24:2").unwrap();
        assert_eq!(range, ParameterRange::new("period", 6.0, 24.0, 2.0));
        assert_eq!(range.count(), 10);
        assert!(parse_range("period:6:24").is_err());
        assert!(parse_range("period:24:6:2").is_err());
        assert!(parse_range("period:6:24:0").is_err());
    }

    #[test]
    fn test_cli_parses_optimize_command() {
        let cli = Cli::try_parse_from([
            "etf-backtester",
            "--source",
            "synthetic",
            "optimize",
            "--strategy",
            "rsi",
            "--range",
            "period:6:24:2",
            "--metric",
            "totalReturn",
            "--method",
            "genetic",
            "--start",
            "2023-01-01",
        ])
        .unwrap();
        assert_eq!(cli.source, Some(DataSourceKind::Synthetic));
        match cli.command {
            Commands::Optimize {
                strategy,
                ranges,
                metric,
                method,
                market,
                ..
            } => {
                assert_eq!(strategy, StrategyKind::Rsi);
                assert_eq!(ranges.len(), 1);
                assert_eq!(metric, OptimizationMetric::TotalReturn);
                assert_eq!(method, SearchMethod::Genetic);
                assert_eq!(market.start, NaiveDate::from_ymd_opt(2023, 1, 1));
            }
            _ => panic!("expected optimize"),
        }
    }

    #[test]
    fn test_default_range_is_one_year() {
        let market = MarketArgs {
            symbol: "sh510300".to_string(),
            start: None,
            end: NaiveDate::from_ymd_opt(2024, 6, 30),
        };
        let (start, end) = market.range();
        assert_eq!(end - start, Duration::days(365));
    }

    #[test]
    fn test_format_day() {
        assert_eq!(format_day(1_704_153_600_000), "2024-01-02");
    }
}
