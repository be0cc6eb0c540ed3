//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Completed backtest runs
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    strategy_name TEXT NOT NULL,
    strategy_params TEXT NOT NULL,
    symbol TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    initial_capital TEXT NOT NULL,
    final_capital TEXT NOT NULL,
    total_return TEXT NOT NULL DEFAULT '0',
    annual_return TEXT NOT NULL DEFAULT '0',
    sharpe_ratio TEXT NOT NULL DEFAULT '0',
    max_drawdown TEXT NOT NULL DEFAULT '0',
    win_rate TEXT NOT NULL DEFAULT '0',
    profit_factor TEXT NOT NULL DEFAULT '0',
    total_trades INTEGER NOT NULL DEFAULT 0,
    total_costs TEXT,
    result_json TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_backtest_strategy ON backtest_runs(strategy_name, symbol);
CREATE INDEX IF NOT EXISTS idx_backtest_created ON backtest_runs(created_at DESC)
"#;
