//! Backtest runs repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One completed backtest run. `result_json` holds the full serialized result;
/// the other columns are copies for filtering and sorting.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub strategy_name: String,
    pub strategy_params: String,
    pub symbol: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: String,
    pub final_capital: String,
    pub total_return: String,
    pub annual_return: String,
    pub sharpe_ratio: String,
    pub max_drawdown: String,
    pub win_rate: String,
    pub profit_factor: String,
    pub total_trades: i64,
    // added via migration
    pub total_costs: Option<String>,
    pub result_json: String,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestStats {
    pub total_runs: i64,
    pub unique_strategies: i64,
    pub unique_symbols: i64,
    pub best_total_return: String,
    pub best_strategy_name: String,
    pub avg_sharpe_ratio: f64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, params_hash, strategy_name, strategy_params, symbol,
           start_time, end_time, initial_capital, final_capital,
           total_return, annual_return, sharpe_ratio, max_drawdown,
           win_rate, profit_factor, total_trades, total_costs,
           result_json, created_at
    FROM backtest_runs
"#;

pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run (INSERT OR REPLACE: a rerun with the same params_hash
    /// supersedes the old row and becomes the latest)
    pub async fn save(&self, record: &BacktestRunRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT OR REPLACE INTO backtest_runs (
                params_hash, strategy_name, strategy_params, symbol,
                start_time, end_time, initial_capital, final_capital,
                total_return, annual_return, sharpe_ratio, max_drawdown,
                win_rate, profit_factor, total_trades, total_costs, result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.strategy_name)
        .bind(&record.strategy_params)
        .bind(&record.symbol)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.initial_capital)
        .bind(&record.final_capital)
        .bind(&record.total_return)
        .bind(&record.annual_return)
        .bind(&record.sharpe_ratio)
        .bind(&record.max_drawdown)
        .bind(&record.win_rate)
        .bind(&record.profit_factor)
        .bind(record.total_trades)
        .bind(&record.total_costs)
        .bind(&record.result_json)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recently saved run
    pub async fn get_latest(&self) -> DbResult<Option<BacktestRunRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT 1");
        let record = sqlx::query_as::<_, BacktestRunRecord>(&sql)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_by_id(&self, id: i64) -> DbResult<Option<BacktestRunRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let record = sqlx::query_as::<_, BacktestRunRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Newest first, with optional filters. Returns the page and the filtered total.
    pub async fn list_paginated(
        &self,
        limit: i64,
        offset: i64,
        strategy_name: Option<&str>,
        symbol: Option<&str>,
    ) -> DbResult<(Vec<BacktestRunRecord>, i64)> {
        let mut where_clauses = vec!["1=1"];
        let mut binds: Vec<&str> = Vec::new();

        if let Some(name) = strategy_name {
            where_clauses.push("strategy_name = ?");
            binds.push(name);
        }
        if let Some(sym) = symbol {
            where_clauses.push("symbol = ?");
            binds.push(sym);
        }
        let where_sql = where_clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM backtest_runs WHERE {where_sql}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(*b);
        }
        let (total,) = count_query.fetch_one(self.pool).await?;

        let data_sql = format!("{SELECT_COLUMNS} WHERE {where_sql} ORDER BY id DESC LIMIT ? OFFSET ?");
        let mut data_query = sqlx::query_as::<_, BacktestRunRecord>(&data_sql);
        for b in &binds {
            data_query = data_query.bind(*b);
        }
        let records = data_query
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool)
            .await?;

        Ok((records, total))
    }

    pub async fn get_stats(&self) -> DbResult<BacktestStats> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs")
            .fetch_one(self.pool)
            .await?;

        let (unique_strategies,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT strategy_name) FROM backtest_runs")
                .fetch_one(self.pool)
                .await?;

        let (unique_symbols,): (i64,) =
            sqlx::query_as("SELECT COUNT(DISTINCT symbol) FROM backtest_runs")
                .fetch_one(self.pool)
                .await?;

        let best: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT total_return, strategy_name
            FROM backtest_runs
            ORDER BY CAST(total_return AS REAL) DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool)
        .await?;

        let (avg_sharpe,): (Option<f64>,) =
            sqlx::query_as("SELECT AVG(CAST(sharpe_ratio AS REAL)) FROM backtest_runs")
                .fetch_one(self.pool)
                .await?;

        let (best_total_return, best_strategy_name) =
            best.unwrap_or_else(|| ("0".to_string(), "N/A".to_string()));

        Ok(BacktestStats {
            total_runs: total,
            unique_strategies,
            unique_symbols,
            best_total_return,
            best_strategy_name,
            avg_sharpe_ratio: avg_sharpe.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(hash: &str, strategy: &str, symbol: &str, total_return: &str) -> BacktestRunRecord {
        BacktestRunRecord {
            id: None,
            params_hash: hash.to_string(),
            strategy_name: strategy.to_string(),
            strategy_params: r#"{"fastPeriod":5.0}"#.to_string(),
            symbol: symbol.to_string(),
            start_time: 0,
            end_time: 86_400_000,
            initial_capital: "100000".to_string(),
            final_capital: "105000".to_string(),
            total_return: total_return.to_string(),
            annual_return: "0".to_string(),
            sharpe_ratio: "1.5".to_string(),
            max_drawdown: "3.2".to_string(),
            win_rate: "50".to_string(),
            profit_factor: "Infinity".to_string(),
            total_trades: 2,
            total_costs: Some("12.5".to_string()),
            result_json: "{}".to_string(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_fetch_latest() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        assert!(repo.get_latest().await.unwrap().is_none());

        repo.save(&record("a", "MA Crossover", "sh510300", "5")).await.unwrap();
        let id = repo.save(&record("b", "RSI", "sh510300", "7")).await.unwrap();

        let latest = repo.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, Some(id));
        assert_eq!(latest.strategy_name, "RSI");
        assert_eq!(latest.total_costs.as_deref(), Some("12.5"));
        assert!(latest.created_at.is_some());

        let by_id = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(by_id.params_hash, "b");
        assert!(repo.get_by_id(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_hash_replaces_and_becomes_latest() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        repo.save(&record("a", "MA Crossover", "sh510300", "5")).await.unwrap();
        repo.save(&record("b", "RSI", "sh510300", "7")).await.unwrap();
        repo.save(&record("a", "MA Crossover", "sh510300", "9")).await.unwrap();

        let (rows, total) = repo.list_paginated(10, 0, None, None).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].params_hash, "a");
        assert_eq!(rows[0].total_return, "9");
    }

    #[tokio::test]
    async fn test_list_filters_and_pages() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());
        for i in 0..5 {
            let symbol = if i % 2 == 0 { "sh510300" } else { "sh510500" };
            repo.save(&record(&format!("h{i}"), "MA Crossover", symbol, "1")).await.unwrap();
        }

        let (page, total) = repo.list_paginated(2, 0, None, Some("sh510300")).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].params_hash, "h4");

        let (rest, _) = repo.list_paginated(2, 2, None, Some("sh510300")).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].params_hash, "h0");

        let (none, total) = repo.list_paginated(10, 0, Some("RSI"), None).await.unwrap();
        assert!(none.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let empty = repo.get_stats().await.unwrap();
        assert_eq!(empty.total_runs, 0);
        assert_eq!(empty.best_strategy_name, "N/A");

        repo.save(&record("a", "MA Crossover", "sh510300", "5")).await.unwrap();
        repo.save(&record("b", "RSI", "sh510500", "12.5")).await.unwrap();
        repo.save(&record("c", "RSI", "sh510300", "-3")).await.unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.unique_strategies, 2);
        assert_eq!(stats.unique_symbols, 2);
        assert_eq!(stats.best_total_return, "12.5");
        assert_eq!(stats.best_strategy_name, "RSI");
        assert!((stats.avg_sharpe_ratio - 1.5).abs() < 1e-9);
    }
}
