//! Process configuration from the environment (after `.env` is loaded)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use engine::{DataSourceKind, DataSourceRegistry};

pub const DEFAULT_DB_PATH: &str = "data/backtests.db";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `ETF_BACKTEST_DB_PATH`
    pub db_path: PathBuf,
    /// `ETF_BACKTEST_DATA_SOURCE`
    pub data_source: DataSourceKind,
    /// `ETF_BACKTEST_HTTP_TIMEOUT_SECS`
    pub http_timeout: Duration,
    /// `ETF_BACKTEST_SYNTHETIC_SEED`; unset means fresh random data each time
    pub synthetic_seed: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let data_source = match get("ETF_BACKTEST_DATA_SOURCE") {
            Some(v) => v
                .parse()
                .with_context(|| format!("ETF_BACKTEST_DATA_SOURCE={v}"))?,
            None => DataSourceKind::EastMoney,
        };
        let timeout_secs = match get("ETF_BACKTEST_HTTP_TIMEOUT_SECS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("ETF_BACKTEST_HTTP_TIMEOUT_SECS={v}"))?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };
        let synthetic_seed = get("ETF_BACKTEST_SYNTHETIC_SEED")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("ETF_BACKTEST_SYNTHETIC_SEED={v}"))
            })
            .transpose()?;

        Ok(Self {
            db_path: get("ETF_BACKTEST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            data_source,
            http_timeout: Duration::from_secs(timeout_secs),
            synthetic_seed,
        })
    }

    pub fn registry(&self) -> anyhow::Result<DataSourceRegistry> {
        DataSourceRegistry::with_defaults(self.data_source, self.http_timeout, self.synthetic_seed)
    }
}
