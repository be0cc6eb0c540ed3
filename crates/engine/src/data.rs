//! Market data sources
//!
//! Every HTTP source is wrapped in [`WithSyntheticFallback`], so a backtest
//! always receives bars: network failures and empty answers degrade to the
//! seeded synthetic generator with a warning.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeZone, Utc, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{EastMoneyClient, SinaClient};
use crate::error::{EngineError, EngineResult};
use crate::types::MarketBar;

/// Unix milliseconds of 00:00 UTC on `date`
pub fn day_start_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis())
        .unwrap_or_default()
}

/// Anything that can produce daily bars for a symbol and date range
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Vec<MarketBar>>;
}

// ---------------------------------------------------------------------------
// Synthetic bars
// ---------------------------------------------------------------------------

const DRIFT: f64 = 0.0005;
const DAILY_VOLATILITY: f64 = 0.01;

/// Random-walk daily bars on weekdays.
///
/// With a seed the output is identical for identical requests.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDataSource {
    seed: Option<u64>,
}

impl SyntheticDataSource {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    /// Starting price by symbol family: indices trade in the thousands,
    /// the large ETFs around a few yuan.
    pub fn base_price(symbol: &str) -> f64 {
        if symbol.contains("000001") {
            3200.0
        } else if symbol.contains("500") {
            6.8
        } else if symbol.contains("300") {
            4.2
        } else if symbol.contains("50") {
            3.5
        } else {
            5.0
        }
    }

    pub fn generate(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> Vec<MarketBar> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.unwrap_or_else(rand::random));
        let to_decimal = |v: f64| Decimal::from_f64(v).unwrap_or_default().round_dp(3);

        let mut bars = Vec::new();
        let mut price = Self::base_price(symbol);
        let mut day = start;
        while day <= end {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let daily_return = DRIFT + (rng.gen::<f64>() - 0.5) * DAILY_VOLATILITY * 2.0;
                price *= 1.0 + daily_return;

                let open = price * (1.0 + (rng.gen::<f64>() - 0.5) * 0.005);
                let high = open.max(price) * (1.0 + rng.gen::<f64>() * 0.005);
                let low = open.min(price) * (1.0 - rng.gen::<f64>() * 0.005);
                let volume = (rng.gen::<f64>() * 10_000_000.0).floor() + 1_000_000.0;

                bars.push(MarketBar {
                    symbol: symbol.to_string(),
                    timestamp: day_start_millis(day),
                    open: to_decimal(open),
                    high: to_decimal(high),
                    low: to_decimal(low),
                    close: to_decimal(price),
                    volume: Decimal::from_f64(volume).unwrap_or_default(),
                });
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        bars
    }
}

#[async_trait]
impl DataSource for SyntheticDataSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Vec<MarketBar>> {
        Ok(self.generate(symbol, start, end))
    }
}

/// Wraps a remote source; never fails
pub struct WithSyntheticFallback<S> {
    inner: S,
    fallback: SyntheticDataSource,
}

impl<S: DataSource> WithSyntheticFallback<S> {
    pub fn new(inner: S, fallback: SyntheticDataSource) -> Self {
        Self { inner, fallback }
    }
}

#[async_trait]
impl<S: DataSource> DataSource for WithSyntheticFallback<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> anyhow::Result<Vec<MarketBar>> {
        let mut bars = match self.inner.load_data(symbol, start, end).await {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => {
                warn!(source = self.inner.name(), symbol, "No bars returned, using synthetic data");
                self.fallback.generate(symbol, start, end)
            }
            Err(e) => {
                warn!(source = self.inner.name(), symbol, "Data source failed ({e:#}), using synthetic data");
                self.fallback.generate(symbol, start, end)
            }
        };
        sort_unique(&mut bars);
        Ok(bars)
    }
}

/// Ascending by timestamp, keeping the first bar of any repeated day
fn sort_unique(bars: &mut Vec<MarketBar>) {
    bars.sort_by_key(|b| b.timestamp);
    let before = bars.len();
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < before {
        debug!(dropped = before - bars.len(), "Dropped bars with repeated timestamps");
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceKind {
    EastMoney,
    Sina,
    Synthetic,
}

impl DataSourceKind {
    pub const ALL: [DataSourceKind; 3] = [
        DataSourceKind::EastMoney,
        DataSourceKind::Sina,
        DataSourceKind::Synthetic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::EastMoney => "eastmoney",
            DataSourceKind::Sina => "sina",
            DataSourceKind::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eastmoney" | "east-money" | "em" => Ok(DataSourceKind::EastMoney),
            "sina" => Ok(DataSourceKind::Sina),
            "synthetic" | "mock" => Ok(DataSourceKind::Synthetic),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown data source '{other}'"
            ))),
        }
    }
}

/// A listed symbol with its display name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SymbolInfo {
    pub symbol: &'static str,
    pub name: &'static str,
}

const fn listed(symbol: &'static str, name: &'static str) -> SymbolInfo {
    SymbolInfo { symbol, name }
}

pub const ETF_CATALOG: &[SymbolInfo] = &[
    listed("sh510050", "SSE 50 ETF"),
    listed("sh510300", "CSI 300 ETF"),
    listed("sh510500", "CSI 500 ETF"),
    listed("sh512880", "Securities ETF"),
    listed("sh512690", "Liquor ETF"),
    listed("sh512170", "Healthcare ETF"),
    listed("sh512760", "Chip ETF"),
    listed("sh512480", "Semiconductor ETF"),
    listed("sh512980", "Media ETF"),
    listed("sh512800", "Bank ETF"),
    listed("sh512200", "Real Estate ETF"),
    listed("sh512660", "Defense ETF"),
    listed("sz159915", "ChiNext ETF"),
    listed("sh588000", "STAR 50 ETF"),
    listed("sh513050", "China Internet ETF"),
    listed("sh513100", "Nasdaq 100 ETF"),
    listed("sh513500", "S&P 500 ETF"),
];

pub const INDEX_CATALOG: &[SymbolInfo] = &[
    listed("sh000001", "SSE Composite"),
    listed("sh000300", "CSI 300"),
    listed("sh000905", "CSI 500"),
    listed("sh000016", "SSE 50"),
    listed("sz399001", "SZSE Component"),
    listed("sz399006", "ChiNext Index"),
    listed("sh000688", "STAR 50"),
];

/// Data sources by kind, with a default for requests that name none
pub struct DataSourceRegistry {
    sources: HashMap<DataSourceKind, Arc<dyn DataSource>>,
    default_kind: DataSourceKind,
}

impl DataSourceRegistry {
    /// Empty registry; sources are added with [`register`](Self::register)
    pub fn new(default_kind: DataSourceKind) -> Self {
        Self {
            sources: HashMap::new(),
            default_kind,
        }
    }

    /// EastMoney and Sina behind the synthetic fallback, plus the synthetic
    /// source itself
    pub fn with_defaults(
        default_kind: DataSourceKind,
        http_timeout: Duration,
        synthetic_seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        let synthetic = SyntheticDataSource::new(synthetic_seed);
        let mut registry = Self::new(default_kind);
        registry.register(
            DataSourceKind::EastMoney,
            Arc::new(WithSyntheticFallback::new(
                EastMoneyClient::new(http_timeout)?,
                synthetic.clone(),
            )),
        );
        registry.register(
            DataSourceKind::Sina,
            Arc::new(WithSyntheticFallback::new(
                SinaClient::new(http_timeout)?,
                synthetic.clone(),
            )),
        );
        registry.register(DataSourceKind::Synthetic, Arc::new(synthetic));
        Ok(registry)
    }

    pub fn register(&mut self, kind: DataSourceKind, source: Arc<dyn DataSource>) {
        self.sources.insert(kind, source);
    }

    pub fn default_kind(&self) -> DataSourceKind {
        self.default_kind
    }

    pub fn kinds(&self) -> Vec<DataSourceKind> {
        let mut kinds: Vec<_> = self.sources.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn etf_catalog(&self) -> &'static [SymbolInfo] {
        ETF_CATALOG
    }

    pub fn index_catalog(&self) -> &'static [SymbolInfo] {
        INDEX_CATALOG
    }

    /// Bars for `symbol` from `kind` (or the default source), sorted ascending
    pub async fn load(
        &self,
        kind: Option<DataSourceKind>,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<MarketBar>> {
        if symbol.trim().is_empty() {
            return Err(EngineError::InvalidParameter("symbol must not be empty".into()));
        }
        if start > end {
            return Err(EngineError::InvalidParameter(format!(
                "start date {start} is after end date {end}"
            )));
        }

        let kind = kind.unwrap_or(self.default_kind);
        let source = self
            .sources
            .get(&kind)
            .ok_or_else(|| EngineError::Data(format!("data source '{kind}' is not configured")))?;

        debug!(source = %kind, symbol, %start, %end, "Loading market data");
        let mut bars = source
            .load_data(symbol, start, end)
            .await
            .map_err(|e| EngineError::Data(format!("{e:#}")))?;
        if bars.is_empty() {
            return Err(EngineError::EmptyData);
        }
        sort_unique(&mut bars);
        info!(source = %kind, symbol, bars = bars.len(), "Market data loaded");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn load_data(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<MarketBar>> {
            anyhow::bail!("connection refused")
        }
    }

    struct EmptySource;

    #[async_trait]
    impl DataSource for EmptySource {
        fn name(&self) -> &str {
            "empty"
        }

        async fn load_data(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<MarketBar>> {
            Ok(Vec::new())
        }
    }

    /// Answers with 2024-01-03, 2024-01-02 and a second 2024-01-03 row
    struct RepeatingSource;

    #[async_trait]
    impl DataSource for RepeatingSource {
        fn name(&self) -> &str {
            "repeating"
        }

        async fn load_data(
            &self,
            symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<MarketBar>> {
            let bar = |day: &str, close: i64| MarketBar {
                symbol: symbol.to_string(),
                timestamp: day_start_millis(date(day)),
                open: Decimal::from(close),
                high: Decimal::from(close),
                low: Decimal::from(close),
                close: Decimal::from(close),
                volume: Decimal::from(1000),
            };
            Ok(vec![bar("2024-01-03", 11), bar("2024-01-02", 10), bar("2024-01-03", 12)])
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_synthetic_skips_weekends() {
        // Mon 2024-01-01 .. Sun 2024-01-14
        let bars = SyntheticDataSource::new(Some(7)).generate("sh510300", date("2024-01-01"), date("2024-01-14"));
        assert_eq!(bars.len(), 10);
        assert_eq!(bars[0].timestamp, day_start_millis(date("2024-01-01")));
        assert_eq!(bars[5].timestamp, day_start_millis(date("2024-01-08")));
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_synthetic_is_deterministic_with_seed() {
        let source = SyntheticDataSource::new(Some(42));
        let a = source.generate("sh510300", date("2024-01-01"), date("2024-03-01"));
        let b = source.generate("sh510300", date("2024-01-01"), date("2024-03-01"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_synthetic_bars_are_consistent() {
        let bars = SyntheticDataSource::new(Some(1)).generate("sh510500", date("2023-01-01"), date("2023-12-31"));
        for bar in &bars {
            assert!(bar.low <= bar.high);
            assert!(bar.close > Decimal::ZERO);
            assert!(bar.volume >= Decimal::from(1_000_000));
        }
        // a day moves at most about one percent from the previous close
        let first = bars[0].close_f64();
        assert!((first / 6.8 - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_base_price_prefers_specific_codes() {
        assert_eq!(SyntheticDataSource::base_price("sh000001"), 3200.0);
        assert_eq!(SyntheticDataSource::base_price("sh510500"), 6.8);
        assert_eq!(SyntheticDataSource::base_price("sh510300"), 4.2);
        assert_eq!(SyntheticDataSource::base_price("sh510050"), 3.5);
        assert_eq!(SyntheticDataSource::base_price("sh512880"), 5.0);
    }

    #[test]
    fn test_reversed_range_is_empty() {
        let bars = SyntheticDataSource::new(Some(1)).generate("x", date("2024-02-01"), date("2024-01-01"));
        assert!(bars.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_replaces_failure_with_synthetic_bars() {
        let source = WithSyntheticFallback::new(FailingSource, SyntheticDataSource::new(Some(3)));
        let bars = source.load_data("sh510300", date("2024-01-01"), date("2024-01-31")).await.unwrap();
        assert!(!bars.is_empty());
        assert_eq!(source.name(), "failing");
    }

    #[tokio::test]
    async fn test_fallback_replaces_empty_answer() {
        let source = WithSyntheticFallback::new(EmptySource, SyntheticDataSource::new(Some(3)));
        let bars = source.load_data("sh510300", date("2024-01-01"), date("2024-01-31")).await.unwrap();
        assert_eq!(bars.len(), 23);
    }

    #[tokio::test]
    async fn test_repeated_days_are_dropped() {
        let source = WithSyntheticFallback::new(RepeatingSource, SyntheticDataSource::new(Some(3)));
        let bars = source.load_data("sh510300", date("2024-01-01"), date("2024-01-05")).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, Decimal::from(10));
        assert_eq!(bars[1].close, Decimal::from(11));

        let mut registry = DataSourceRegistry::new(DataSourceKind::EastMoney);
        registry.register(DataSourceKind::EastMoney, Arc::new(RepeatingSource));
        let bars = registry.load(None, "sh510300", date("2024-01-01"), date("2024-01-05")).await.unwrap();
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_registry_routes_by_kind() {
        let mut registry = DataSourceRegistry::new(DataSourceKind::Synthetic);
        registry.register(DataSourceKind::Synthetic, Arc::new(SyntheticDataSource::new(Some(9))));

        let bars = registry.load(None, "sh510300", date("2024-01-01"), date("2024-01-05")).await.unwrap();
        assert_eq!(bars.len(), 5);

        let missing = registry.load(Some(DataSourceKind::Sina), "sh510300", date("2024-01-01"), date("2024-01-05")).await;
        assert!(matches!(missing, Err(EngineError::Data(_))));

        let reversed = registry.load(None, "sh510300", date("2024-02-01"), date("2024-01-01")).await;
        assert!(matches!(reversed, Err(EngineError::InvalidParameter(_))));

        let weekend = registry.load(None, "sh510300", date("2024-01-06"), date("2024-01-07")).await;
        assert_eq!(weekend, Err(EngineError::EmptyData));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("EastMoney".parse::<DataSourceKind>().unwrap(), DataSourceKind::EastMoney);
        assert_eq!("mock".parse::<DataSourceKind>().unwrap(), DataSourceKind::Synthetic);
        assert!("yahoo".parse::<DataSourceKind>().is_err());
        for kind in DataSourceKind::ALL {
            assert_eq!(kind.to_string().parse::<DataSourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_catalogs_use_exchange_prefixes() {
        for entry in ETF_CATALOG.iter().chain(INDEX_CATALOG) {
            assert!(entry.symbol.starts_with("sh") || entry.symbol.starts_with("sz"));
            assert_eq!(entry.symbol.len(), 8);
        }
    }
}
