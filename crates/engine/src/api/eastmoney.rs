//! EastMoney historical kline client (no authentication required)

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{split_symbol, Exchange};
use crate::data::{day_start_millis, DataSource};
use crate::types::MarketBar;

const DEFAULT_BASE_URL: &str = "https://push2his.eastmoney.com";
const UT_TOKEN: &str = "7eea3edcaed734bea9cbfc24409ed989";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; etf-backtester)";

/// EastMoney `push2his` daily kline client
#[derive(Clone)]
pub struct EastMoneyClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct KlineResponse {
    rc: i64,
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

/// Numeric market id in `secid`
pub fn market_code(exchange: Exchange) -> u32 {
    match exchange {
        Exchange::Shanghai => 1,
        Exchange::Shenzhen | Exchange::Beijing => 0,
        Exchange::HongKong => 116,
        Exchange::Us => 105,
    }
}

/// Parse one `date,open,close,high,low,volume,...` row
pub fn parse_kline_row(symbol: &str, row: &str) -> Option<MarketBar> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() < 6 {
        return None;
    }
    let date = NaiveDate::parse_from_str(fields[0].trim(), "%Y-%m-%d").ok()?;
    let num = |i: usize| Decimal::from_str(fields[i].trim()).ok();

    Some(MarketBar {
        symbol: symbol.to_string(),
        timestamp: day_start_millis(date),
        open: num(1)?,
        close: num(2)?,
        high: num(3)?,
        low: num(4)?,
        volume: num(5)?,
    })
}

/// Decode a kline response body. Malformed rows are skipped.
pub fn parse_response(symbol: &str, body: &str) -> Result<Vec<MarketBar>> {
    let response: KlineResponse =
        serde_json::from_str(body).context("EastMoney returned malformed JSON")?;
    if response.rc != 0 {
        anyhow::bail!("EastMoney API error rc={}", response.rc);
    }
    let rows = response.data.map(|d| d.klines).unwrap_or_default();

    let bars: Vec<MarketBar> = rows
        .iter()
        .filter_map(|row| parse_kline_row(symbol, row))
        .collect();
    if bars.len() < rows.len() {
        warn!(
            symbol,
            skipped = rows.len() - bars.len(),
            "Skipped malformed EastMoney kline rows"
        );
    }
    Ok(bars)
}

impl EastMoneyClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    /// Client against a custom base URL (proxies, mirrors)
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Forward-adjusted daily bars for `symbol` between `start` and `end` inclusive
    pub async fn get_daily_klines(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MarketBar>> {
        let (exchange, code) = split_symbol(symbol);
        let url = format!(
            "{}/api/qt/stock/kline/get?secid={}.{}&ut={}\
             &fields1=f1,f2,f3,f4,f5,f6,f7,f8,f9,f10,f11,f12,f13\
             &fields2=f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61\
             &klt=101&fqt=1&beg={}&end={}",
            self.base_url,
            market_code(exchange),
            code,
            UT_TOKEN,
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
        );
        debug!(url = %url, "Fetching EastMoney klines");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("EastMoney API error {}: {}", status, body);
        }

        let body = response.text().await?;
        let bars = parse_response(symbol, &body)?;
        debug!(symbol, bars = bars.len(), "Fetched EastMoney klines");
        Ok(bars)
    }
}

#[async_trait]
impl DataSource for EastMoneyClient {
    fn name(&self) -> &str {
        "eastmoney"
    }

    async fn load_data(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MarketBar>> {
        self.get_daily_klines(symbol, start, end).await
    }
}
