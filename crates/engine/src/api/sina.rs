//! Sina Finance daily kline client (JSONP endpoint, no authentication)

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::{split_symbol, Exchange};
use crate::data::{day_start_millis, DataSource};
use crate::types::MarketBar;

const DEFAULT_BASE_URL: &str = "https://quotes.sina.cn";
/// Most bars the endpoint returns per call
const MAX_BARS: u32 = 1023;

#[derive(Clone)]
pub struct SinaClient {
    client: Client,
    base_url: String,
}

/// One element of the kline array; every field arrives as a string
#[derive(Debug, Deserialize)]
struct RawBar {
    day: String,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

/// Extract the JSON array from a `var _x_day_data=([...]);` wrapper
pub fn strip_jsonp(body: &str) -> Option<&str> {
    let start = body.find('[')?;
    let end = body.rfind(']')?;
    (end > start).then(|| &body[start..=end])
}

/// Decode a JSONP body, keeping bars dated within `start..=end`
pub fn parse_jsonp(
    symbol: &str,
    body: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<MarketBar>> {
    if body.trim_end().ends_with("null);") || body.trim_end().ends_with("=null;") {
        return Ok(Vec::new());
    }
    let json = strip_jsonp(body).context("Sina response carries no kline array")?;
    let raw: Vec<RawBar> = serde_json::from_str(json).context("Sina returned malformed JSON")?;

    let num = |field: &str, value: &str| {
        Decimal::from_str(value.trim()).with_context(|| format!("bad {field} '{value}'"))
    };

    let mut bars = Vec::with_capacity(raw.len());
    for item in raw {
        // intraday scales append a time; only the date matters here
        let day = item.day.get(..10).unwrap_or(&item.day);
        let date = NaiveDate::parse_from_str(day, "%Y-%m-%d")
            .with_context(|| format!("bad day '{}'", item.day))?;
        if date < start || date > end {
            continue;
        }
        bars.push(MarketBar {
            symbol: symbol.to_string(),
            timestamp: day_start_millis(date),
            open: num("open", &item.open)?,
            high: num("high", &item.high)?,
            low: num("low", &item.low)?,
            close: num("close", &item.close)?,
            volume: num("volume", &item.volume)?,
        });
    }
    Ok(bars)
}

impl SinaClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Daily bars for `symbol`. The endpoint only serves the most recent
    /// 1023 sessions, so older ranges come back short or empty.
    pub async fn get_daily_klines(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MarketBar>> {
        let (exchange, code) = split_symbol(symbol);
        if matches!(exchange, Exchange::HongKong | Exchange::Us) {
            anyhow::bail!("Sina kline endpoint only serves mainland listings, got {symbol}");
        }
        let sina_symbol = format!("{}{}", exchange.prefix(), code);
        let url = format!(
            "{}/cn/api/jsonp_v2.php/var%20_{}_day_data=/CN_MarketDataService.getKLineData\
             ?symbol={}&scale=240&ma=no&datalen={}",
            self.base_url, sina_symbol, sina_symbol, MAX_BARS
        );
        debug!(url = %url, "Fetching Sina klines");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Sina API error {}: {}", status, body);
        }

        let body = response.text().await?;
        let bars = parse_jsonp(symbol, &body, start, end)?;
        debug!(symbol, bars = bars.len(), "Fetched Sina klines");
        Ok(bars)
    }
}

#[async_trait]
impl DataSource for SinaClient {
    fn name(&self) -> &str {
        "sina"
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const BODY: &str = r#"/*<script>location.href='//sina.com';</script>*/
var _sh510300_day_data=([{"day":"2023-12-29","open":"3.400","high":"3.450","low":"3.390","close":"3.440","volume":"900"},{"day":"2024-01-02","open":"3.500","high":"3.700","low":"3.400","close":"3.600","volume":"1000"},{"day":"2024-01-03","open":"3.600","high":"3.800","low":"3.500","close":"3.700","volume":"2000"}]);"#;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_strip_jsonp_finds_array() {
        assert_eq!(strip_jsonp("var x=([1,2]);"), Some("[1,2]"));
        assert_eq!(strip_jsonp("var x=null;"), None);
    }

    #[test]
    fn test_parse_jsonp_filters_to_range() {
        let bars = parse_jsonp("sh510300", BODY, date("2024-01-01"), date("2024-12-31")).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(3.600));
        assert_eq!(bars[1].volume, dec!(2000));
        assert_eq!(bars[0].timestamp, 1_704_153_600_000);
    }

    #[test]
    fn test_parse_jsonp_empty_payload() {
        let body = "var _sh000000_day_data=(null);";
        assert!(parse_jsonp("sh000000", body, date("2024-01-01"), date("2024-12-31"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_jsonp_rejects_bad_numbers() {
        let body = r#"var x=([{"day":"2024-01-02","open":"n/a","high":"1","low":"1","close":"1","volume":"1"}]);"#;
        assert!(parse_jsonp("x", body, date("2024-01-01"), date("2024-12-31")).is_err());
    }
}
