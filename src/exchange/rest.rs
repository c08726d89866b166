// =============================================================================
// RestClient — paginated historical klines with retry/backoff and throttle.
// =============================================================================
//
// Grounded in the teacher's `binance/client.rs::get_klines` (reqwest usage,
// number-or-string row parsing) and `binance/rate_limit.rs` (header-driven
// throttle), generalized to the chunked pagination and retry policy this
// ingestion pipeline needs.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, instrument, warn};

use crate::metrics::Metrics;
use crate::types::{Candle, Interval};

const MAX_RETRY_ATTEMPTS: u32 = 5;
const MAX_PAGE_LIMIT: usize = 1000;
const RATE_LIMIT_CAP_PER_MIN: u32 = 1200;
const RATE_LIMIT_WARN_FRACTION: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct KlinesPage {
    pub rows: Vec<Candle>,
    pub has_more: bool,
    pub next_from_sec: i64,
}

impl KlinesPage {
    fn empty() -> Self {
        Self {
            rows: Vec::new(),
            has_more: false,
            next_from_sec: 0,
        }
    }
}

pub struct RestClient {
    http: reqwest::Client,
    rest_host: String,
    default_from_epoch_ms: i64,
    metrics: Arc<dyn Metrics>,
}

impl RestClient {
    pub fn new(rest_host: String, default_from_epoch_ms: i64, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with static config"),
            rest_host,
            default_from_epoch_ms,
            metrics,
        }
    }

    /// Fetches a single page of historical klines, chunking internally as
    /// needed to respect `pageLimit`, and returns once that limit is reached
    /// or the requested span is exhausted.
    #[instrument(skip(self), fields(symbol, interval = %interval.label()))]
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        from_sec: i64,
        to_sec: i64,
        page_limit: usize,
    ) -> Result<KlinesPage> {
        if symbol.is_empty() || to_sec <= 0 {
            return Ok(KlinesPage::empty());
        }
        let from_sec = if from_sec <= 0 {
            self.default_from_epoch_ms / 1000
        } else {
            from_sec
        };
        if from_sec >= to_sec {
            return Ok(KlinesPage::empty());
        }

        let page_limit = page_limit.clamp(1, MAX_PAGE_LIMIT);
        let interval_ms = interval.ms();
        let to_ms = to_sec * 1000;
        let mut current_start_ms = from_sec * 1000;
        let mut rows: Vec<Candle> = Vec::new();
        let mut last_emitted_open_ms: Option<i64> = None;

        while current_start_ms < to_ms && rows.len() < page_limit {
            let remaining_capacity = (page_limit - rows.len()) as i64;
            let chunk_end_ms = to_ms.min(current_start_ms + remaining_capacity * interval_ms);

            let body = self
                .get_with_retry(symbol, interval, current_start_ms, chunk_end_ms, page_limit)
                .await?;

            let parsed = parse_klines_response(&body)
                .with_context(|| format!("malformed klines response for {symbol}"))?;

            if parsed.is_empty() {
                break;
            }

            let mut last_close_ms = None;
            for candle in parsed {
                if candle.close_ms > to_ms {
                    continue;
                }
                if let Some(last) = last_emitted_open_ms {
                    if candle.open_ms <= last {
                        continue;
                    }
                }
                last_emitted_open_ms = Some(candle.open_ms);
                last_close_ms = Some(candle.close_ms);
                rows.push(candle);
                if rows.len() >= page_limit {
                    break;
                }
            }

            let Some(last_close_ms) = last_close_ms else {
                break;
            };
            current_start_ms = last_close_ms + 1;
        }

        let has_more = rows.len() >= page_limit && current_start_ms < to_ms;
        let next_from_sec = if has_more { current_start_ms / 1000 } else { 0 };

        Ok(KlinesPage {
            rows,
            has_more,
            next_from_sec,
        })
    }

    async fn get_with_retry(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<String> {
        let url = format!("https://{}/api/v3/klines", self.rest_host);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let response = self
                .http
                .get(&url)
                .query(&[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.label().to_string()),
                    ("startTime", start_ms.to_string()),
                    ("endTime", end_ms.to_string()),
                    ("limit", limit.to_string()),
                ])
                .send()
                .await;

            let response = match response {
                Ok(resp) => resp,
                Err(err) if attempt < MAX_RETRY_ATTEMPTS => {
                    warn!(attempt, error = %err, "rest request failed, retrying");
                    self.backoff_sleep(attempt).await;
                    continue;
                }
                Err(err) => return Err(anyhow!(err).context("rest request exhausted retries")),
            };

            let status = response.status();
            self.apply_rate_limit_throttle(response.headers()).await;

            if status.is_success() {
                return response.text().await.context("failed to read response body");
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < MAX_RETRY_ATTEMPTS {
                warn!(attempt, status = %status, "rest request retryable error, retrying");
                self.backoff_sleep(attempt).await;
                continue;
            }

            bail!("rest request failed with status {status} after {attempt} attempt(s)");
        }
    }

    async fn backoff_sleep(&self, attempt: u32) {
        let secs = 1u64 << (attempt - 1).min(10);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    async fn apply_rate_limit_throttle(&self, headers: &reqwest::header::HeaderMap) {
        let Some(used_weight) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.metrics.set_gauge("rest_used_weight_1m", used_weight as i64);
        let threshold = (RATE_LIMIT_CAP_PER_MIN as f64 * RATE_LIMIT_WARN_FRACTION) as u32;
        if used_weight > threshold {
            debug!(used_weight, threshold, "rate-limit throttle engaged, sleeping 2s");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Parses Binance's `[[openMs, "open", "high", "low", "close", "volume",
/// closeMs, "quoteVolume", trades, ...], ...]` kline response shape.
fn parse_klines_response(body: &str) -> Result<Vec<Candle>> {
    let rows: Vec<Vec<serde_json::Value>> =
        serde_json::from_str(body).context("expected a JSON array of kline rows")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 7 {
            bail!("kline row has fewer than 7 fields: {row:?}");
        }
        let open_ms = value_to_i64(&row[0])?;
        let open = value_to_f64(&row[1])?;
        let high = value_to_f64(&row[2])?;
        let low = value_to_f64(&row[3])?;
        let close = value_to_f64(&row[4])?;
        let base_volume = value_to_f64(&row[5])?;
        let close_ms = value_to_i64(&row[6])?;
        let quote_volume = row.get(7).map(value_to_f64).transpose()?.unwrap_or(0.0);
        let trades = row.get(8).map(value_to_u64).transpose()?.unwrap_or(0);

        candles.push(Candle {
            open_ms,
            close_ms,
            open,
            high,
            low,
            close,
            base_volume,
            quote_volume,
            trades,
            is_closed: true,
        });
    }
    Ok(candles)
}

fn value_to_f64(value: &serde_json::Value) -> Result<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("non-finite number")),
        serde_json::Value::String(s) => s.parse::<f64>().with_context(|| format!("invalid numeric string: {s}")),
        other => bail!("expected number or numeric string, got {other:?}"),
    }
}

fn value_to_i64(value: &serde_json::Value) -> Result<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().ok_or_else(|| anyhow!("non-integer number")),
        serde_json::Value::String(s) => s.parse::<i64>().with_context(|| format!("invalid integer string: {s}")),
        other => bail!("expected integer or integer string, got {other:?}"),
    }
}

fn value_to_u64(value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().ok_or_else(|| anyhow!("non-unsigned number")),
        serde_json::Value::String(s) => s.parse::<u64>().with_context(|| format!("invalid unsigned string: {s}")),
        other => bail!("expected integer or integer string, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rows_with_mixed_string_and_number_fields() {
        let body = r#"[
            [1609459200000, "100.0", "105.0", "99.0", "104.0", "10.5", 1609459259999, "1050.0", 42]
        ]"#;
        let rows = parse_klines_response(body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].open_ms, 1609459200000);
        assert_eq!(rows[0].close, 104.0);
        assert_eq!(rows[0].trades, 42);
    }

    #[test]
    fn rejects_rows_with_too_few_fields() {
        let body = r#"[[1, 2, 3]]"#;
        assert!(parse_klines_response(body).is_err());
    }

    #[tokio::test]
    async fn fetch_klines_returns_empty_when_range_invalid() {
        let metrics = Arc::new(crate::metrics::AtomicMetrics::new());
        let client = RestClient::new("api.binance.com".to_string(), 0, metrics);
        let page = client
            .fetch_klines("BTCUSDT", Interval::OneMinute, 100, 50, 1000)
            .await
            .unwrap();
        assert!(page.rows.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn fetch_klines_rejects_empty_symbol() {
        let metrics = Arc::new(crate::metrics::AtomicMetrics::new());
        let client = RestClient::new("api.binance.com".to_string(), 0, metrics);
        let page = client
            .fetch_klines("", Interval::OneMinute, 0, 100, 1000)
            .await
            .unwrap();
        assert!(page.rows.is_empty());
    }
}
