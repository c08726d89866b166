// =============================================================================
// CandleRepo — narrow persistence port consumed by the ingestor.
// =============================================================================
//
// The real columnar store lives outside this crate. `CandleRepo` is the only
// contract the ingestor depends on; `InMemoryCandleRepo` is a test double that
// implements it well enough to exercise resync/catch-up/dedup end to end.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::Candle;

#[async_trait]
pub trait CandleRepo: Send + Sync {
    /// Latest closed-candle `openMs` stored for `(symbol, interval_label)`, if any.
    async fn max_timestamp(&self, symbol: &str, interval_label: &str) -> Option<i64>;

    /// Upserts a batch of closed candles, deduplicating on
    /// `(symbol, interval_label, openMs)`. Returns `false` on persistence failure.
    async fn upsert_batch(&self, symbol: &str, interval_label: &str, rows: &[Candle]) -> bool;
}

#[derive(Default)]
pub struct InMemoryCandleRepo {
    // Keyed by (symbol, interval_label, open_ms) -> candle. A HashMap keyed on
    // the full tuple gives upsert semantics for free: inserting the same key
    // again just overwrites, matching the "at most once" invariant.
    rows: Mutex<HashMap<(String, String, i64), Candle>>,
}

impl InMemoryCandleRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, symbol: &str, interval_label: &str) -> usize {
        self.rows
            .lock()
            .keys()
            .filter(|(s, i, _)| s == symbol && i == interval_label)
            .count()
    }
}

#[async_trait]
impl CandleRepo for InMemoryCandleRepo {
    async fn max_timestamp(&self, symbol: &str, interval_label: &str) -> Option<i64> {
        self.rows
            .lock()
            .keys()
            .filter(|(s, i, _)| s == symbol && i == interval_label)
            .map(|(_, _, open_ms)| *open_ms)
            .max()
    }

    async fn upsert_batch(&self, symbol: &str, interval_label: &str, rows: &[Candle]) -> bool {
        let mut guard = self.rows.lock();
        for candle in rows {
            guard.insert(
                (symbol.to_string(), interval_label.to_string(), candle.open_ms),
                *candle,
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_ms: i64) -> Candle {
        Candle {
            open_ms,
            close_ms: open_ms + 59_999,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            base_volume: 1.0,
            quote_volume: 1.0,
            trades: 1,
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_key() {
        let repo = InMemoryCandleRepo::new();
        repo.upsert_batch("BTCUSDT", "1m", &[candle(60_000)]).await;
        repo.upsert_batch("BTCUSDT", "1m", &[candle(60_000)]).await;
        assert_eq!(repo.row_count("BTCUSDT", "1m"), 1);
    }

    #[tokio::test]
    async fn max_timestamp_tracks_highest_open_ms() {
        let repo = InMemoryCandleRepo::new();
        assert_eq!(repo.max_timestamp("BTCUSDT", "1m").await, None);
        repo.upsert_batch("BTCUSDT", "1m", &[candle(60_000), candle(120_000)])
            .await;
        assert_eq!(repo.max_timestamp("BTCUSDT", "1m").await, Some(120_000));
    }

    #[tokio::test]
    async fn different_symbols_are_isolated() {
        let repo = InMemoryCandleRepo::new();
        repo.upsert_batch("BTCUSDT", "1m", &[candle(60_000)]).await;
        repo.upsert_batch("ETHUSDT", "1m", &[candle(60_000), candle(120_000)])
            .await;
        assert_eq!(repo.row_count("BTCUSDT", "1m"), 1);
        assert_eq!(repo.row_count("ETHUSDT", "1m"), 2);
    }
}
