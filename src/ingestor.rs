// =============================================================================
// LiveIngestor — resync → subscribe → dedup/throttle/persist/broadcast.
// =============================================================================
//
// Grounded almost exclusively in the original `LiveIngestor.cpp` (no
// equivalent orchestration exists in the teacher repo): the resync loop's
// stall detection and tail-trimming, the live-subscription dedup/throttle
// decision table, and the catch-up-after-reconnect bridging all follow its
// algorithm. Shared-state guarding style (separate mutexes per concern) is
// grounded in the teacher's `app_state.rs`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::exchange::{RestClient, WsExchangeClient};
use crate::metrics::Metrics;
use crate::repo::CandleRepo;
use crate::types::{align_down, Candle, Interval, LiveKey};

const BOOTSTRAP_CANDLES: i64 = 200;
const RESYNC_PAGE_LIMIT: usize = 1000;
const RESYNC_STALL_ITERATIONS: u32 = 3;
/// Depth of the channel between the WS read loop and the candle consumer
/// task. Generous relative to one-symbol-per-second traffic; a full channel
/// means the consumer task has fallen badly behind (or died), not ordinary
/// backpressure, so `try_send` on a full channel drops the update rather
/// than blocking the read loop.
const CANDLE_CHANNEL_CAPACITY: usize = 1024;

/// Receiving side of `LiveIngestor`'s fan-out: anything that can broadcast a
/// JSON envelope to connected clients. Implemented by `ClientWsServer`; kept
/// as a trait so the ingestor depends on a narrow interface, not the concrete
/// server type (per the "pass dependencies explicitly" design note).
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, json: String);
}

struct LiveState {
    last_broadcast: Mutex<HashMap<LiveKey, Instant>>,
    last_closed: Mutex<HashMap<String, i64>>,
}

impl LiveState {
    fn new() -> Self {
        Self {
            last_broadcast: Mutex::new(HashMap::new()),
            last_closed: Mutex::new(HashMap::new()),
        }
    }
}

pub struct LiveIngestor {
    rest: Arc<RestClient>,
    ws: Arc<WsExchangeClient>,
    repo: Arc<dyn CandleRepo>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Arc<dyn Metrics>,
    config: Arc<Config>,
    state: Arc<LiveState>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    candle_consumer: Mutex<Option<JoinHandle<()>>>,
}

impl LiveIngestor {
    pub fn new(
        rest: Arc<RestClient>,
        ws: Arc<WsExchangeClient>,
        repo: Arc<dyn CandleRepo>,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Arc<dyn Metrics>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rest,
            ws,
            repo,
            broadcaster,
            metrics,
            config,
            state: Arc::new(LiveState::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            candle_consumer: Mutex::new(None),
        })
    }

    /// Starts resync (once, blocking the returned future) then spawns the
    /// live subscription. Returns once resync has completed for every symbol
    /// and the subscription has started.
    pub async fn run(self: &Arc<Self>, symbols: Vec<String>, interval: Interval) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        for symbol in &symbols {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.resync_symbol(symbol, interval).await;
        }

        // Candles are handed off through one bounded channel into a single
        // consumer task so updates are processed strictly in receive order,
        // instead of racing independently-spawned tasks against each other
        // on `self.state`. Mirrors the send-queue/writer-task split in
        // `server/session.rs`: the producer (the WS read loop, via
        // `on_candle`) never blocks, the consumer drains serially.
        let (candle_tx, mut candle_rx) = mpsc::channel::<(String, Candle)>(CANDLE_CHANNEL_CAPACITY);

        let this = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            while let Some((symbol, candle)) = candle_rx.recv().await {
                this.handle_live_candle(symbol, candle, interval).await;
            }
        });
        *self.candle_consumer.lock() = Some(consumer);

        let drop_metrics = Arc::clone(&self.metrics);
        let on_candle: crate::exchange::ws::OnCandle = Arc::new(move |symbol, candle| {
            if let Err(err) = candle_tx.try_send((symbol, candle)) {
                drop_metrics.incr("ingestor.candle_channel_dropped");
                warn!(error = %err, "candle consumer channel full or closed, dropping update");
            }
        });

        let this = Arc::clone(self);
        let symbols_for_catchup = symbols.clone();
        let on_reconnected: crate::exchange::ws::OnReconnected = Arc::new(move || {
            let this = Arc::clone(&this);
            let symbols = symbols_for_catchup.clone();
            tokio::spawn(async move {
                this.catch_up(&symbols, interval).await;
            });
        });

        self.ws.subscribe(symbols, interval, on_candle, Some(on_reconnected))?;
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.ws.stop().await;
        if let Some(handle) = self.candle_consumer.lock().take() {
            handle.abort();
        }
    }

    // -------------------------------------------------------------------
    // 4.3.1 Resync
    // -------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn resync_symbol(&self, symbol: &str, interval: Interval) {
        let interval_ms = interval.ms();
        let now_ms = now_ms();
        let max_ts = self.repo.max_timestamp(symbol, interval.label()).await;
        let stale_threshold = now_ms - 2 * interval_ms;

        let needs_resync = match max_ts {
            Some(ts) => ts < stale_threshold,
            None => true,
        };
        if !needs_resync {
            if let Some(ts) = max_ts {
                self.state.last_closed.lock().insert(symbol.to_string(), ts);
            }
            return;
        }

        let mut start_open_ms = match max_ts {
            Some(ts) => align_down(ts, interval_ms) + interval_ms,
            None => align_down(now_ms - BOOTSTRAP_CANDLES * interval_ms, interval_ms),
        };

        let mut unchanged_iterations = 0u32;
        let mut last_start_open_ms = start_open_ms;
        let now_open_ms = align_down(now_ms, interval_ms);

        while start_open_ms < now_open_ms {
            if start_open_ms == last_start_open_ms && unchanged_iterations > 0 {
                unchanged_iterations += 1;
            } else {
                unchanged_iterations = 1;
            }
            last_start_open_ms = start_open_ms;
            if unchanged_iterations >= RESYNC_STALL_ITERATIONS {
                warn!(symbol, start_open_ms, "resync stalled, aborting");
                break;
            }

            let end_open_ms = align_down(now_ms(), interval_ms).min(start_open_ms + 1000 * interval_ms);

            let page = match self
                .rest
                .fetch_klines(symbol, interval, start_open_ms / 1000, end_open_ms / 1000, RESYNC_PAGE_LIMIT)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(symbol, error = %err, "resync fetch failed, aborting symbol");
                    break;
                }
            };

            let now_open_ms_trim = align_down(now_ms(), interval_ms);
            let trimmed: Vec<Candle> = page
                .rows
                .into_iter()
                .filter(|c| align_down(c.close_ms, interval_ms) < now_open_ms_trim)
                .collect();

            if trimmed.is_empty() {
                break;
            }

            let persisted = self.repo.upsert_batch(symbol, interval.label(), &trimmed).await;
            if !persisted {
                warn!(symbol, "resync upsert failed, aborting symbol");
                break;
            }
            self.metrics.incr_by("rest_catchup_candles_total", trimmed.len() as u64);

            let last = trimmed.last().expect("trimmed is non-empty");
            let mut broadcast_candle = *last;
            broadcast_candle.is_closed = true;
            self.broadcast_candle(symbol, interval, &broadcast_candle);

            self.state
                .last_closed
                .lock()
                .insert(symbol.to_string(), align_down(last.close_ms, interval_ms));

            let advanced = align_down(last.close_ms, interval_ms) + interval_ms;
            if advanced <= start_open_ms {
                warn!(symbol, "resync failed to advance, aborting");
                break;
            }
            start_open_ms = advanced;
        }
    }

    // -------------------------------------------------------------------
    // 4.3.2 Live subscription
    // -------------------------------------------------------------------

    async fn handle_live_candle(&self, symbol: String, candle: Candle, interval: Interval) {
        let interval_ms = interval.ms();
        let normalized = candle.normalized(interval_ms);
        let key = LiveKey::new(symbol.clone(), interval_ms, normalized.open_ms);

        let (should_persist, should_broadcast) = {
            let mut last_broadcast = self.state.last_broadcast.lock();
            if normalized.is_closed {
                last_broadcast.remove(&key);
                (true, true)
            } else if !self.config.ws_emit_partials {
                last_broadcast.remove(&key);
                (false, false)
            } else if self.config.ws_partial_throttle_ms == 0 {
                last_broadcast.remove(&key);
                (false, true)
            } else {
                let now = Instant::now();
                let throttle = std::time::Duration::from_millis(self.config.ws_partial_throttle_ms);
                let should = match last_broadcast.get(&key) {
                    None => true,
                    Some(last) => now.duration_since(*last) >= throttle,
                };
                if should {
                    last_broadcast.insert(key.clone(), now);
                }
                (false, should)
            }
        };

        if should_persist {
            let persisted = self
                .repo
                .upsert_batch(&symbol, interval.label(), &[normalized])
                .await;
            if !persisted {
                warn!(symbol, open_ms = normalized.open_ms, "failed to persist closed candle");
            } else {
                self.state.last_closed.lock().insert(symbol.clone(), normalized.open_ms);
            }
        }

        if should_broadcast {
            self.broadcast_candle(&symbol, interval, &normalized);
        }
    }

    // -------------------------------------------------------------------
    // 4.3.3 Catch-up on reconnect
    // -------------------------------------------------------------------

    async fn catch_up(&self, symbols: &[String], interval: Interval) {
        let interval_ms = interval.ms();
        let now_open_ms = align_down(now_ms(), interval_ms);
        let mut caught_up_symbols = Vec::new();

        for symbol in symbols {
            let last_closed = self.state.last_closed.lock().get(symbol).copied();
            let Some(last_closed) = last_closed else {
                continue;
            };
            let mut start_open_ms = last_closed + interval_ms;
            if start_open_ms >= now_open_ms {
                continue;
            }

            let mut persisted_any = false;
            while start_open_ms < now_open_ms {
                let end_open_ms = now_open_ms.min(start_open_ms + 1000 * interval_ms);
                let page = match self
                    .rest
                    .fetch_klines(symbol, interval, start_open_ms / 1000, end_open_ms / 1000, RESYNC_PAGE_LIMIT)
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(symbol, error = %err, "catch-up fetch failed, aborting symbol");
                        break;
                    }
                };

                let trimmed: Vec<Candle> = page
                    .rows
                    .into_iter()
                    .filter(|c| align_down(c.close_ms, interval_ms) < now_open_ms)
                    .collect();
                if trimmed.is_empty() {
                    break;
                }

                if !self.repo.upsert_batch(symbol, interval.label(), &trimmed).await {
                    warn!(symbol, "catch-up upsert failed, aborting symbol");
                    break;
                }
                persisted_any = true;
                self.metrics.incr_by("rest_catchup_candles_total", trimmed.len() as u64);

                let last = trimmed.last().expect("trimmed is non-empty");
                let closed_open_ms = align_down(last.close_ms, interval_ms);
                self.state.last_closed.lock().insert(symbol.clone(), closed_open_ms);
                let advanced = closed_open_ms + interval_ms;
                if advanced <= start_open_ms {
                    break;
                }
                start_open_ms = advanced;
            }

            if persisted_any {
                caught_up_symbols.push(symbol.clone());
            }
        }

        if !caught_up_symbols.is_empty() {
            let envelope = serde_json::json!({
                "type": "resync_done",
                "interval": interval.label(),
                "symbols": caught_up_symbols,
            });
            self.broadcaster.broadcast(envelope.to_string());
            info!(symbols = ?caught_up_symbols, "catch-up complete");
        }
    }

    fn broadcast_candle(&self, symbol: &str, interval: Interval, candle: &Candle) {
        let envelope = serde_json::json!({
            "type": "candle",
            "symbol": symbol,
            "interval": interval.label(),
            "final": candle.is_closed,
            "data": [
                candle.open_ms,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.base_volume,
            ],
        });
        self.broadcaster.broadcast(envelope.to_string());
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::AtomicMetrics;
    use crate::repo::InMemoryCandleRepo;
    use std::sync::Mutex as StdMutex;

    struct RecordingBroadcaster {
        messages: StdMutex<Vec<String>>,
    }

    impl RecordingBroadcaster {
        fn new() -> Self {
            Self {
                messages: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn broadcast(&self, json: String) {
            self.messages.lock().unwrap().push(json);
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            binance_ws_host: "stream.binance.com".into(),
            binance_rest_host: "api.binance.com".into(),
            client_ws_bind_addr: "0.0.0.0:8080".into(),
            symbols: vec!["BTCUSDT".into()],
            interval: Interval::OneMinute,
            ws_emit_partials: true,
            ws_partial_throttle_ms: 0,
            rest_default_from_epoch_ms: 0,
            ping_period_ms: 30_000,
            pong_timeout_ms: 75_000,
            inactivity_timeout_ms: 90_000,
            send_queue_max_messages: 500,
            send_queue_max_bytes: 15 * 1024 * 1024,
            send_queue_stall_timeout_ms: 20_000,
        })
    }

    fn candle(open_ms: i64, is_closed: bool) -> Candle {
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
            is_closed,
        }
    }

    fn ingestor_for_test(config: Arc<Config>) -> (Arc<LiveIngestor>, Arc<InMemoryCandleRepo>, Arc<RecordingBroadcaster>) {
        let metrics: Arc<dyn Metrics> = Arc::new(AtomicMetrics::new());
        let repo = Arc::new(InMemoryCandleRepo::new());
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let rest = Arc::new(RestClient::new("api.binance.com".into(), 0, Arc::clone(&metrics)));
        let ws = Arc::new(WsExchangeClient::new("stream.binance.com".into(), Arc::clone(&metrics)));
        let ingestor = LiveIngestor::new(
            rest,
            ws,
            repo.clone() as Arc<dyn CandleRepo>,
            broadcaster.clone() as Arc<dyn Broadcaster>,
            metrics,
            config,
        );
        (ingestor, repo, broadcaster)
    }

    #[tokio::test]
    async fn closed_candle_persists_and_broadcasts_exactly_once() {
        let (ingestor, repo, broadcaster) = ingestor_for_test(test_config());
        ingestor
            .handle_live_candle("BTCUSDT".to_string(), candle(60_000, true), Interval::OneMinute)
            .await;
        assert_eq!(repo.row_count("BTCUSDT", "1m"), 1);
        assert_eq!(broadcaster.messages.lock().unwrap().len(), 1);
        assert_eq!(ingestor.state.last_closed.lock().get("BTCUSDT"), Some(&60_000));
    }

    #[tokio::test]
    async fn partial_updates_disabled_never_broadcast() {
        let mut config = (*test_config()).clone();
        config.ws_emit_partials = false;
        let (ingestor, repo, broadcaster) = ingestor_for_test(Arc::new(config));
        ingestor
            .handle_live_candle("BTCUSDT".to_string(), candle(60_000, false), Interval::OneMinute)
            .await;
        assert_eq!(repo.row_count("BTCUSDT", "1m"), 0);
        assert!(broadcaster.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unthrottled_partials_broadcast_every_update() {
        let (ingestor, _repo, broadcaster) = ingestor_for_test(test_config());
        for _ in 0..3 {
            ingestor
                .handle_live_candle("BTCUSDT".to_string(), candle(60_000, false), Interval::OneMinute)
                .await;
        }
        assert_eq!(broadcaster.messages.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn throttled_partials_collapse_rapid_updates() {
        let mut config = (*test_config()).clone();
        config.ws_partial_throttle_ms = 60_000;
        let (ingestor, _repo, broadcaster) = ingestor_for_test(Arc::new(config));
        for _ in 0..5 {
            ingestor
                .handle_live_candle("BTCUSDT".to_string(), candle(60_000, false), Interval::OneMinute)
                .await;
        }
        // First partial broadcasts; the rest are throttled within the window.
        assert_eq!(broadcaster.messages.lock().unwrap().len(), 1);
    }
}
