// =============================================================================
// Config — typed process configuration, loaded once from the environment.
// =============================================================================
//
// Every ingestion knob lives here instead of being re-read from `std::env` at
// call sites. Optional values fall back to a default with a logged warning on
// a malformed override; a malformed required value (an unparseable interval
// label, an empty symbol list) is a startup-fatal error.
// =============================================================================

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::types::Interval;

fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %raw, default, "invalid boolean env var, using default");
                default
            }
        },
    }
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!(key, value = %raw, default, "invalid integer env var, using default");
            default
        }),
    }
}

fn parse_env_i64(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
            warn!(key, value = %raw, default, "invalid integer env var, using default");
            default
        }),
    }
}

fn parse_env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Process-wide configuration, read once at startup and shared read-only
/// (`Arc<Config>`) by every worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub binance_ws_host: String,
    pub binance_rest_host: String,
    pub client_ws_bind_addr: String,

    pub symbols: Vec<String>,
    pub interval: Interval,

    pub ws_emit_partials: bool,
    pub ws_partial_throttle_ms: u64,

    pub rest_default_from_epoch_ms: i64,

    pub ping_period_ms: u64,
    pub pong_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,

    pub send_queue_max_messages: usize,
    pub send_queue_max_bytes: usize,
    pub send_queue_stall_timeout_ms: u64,
}

impl Config {
    /// Loads configuration from process environment variables. Call exactly
    /// once, before any worker is spawned.
    pub fn load_from_env() -> Result<Self> {
        let symbols_raw = parse_env_string("SYMBOLS", "BTCUSDT,ETHUSDT");
        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols_raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if symbols.is_empty() {
            bail!("SYMBOLS must contain at least one non-empty symbol");
        }

        let interval_label = parse_env_string("INTERVAL", "1m");
        let interval = Interval::parse(&interval_label)
            .with_context(|| format!("unsupported INTERVAL label: {interval_label}"))?;

        Ok(Self {
            binance_ws_host: parse_env_string("BINANCE_WS_HOST", "stream.binance.com"),
            binance_rest_host: parse_env_string("BINANCE_REST_HOST", "api.binance.com"),
            client_ws_bind_addr: parse_env_string("CLIENT_WS_BIND_ADDR", "0.0.0.0:8080"),
            symbols,
            interval,
            ws_emit_partials: parse_env_bool("WS_EMIT_PARTIALS", true),
            ws_partial_throttle_ms: parse_env_u64("WS_PARTIAL_THROTTLE_MS", 0),
            rest_default_from_epoch_ms: parse_env_i64("REST_DEFAULT_FROM_EPOCH_MS", 0),
            ping_period_ms: parse_env_u64("PING_PERIOD_MS", 30_000),
            pong_timeout_ms: parse_env_u64("PONG_TIMEOUT_MS", 75_000),
            inactivity_timeout_ms: parse_env_u64("INACTIVITY_TIMEOUT_MS", 90_000),
            send_queue_max_messages: parse_env_u64("SEND_QUEUE_MAX_MESSAGES", 500) as usize,
            send_queue_max_bytes: parse_env_u64("SEND_QUEUE_MAX_BYTES", 15 * 1024 * 1024) as usize,
            send_queue_stall_timeout_ms: parse_env_u64("SEND_QUEUE_STALL_TIMEOUT_MS", 20_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "SYMBOLS",
            "INTERVAL",
            "WS_EMIT_PARTIALS",
            "WS_PARTIAL_THROTTLE_MS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let cfg = Config::load_from_env().unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.interval, Interval::OneMinute);
        assert!(cfg.ws_emit_partials);
        assert_eq!(cfg.ws_partial_throttle_ms, 0);
        clear_env();
    }

    #[test]
    fn symbols_are_upper_cased_and_deduped_of_blanks() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("SYMBOLS", "btcusdt, ,ethusdt,");
        let cfg = Config::load_from_env().unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        clear_env();
    }

    #[test]
    fn repeated_symbols_are_deduped_preserving_first_occurrence_order() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("SYMBOLS", "BTCUSDT,ETHUSDT,btcusdt,BTCUSDT");
        let cfg = Config::load_from_env().unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        clear_env();
    }

    #[test]
    fn invalid_interval_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("INTERVAL", "not-an-interval");
        assert!(Config::load_from_env().is_err());
        clear_env();
    }

    #[test]
    fn invalid_bool_falls_back_to_default_with_warning() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("WS_EMIT_PARTIALS", "maybe");
        let cfg = Config::load_from_env().unwrap();
        assert!(cfg.ws_emit_partials);
        clear_env();
    }
}
