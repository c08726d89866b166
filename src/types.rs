// =============================================================================
// Domain types — Candle, Interval, LiveKey, and the wire-format kline shapes.
// =============================================================================
//
// Binance (and most exchanges modeled after it) send numeric fields as either
// JSON strings or JSON numbers depending on endpoint and API version. `NumOrStr`
// accepts both so downstream code never has to special-case the wire format.
// =============================================================================

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// A single OHLCV bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_ms: i64,
    pub close_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    pub trades: u64,
    pub is_closed: bool,
}

impl Candle {
    /// Aligns `open_ms` down to the interval boundary and derives `close_ms`
    /// from it, preserving `is_closed` and the OHLCV fields as given.
    pub fn normalized(mut self, interval_ms: i64) -> Self {
        if interval_ms > 0 {
            self.open_ms = align_down(self.open_ms, interval_ms);
            if self.open_ms > 0 {
                self.close_ms = self.open_ms + interval_ms - 1;
            }
        }
        self
    }
}

/// Floors `value` down to the nearest multiple of `step`. `step` must be positive.
pub fn align_down(value: i64, step: i64) -> i64 {
    debug_assert!(step > 0);
    value.div_euclid(step) * step
}

/// Closed set of supported interval labels. Only `OneMinute` is valid for live
/// streaming (§4.2); the others exist for REST backfill/resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    TwelveHours,
    OneDay,
    OneWeek,
}

impl Interval {
    pub const fn ms(self) -> i64 {
        match self {
            Interval::OneMinute => 60_000,
            Interval::ThreeMinutes => 3 * 60_000,
            Interval::FiveMinutes => 5 * 60_000,
            Interval::FifteenMinutes => 15 * 60_000,
            Interval::ThirtyMinutes => 30 * 60_000,
            Interval::OneHour => 60 * 60_000,
            Interval::TwoHours => 2 * 60 * 60_000,
            Interval::FourHours => 4 * 60 * 60_000,
            Interval::SixHours => 6 * 60 * 60_000,
            Interval::TwelveHours => 12 * 60 * 60_000,
            Interval::OneDay => 24 * 60 * 60_000,
            Interval::OneWeek => 7 * 24 * 60 * 60_000,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::OneWeek => "1w",
        }
    }

    /// Parses a canonical or commonly-aliased label. Unknown labels are
    /// rejected here rather than carried as an invalid variant downstream.
    pub fn parse(label: &str) -> Option<Interval> {
        let normalized = label.trim().to_lowercase();
        Some(match normalized.as_str() {
            "1m" | "1min" | "1minute" => Interval::OneMinute,
            "3m" | "3min" | "3minute" => Interval::ThreeMinutes,
            "5m" | "5min" | "5minute" => Interval::FiveMinutes,
            "15m" | "15min" | "15minute" => Interval::FifteenMinutes,
            "30m" | "30min" | "30minute" => Interval::ThirtyMinutes,
            "1h" | "60m" => Interval::OneHour,
            "2h" | "120m" => Interval::TwoHours,
            "4h" | "240m" => Interval::FourHours,
            "6h" | "360m" => Interval::SixHours,
            "12h" | "720m" => Interval::TwelveHours,
            "1d" | "1day" | "24h" => Interval::OneDay,
            "1w" | "1week" => Interval::OneWeek,
            _ => return None,
        })
    }

    /// Only interval currently supported for live streaming.
    pub fn is_live_supported(self) -> bool {
        matches!(self, Interval::OneMinute)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dedup composite key for in-progress candles: `(symbol, intervalMs, openMs)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LiveKey {
    pub symbol: String,
    pub interval_ms: i64,
    pub open_ms: i64,
}

impl LiveKey {
    pub fn new(symbol: impl Into<String>, interval_ms: i64, open_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            interval_ms,
            open_ms,
        }
    }
}

// -----------------------------------------------------------------------------
// Wire format: Binance combined-stream kline frame.
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsKlineEnvelope {
    pub data: WsKlineData,
}

#[derive(Debug, Deserialize)]
pub struct WsKlineData {
    pub s: String,
    pub k: WsKline,
}

#[derive(Debug, Deserialize)]
pub struct WsKline {
    #[serde(rename = "t")]
    pub open_ms: i64,
    #[serde(rename = "T")]
    pub close_ms: i64,
    #[serde(rename = "o")]
    pub open: NumOrStr,
    #[serde(rename = "h")]
    pub high: NumOrStr,
    #[serde(rename = "l")]
    pub low: NumOrStr,
    #[serde(rename = "c")]
    pub close: NumOrStr,
    #[serde(rename = "v")]
    pub base_volume: NumOrStr,
    #[serde(rename = "q", default)]
    pub quote_volume: Option<NumOrStr>,
    #[serde(rename = "n", default)]
    pub trades: Option<u64>,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl WsKline {
    pub fn into_candle(self) -> Candle {
        Candle {
            open_ms: self.open_ms,
            close_ms: self.close_ms,
            open: self.open.0,
            high: self.high.0,
            low: self.low.0,
            close: self.close.0,
            base_volume: self.base_volume.0,
            quote_volume: self.quote_volume.map(|v| v.0).unwrap_or(0.0),
            trades: self.trades.unwrap_or(0),
            is_closed: self.is_closed,
        }
    }
}

/// A JSON value that may arrive as either a number or a numeric string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumOrStr(pub f64);

impl<'de> Deserialize<'de> for NumOrStr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NumOrStrVisitor;

        impl<'de> Visitor<'de> for NumOrStrVisitor {
            type Value = NumOrStr;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number or a numeric string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(NumOrStr(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(NumOrStr(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(NumOrStr(v as f64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse::<f64>()
                    .map(NumOrStr)
                    .map_err(|_| E::custom(format!("invalid numeric string: {v}")))
            }
        }

        deserializer.deserialize_any(NumOrStrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_floors_to_interval_boundary() {
        assert_eq!(align_down(125_000, 60_000), 120_000);
        assert_eq!(align_down(60_000, 60_000), 60_000);
        assert_eq!(align_down(0, 60_000), 0);
    }

    #[test]
    fn interval_parse_accepts_known_aliases() {
        assert_eq!(Interval::parse("1m"), Some(Interval::OneMinute));
        assert_eq!(Interval::parse("60m"), Some(Interval::OneHour));
        assert_eq!(Interval::parse("1Day"), Some(Interval::OneDay));
        assert_eq!(Interval::parse("bogus"), None);
    }

    #[test]
    fn interval_label_round_trips() {
        for interval in [
            Interval::OneMinute,
            Interval::FiveMinutes,
            Interval::OneHour,
            Interval::OneDay,
            Interval::OneWeek,
        ] {
            assert_eq!(Interval::parse(interval.label()), Some(interval));
        }
    }

    #[test]
    fn num_or_str_accepts_both_representations() {
        let from_str: NumOrStr = serde_json::from_str(r#""123.45""#).unwrap();
        let from_num: NumOrStr = serde_json::from_str("123.45").unwrap();
        assert_eq!(from_str.0, from_num.0);
    }

    #[test]
    fn ws_kline_envelope_parses_mixed_numeric_forms() {
        let json = r#"{
            "data": {
                "s": "btcusdt",
                "k": {
                    "t": 1000, "T": 1059, "o": "1.0", "h": 2.0, "l": "0.5",
                    "c": "1.5", "v": "10.0", "q": 15.0, "n": 4, "x": false
                }
            }
        }"#;
        let envelope: WsKlineEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.data.s, "btcusdt");
        let candle = envelope.data.k.into_candle();
        assert_eq!(candle.open_ms, 1000);
        assert_eq!(candle.open, 1.0);
        assert_eq!(candle.trades, 4);
        assert!(!candle.is_closed);
    }

    #[test]
    fn candle_normalized_aligns_and_derives_close() {
        let candle = Candle {
            open_ms: 125_000,
            close_ms: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            base_volume: 0.0,
            quote_volume: 0.0,
            trades: 0,
            is_closed: false,
        }
        .normalized(60_000);
        assert_eq!(candle.open_ms, 120_000);
        assert_eq!(candle.close_ms, 179_999);
    }
}
