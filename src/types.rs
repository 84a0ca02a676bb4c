// =============================================================================
// Shared market-data types used across the Aurora market-data core
// =============================================================================
//
// All prices are signed 64-bit integers in minor currency units (paise,
// 1/100 rupee). Quantities and volumes are signed 64-bit integers. Candle
// bucket timestamps are UTC Unix seconds aligned to the bucket size; raw tick
// timestamps keep full nanosecond resolution via `chrono`.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of minor currency units per major unit (paise per rupee).
pub const PRICE_SCALE: i64 = 100;

/// Convert a minor-unit price into major units for indicator math.
pub fn price_to_major(minor: i64) -> f64 {
    minor as f64 / PRICE_SCALE as f64
}

// =============================================================================
// Exchange segments
// =============================================================================

/// Exchange segment as encoded by the upstream feed (`EXTYPE` in
/// `SUBSCRIBE_TOKENS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    Nse,
    Nfo,
    Bse,
    Bfo,
    Mcx,
    Ncx,
    Cde,
}

impl Exchange {
    /// Map the upstream numeric segment code to an exchange.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Nse),
            2 => Some(Self::Nfo),
            3 => Some(Self::Bse),
            4 => Some(Self::Bfo),
            5 => Some(Self::Mcx),
            7 => Some(Self::Ncx),
            13 => Some(Self::Cde),
            _ => None,
        }
    }

    /// Short uppercase name used in stream keys and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nse => "NSE",
            Self::Nfo => "NFO",
            Self::Bse => "BSE",
            Self::Bfo => "BFO",
            Self::Mcx => "MCX",
            Self::Ncx => "NCX",
            Self::Cde => "CDE",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Instrument key
// =============================================================================

/// Composite key identifying one instrument across the pipeline.
///
/// Renders as `EXCHANGE:TOKEN` (e.g. `NSE:3045`) everywhere an instrument is
/// named in keys, channels and logs.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub token: String,
}

impl InstrumentKey {
    pub fn new(exchange: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            token: token.into(),
        }
    }
}

impl std::fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.token)
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A single last-traded-price datum from the upstream feed. Immutable once
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub token: String,
    pub exchange: String,
    /// Last traded price in minor units.
    pub price: i64,
    /// Traded quantity attributed to this tick.
    pub qty: i64,
    /// Timestamp stamped by the feed handler on receipt.
    pub tick_ts: DateTime<Utc>,
    /// Exchange event timestamp, when the upstream provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ts: Option<DateTime<Utc>>,
}

impl Tick {
    /// Canonical event timestamp: `event_ts` when present, else `tick_ts`.
    pub fn canonical_ts(&self) -> DateTime<Utc> {
        self.event_ts.unwrap_or(self.tick_ts)
    }

    /// Whole-second bucket of the canonical timestamp.
    pub fn bucket_sec(&self) -> i64 {
        self.canonical_ts().timestamp()
    }

    pub fn instrument_key(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.clone(), self.token.clone())
    }
}

// =============================================================================
// Candles
// =============================================================================

/// A finalized or forming OHLCV record for one whole-second bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle1s {
    pub token: String,
    pub exchange: String,
    /// Bucket start, UTC Unix seconds.
    pub ts: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub ticks_count: u32,
}

impl Candle1s {
    /// Open a new candle from the first admitted tick of a bucket.
    pub fn open_from_tick(tick: &Tick, bucket: i64) -> Self {
        Self {
            token: tick.token.clone(),
            exchange: tick.exchange.clone(),
            ts: bucket,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.qty,
            ticks_count: 1,
        }
    }

    /// Merge another tick of the same bucket into the candle.
    pub fn merge_tick(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.qty;
        self.ticks_count += 1;
    }

    pub fn instrument_key(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.clone(), self.token.clone())
    }

    /// Close price in major units (indicator input).
    pub fn close_major(&self) -> f64 {
        price_to_major(self.close)
    }
}

/// A candle resampled to a larger timeframe. `forming == true` marks a live
/// preview that will be superseded; a given (instrument, tf, ts) is emitted
/// at most once with `forming == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfCandle {
    pub token: String,
    pub exchange: String,
    /// Bucket start, UTC Unix seconds, aligned to `tf`.
    pub ts: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub ticks_count: u32,
    /// Timeframe length in seconds.
    pub tf: u32,
    /// Number of 1s candles merged into this bucket so far.
    pub count: u32,
    pub forming: bool,
}

impl TfCandle {
    /// Open a new timeframe bucket from its first 1s candle.
    pub fn open_from_1s(c: &Candle1s, tf: u32, bucket: i64) -> Self {
        Self {
            token: c.token.clone(),
            exchange: c.exchange.clone(),
            ts: bucket,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            ticks_count: c.ticks_count,
            tf,
            count: 1,
            forming: true,
        }
    }

    /// Merge a subsequent 1s candle of the same bucket.
    pub fn merge_1s(&mut self, c: &Candle1s) {
        self.high = self.high.max(c.high);
        self.low = self.low.min(c.low);
        self.close = c.close;
        self.volume += c.volume;
        self.ticks_count += c.ticks_count;
        self.count += 1;
    }

    pub fn instrument_key(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.clone(), self.token.clone())
    }

    pub fn close_major(&self) -> f64 {
        price_to_major(self.close)
    }
}

// =============================================================================
// Indicator results
// =============================================================================

/// One computed indicator value for one (instrument, tf, bucket).
///
/// `live == true` marks a value derived from a forming candle; only
/// `ready && !live` results are persisted to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResult {
    /// `TYPE_PERIOD`, e.g. `SMA_20`.
    pub name: String,
    pub token: String,
    pub exchange: String,
    pub tf: u32,
    pub value: f64,
    /// Inherits the source candle's bucket timestamp.
    pub ts: i64,
    pub ready: bool,
    pub live: bool,
}

impl IndicatorResult {
    pub fn instrument_key(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange.clone(), self.token.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tick(price: i64, qty: i64, sec: i64, millis: u32) -> Tick {
        Tick {
            token: "3045".into(),
            exchange: "NSE".into(),
            price,
            qty,
            tick_ts: Utc.timestamp_opt(sec, millis * 1_000_000).unwrap(),
            event_ts: None,
        }
    }

    #[test]
    fn exchange_codes_round_trip() {
        for (code, name) in [
            (1u8, "NSE"),
            (2, "NFO"),
            (3, "BSE"),
            (4, "BFO"),
            (5, "MCX"),
            (7, "NCX"),
            (13, "CDE"),
        ] {
            let ex = Exchange::from_code(code).expect("known code");
            assert_eq!(ex.as_str(), name);
        }
        assert!(Exchange::from_code(6).is_none());
        assert!(Exchange::from_code(0).is_none());
    }

    #[test]
    fn canonical_ts_prefers_event_ts() {
        let mut t = tick(50_000, 10, 1_700_000_000, 0);
        assert_eq!(t.bucket_sec(), 1_700_000_000);

        t.event_ts = Some(Utc.timestamp_opt(1_700_000_005, 0).unwrap());
        assert_eq!(t.bucket_sec(), 1_700_000_005);
    }

    #[test]
    fn candle_merge_preserves_ohlc_invariant() {
        let t0 = tick(50_000, 10, 1_700_000_000, 100);
        let mut c = Candle1s::open_from_tick(&t0, 1_700_000_000);

        c.merge_tick(&tick(50_500, 20, 1_700_000_000, 300));
        c.merge_tick(&tick(49_800, 5, 1_700_000_000, 500));
        c.merge_tick(&tick(50_100, 7, 1_700_000_000, 900));

        assert_eq!(c.open, 50_000);
        assert_eq!(c.high, 50_500);
        assert_eq!(c.low, 49_800);
        assert_eq!(c.close, 50_100);
        assert_eq!(c.volume, 42);
        assert_eq!(c.ticks_count, 4);
        assert!(c.low <= c.open.min(c.close));
        assert!(c.high >= c.open.max(c.close));
    }

    #[test]
    fn tf_candle_merges_1s_sequence() {
        let t = tick(100_00, 1, 1_700_000_000, 0);
        let c1 = Candle1s::open_from_tick(&t, 1_700_000_000);
        let mut c2 = c1.clone();
        c2.ts += 1;
        c2.high = 101_00;
        c2.close = 101_00;

        let mut tf = TfCandle::open_from_1s(&c1, 60, 1_699_999_980);
        tf.merge_1s(&c2);

        assert_eq!(tf.open, c1.open);
        assert_eq!(tf.close, c2.close);
        assert_eq!(tf.high, 101_00);
        assert_eq!(tf.count, 2);
        assert!(tf.forming);
    }

    #[test]
    fn wire_payloads_use_snake_case_fields() {
        let t = tick(50_000, 10, 1_700_000_000, 0);
        let c = Candle1s::open_from_tick(&t, 1_700_000_000);
        let json = serde_json::to_value(&c).unwrap();
        for field in [
            "token",
            "exchange",
            "ts",
            "open",
            "high",
            "low",
            "close",
            "volume",
            "ticks_count",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }

        let tf = TfCandle::open_from_1s(&c, 60, c.ts - c.ts % 60);
        let json = serde_json::to_value(&tf).unwrap();
        assert!(json.get("tf").is_some());
        assert!(json.get("count").is_some());
        assert!(json.get("forming").is_some());
    }

    #[test]
    fn instrument_key_display() {
        let key = InstrumentKey::new("NSE", "3045");
        assert_eq!(key.to_string(), "NSE:3045");
    }
}
