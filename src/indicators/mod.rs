// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Incremental, O(1)-per-update implementations of the indicators computed by
// the engine. Each indicator keeps exactly the scalar state it needs to
// resume deterministically from a snapshot; `peek` evaluates a hypothetical
// next close without mutating that state.

pub mod ema;
pub mod engine;
pub mod rsi;
pub mod sma;
pub mod smma;

pub use engine::{EngineSnapshot, IndicatorEngine, ReloadStats, TokenSnapshot};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::TfCandle;
use ema::Ema;
use rsi::Rsi;
use sma::Sma;
use smma::Smma;

// =============================================================================
// Configuration
// =============================================================================

/// Indicator family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorKind {
    #[serde(rename = "SMA")]
    Sma,
    #[serde(rename = "EMA")]
    Ema,
    #[serde(rename = "SMMA")]
    Smma,
    #[serde(rename = "RSI")]
    Rsi,
}

impl IndicatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sma => "SMA",
            Self::Ema => "EMA",
            Self::Smma => "SMMA",
            Self::Rsi => "RSI",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SMA" => Some(Self::Sma),
            "EMA" => Some(Self::Ema),
            "SMMA" => Some(Self::Smma),
            "RSI" => Some(Self::Rsi),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured indicator slot: a family plus its look-back period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(rename = "type")]
    pub kind: IndicatorKind,
    pub period: usize,
}

impl IndicatorConfig {
    /// Result name, e.g. `SMA_20`.
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind, self.period)
    }

    /// State-matching key used by reload and restore, e.g. `SMA:20`.
    pub fn state_key(&self) -> String {
        format!("{}:{}", self.kind, self.period)
    }

    /// Parse a `TYPE:PERIOD` spec string (the `INDICATOR_CONFIGS` and
    /// `config:indicators` broadcast format).
    pub fn parse(spec: &str) -> Result<Self> {
        let (kind_str, period_str) = spec
            .split_once(':')
            .with_context(|| format!("indicator spec `{spec}` is not TYPE:PERIOD"))?;
        let kind = IndicatorKind::parse(kind_str)
            .with_context(|| format!("unknown indicator type `{kind_str}`"))?;
        let period: usize = period_str
            .trim()
            .parse()
            .with_context(|| format!("indicator period `{period_str}` is not an integer"))?;
        if period == 0 {
            bail!("indicator period must be positive in `{spec}`");
        }
        Ok(Self { kind, period })
    }
}

/// Indicator set configured for one timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfIndicatorConfig {
    pub tf: u32,
    pub indicators: Vec<IndicatorConfig>,
}

/// Parse a flat `TYPE:PERIOD,TYPE:PERIOD,…` list.
pub fn parse_spec_list(csv: &str) -> Result<Vec<IndicatorConfig>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(IndicatorConfig::parse)
        .collect()
}

// =============================================================================
// Snapshots
// =============================================================================

/// Serialized scalar state of one indicator, sufficient for deterministic
/// resume. Matching on restore/reload is by (type, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndicatorSnapshot {
    #[serde(rename = "SMA")]
    Sma {
        period: usize,
        /// Window values, oldest first.
        values: Vec<f64>,
        sum: f64,
    },
    #[serde(rename = "EMA")]
    Ema {
        period: usize,
        count: u64,
        seed_sum: f64,
        current: f64,
    },
    #[serde(rename = "SMMA")]
    Smma {
        period: usize,
        count: u64,
        seed_sum: f64,
        current: f64,
    },
    #[serde(rename = "RSI")]
    Rsi {
        period: usize,
        count: u64,
        prev_close: f64,
        gain_sum: f64,
        loss_sum: f64,
        avg_gain: f64,
        avg_loss: f64,
    },
}

impl IndicatorSnapshot {
    /// State-matching key, e.g. `RSI:14`.
    pub fn state_key(&self) -> String {
        match self {
            Self::Sma { period, .. } => format!("SMA:{period}"),
            Self::Ema { period, .. } => format!("EMA:{period}"),
            Self::Smma { period, .. } => format!("SMMA:{period}"),
            Self::Rsi { period, .. } => format!("RSI:{period}"),
        }
    }
}

// =============================================================================
// Indicator dispatch
// =============================================================================

/// Tagged-variant dispatch over the concrete indicator implementations.
/// All updates are O(1); `peek` never mutates.
#[derive(Debug, Clone)]
pub enum Indicator {
    Sma(Sma),
    Ema(Ema),
    Smma(Smma),
    Rsi(Rsi),
}

impl Indicator {
    /// Instantiate a cold indicator from its config slot.
    pub fn from_config(cfg: &IndicatorConfig) -> Self {
        match cfg.kind {
            IndicatorKind::Sma => Self::Sma(Sma::new(cfg.period)),
            IndicatorKind::Ema => Self::Ema(Ema::new(cfg.period)),
            IndicatorKind::Smma => Self::Smma(Smma::new(cfg.period)),
            IndicatorKind::Rsi => Self::Rsi(Rsi::new(cfg.period)),
        }
    }

    /// Result name, e.g. `EMA_9`.
    pub fn name(&self) -> String {
        match self {
            Self::Sma(i) => format!("SMA_{}", i.period()),
            Self::Ema(i) => format!("EMA_{}", i.period()),
            Self::Smma(i) => format!("SMMA_{}", i.period()),
            Self::Rsi(i) => format!("RSI_{}", i.period()),
        }
    }

    /// State-matching key, e.g. `EMA:9`.
    pub fn state_key(&self) -> String {
        match self {
            Self::Sma(i) => format!("SMA:{}", i.period()),
            Self::Ema(i) => format!("EMA:{}", i.period()),
            Self::Smma(i) => format!("SMMA:{}", i.period()),
            Self::Rsi(i) => format!("RSI:{}", i.period()),
        }
    }

    /// Fold a finalized candle into the indicator state.
    pub fn update(&mut self, candle: &TfCandle) {
        let close = candle.close_major();
        match self {
            Self::Sma(i) => i.update(close),
            Self::Ema(i) => i.update(close),
            Self::Smma(i) => i.update(close),
            Self::Rsi(i) => i.update(close),
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Self::Sma(i) => i.value(),
            Self::Ema(i) => i.value(),
            Self::Smma(i) => i.value(),
            Self::Rsi(i) => i.value(),
        }
    }

    pub fn ready(&self) -> bool {
        match self {
            Self::Sma(i) => i.ready(),
            Self::Ema(i) => i.ready(),
            Self::Smma(i) => i.ready(),
            Self::Rsi(i) => i.ready(),
        }
    }

    /// Hypothetical value if `close` were folded in next. Non-mutating.
    pub fn peek(&self, close: f64) -> f64 {
        match self {
            Self::Sma(i) => i.peek(close),
            Self::Ema(i) => i.peek(close),
            Self::Smma(i) => i.peek(close),
            Self::Rsi(i) => i.peek(close),
        }
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        match self {
            Self::Sma(i) => i.snapshot(),
            Self::Ema(i) => i.snapshot(),
            Self::Smma(i) => i.snapshot(),
            Self::Rsi(i) => i.snapshot(),
        }
    }

    /// Restore state from a snapshot. Returns false (leaving the indicator
    /// cold) when the snapshot's type or period does not match.
    pub fn restore_from_snapshot(&mut self, snap: &IndicatorSnapshot) -> bool {
        match (self, snap) {
            (Self::Sma(i), IndicatorSnapshot::Sma { period, values, sum })
                if *period == i.period() =>
            {
                i.restore(values, *sum);
                true
            }
            (
                Self::Ema(i),
                IndicatorSnapshot::Ema {
                    period,
                    count,
                    seed_sum,
                    current,
                },
            ) if *period == i.period() => {
                i.restore(*count, *seed_sum, *current);
                true
            }
            (
                Self::Smma(i),
                IndicatorSnapshot::Smma {
                    period,
                    count,
                    seed_sum,
                    current,
                },
            ) if *period == i.period() => {
                i.restore(*count, *seed_sum, *current);
                true
            }
            (
                Self::Rsi(i),
                IndicatorSnapshot::Rsi {
                    period,
                    count,
                    prev_close,
                    gain_sum,
                    loss_sum,
                    avg_gain,
                    avg_loss,
                },
            ) if *period == i.period() => {
                i.restore(*count, *prev_close, *gain_sum, *loss_sum, *avg_gain, *avg_loss);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let cfg = IndicatorConfig::parse("SMA:9").unwrap();
        assert_eq!(cfg.kind, IndicatorKind::Sma);
        assert_eq!(cfg.period, 9);
        assert_eq!(cfg.name(), "SMA_9");
        assert_eq!(cfg.state_key(), "SMA:9");

        assert!(IndicatorConfig::parse("MACD:12").is_err());
        assert!(IndicatorConfig::parse("SMA:0").is_err());
        assert!(IndicatorConfig::parse("SMA").is_err());
        assert!(IndicatorConfig::parse("SMA:x").is_err());
    }

    #[test]
    fn spec_list_parsing() {
        let list = parse_spec_list("SMA:9, EMA:21 ,RSI:14").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[2].name(), "RSI_14");

        // Empty segments are skipped, not errors.
        let list = parse_spec_list("SMA:9,,EMA:21,").unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snap = IndicatorSnapshot::Rsi {
            period: 14,
            count: 20,
            prev_close: 101.5,
            gain_sum: 3.2,
            loss_sum: 1.1,
            avg_gain: 0.25,
            avg_loss: 0.1,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"type\":\"RSI\""));
        let back: IndicatorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.state_key(), "RSI:14");
    }

    #[test]
    fn restore_rejects_mismatched_period() {
        let mut ind = Indicator::from_config(&IndicatorConfig {
            kind: IndicatorKind::Sma,
            period: 5,
        });
        let snap = IndicatorSnapshot::Sma {
            period: 9,
            values: vec![1.0],
            sum: 1.0,
        };
        assert!(!ind.restore_from_snapshot(&snap));
    }
}
