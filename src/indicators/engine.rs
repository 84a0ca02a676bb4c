// =============================================================================
// Indicator Engine — per-(timeframe, instrument) incremental indicator sets
// =============================================================================
//
// State layout: `state[tf_idx][instrument] -> Vec<Indicator>` with a secondary
// `tf -> tf_idx` map for O(1) timeframe lookup. The engine is single-owner:
// `process` is the only mutating path on live data, `process_peek` never
// mutates, and reload/restore replace configuration atomically.
//
// Instrument state is created lazily on the first finalized candle seen for
// that (tf, instrument); peeks before that first candle return empty.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Indicator, IndicatorSnapshot, TfIndicatorConfig};
use crate::types::{IndicatorResult, InstrumentKey, TfCandle};

// =============================================================================
// Snapshot types
// =============================================================================

/// Serialized indicator states for one (instrument, tf) cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub token: String,
    pub exchange: String,
    pub tf: u32,
    pub indicators: Vec<IndicatorSnapshot>,
}

/// Whole-engine snapshot, durably written by the checkpointer and read back
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    /// Last delivered stream id per stream name at checkpoint time. Delta
    /// replay resumes strictly after these ids.
    #[serde(default)]
    pub stream_id: HashMap<String, String>,
    pub tokens: Vec<TokenSnapshot>,
}

pub const SNAPSHOT_VERSION: u32 = 1;

/// Outcome of a hot reconfigure: how many indicator instances survived with
/// state intact and how many were freshly created.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReloadStats {
    pub preserved: usize,
    pub created: usize,
}

// =============================================================================
// Engine
// =============================================================================

struct InstrumentState {
    indicators: Vec<Indicator>,
}

impl InstrumentState {
    fn from_configs(cfg: &TfIndicatorConfig) -> Self {
        Self {
            indicators: cfg.indicators.iter().map(Indicator::from_config).collect(),
        }
    }
}

pub struct IndicatorEngine {
    configs: Vec<TfIndicatorConfig>,
    tf_index: HashMap<u32, usize>,
    state: Vec<HashMap<InstrumentKey, InstrumentState>>,
}

impl IndicatorEngine {
    /// Build an engine from validated per-timeframe configs.
    pub fn new(configs: Vec<TfIndicatorConfig>) -> Result<Self> {
        Self::validate(&configs)?;
        let tf_index = configs
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.tf, idx))
            .collect();
        let state = configs.iter().map(|_| HashMap::new()).collect();
        Ok(Self {
            configs,
            tf_index,
            state,
        })
    }

    /// Reject configurations before they reach the engine: non-positive or
    /// duplicate timeframes and non-positive periods.
    pub fn validate(configs: &[TfIndicatorConfig]) -> Result<()> {
        let mut seen = HashSet::new();
        for cfg in configs {
            if cfg.tf == 0 {
                bail!("timeframe must be positive");
            }
            if !seen.insert(cfg.tf) {
                bail!("duplicate timeframe {}", cfg.tf);
            }
            for ind in &cfg.indicators {
                if ind.period == 0 {
                    bail!("indicator {} has non-positive period", ind.kind);
                }
            }
        }
        Ok(())
    }

    pub fn tf_configs(&self) -> &[TfIndicatorConfig] {
        &self.configs
    }

    pub fn enabled_tfs(&self) -> Vec<u32> {
        self.configs.iter().map(|c| c.tf).collect()
    }

    // ── Processing ──────────────────────────────────────────────────────

    /// Fold a finalized candle into every configured indicator for its
    /// (tf, instrument), creating the state lazily on first sight. Returns
    /// one result per indicator in configured order; empty when the
    /// candle's timeframe is not configured.
    pub fn process(&mut self, candle: &TfCandle) -> Vec<IndicatorResult> {
        let Some(&idx) = self.tf_index.get(&candle.tf) else {
            return Vec::new();
        };

        let cfg = &self.configs[idx];
        let entry = self.state[idx]
            .entry(candle.instrument_key())
            .or_insert_with(|| InstrumentState::from_configs(cfg));

        entry
            .indicators
            .iter_mut()
            .map(|ind| {
                ind.update(candle);
                IndicatorResult {
                    name: ind.name(),
                    token: candle.token.clone(),
                    exchange: candle.exchange.clone(),
                    tf: candle.tf,
                    value: ind.value(),
                    ts: candle.ts,
                    ready: ind.ready(),
                    live: false,
                }
            })
            .collect()
    }

    /// Evaluate a forming candle against existing state without mutating it.
    /// Requires prior `process` state for the (tf, instrument); otherwise
    /// returns empty.
    pub fn process_peek(&self, candle: &TfCandle) -> Vec<IndicatorResult> {
        let Some(&idx) = self.tf_index.get(&candle.tf) else {
            return Vec::new();
        };
        let Some(entry) = self.state[idx].get(&candle.instrument_key()) else {
            return Vec::new();
        };

        let close = candle.close_major();
        entry
            .indicators
            .iter()
            .map(|ind| IndicatorResult {
                name: ind.name(),
                token: candle.token.clone(),
                exchange: candle.exchange.clone(),
                tf: candle.tf,
                value: ind.peek(close),
                ts: candle.ts,
                ready: ind.ready(),
                live: true,
            })
            .collect()
    }

    // ── Hot reconfigure ─────────────────────────────────────────────────

    /// Atomically replace the configuration. Per timeframe: an unchanged
    /// indicator set keeps all per-instrument state; a changed set rebuilds
    /// each instrument's list, reusing prior instances by (type, period)
    /// and creating the rest cold. Timeframes absent from the new config
    /// are dropped.
    pub fn reload_configs(&mut self, new_configs: Vec<TfIndicatorConfig>) -> Result<ReloadStats> {
        Self::validate(&new_configs)?;

        let mut stats = ReloadStats::default();
        let mut old_state: HashMap<u32, HashMap<InstrumentKey, InstrumentState>> = self
            .configs
            .iter()
            .zip(self.state.drain(..))
            .map(|(cfg, map)| (cfg.tf, map))
            .collect();
        let old_configs: HashMap<u32, Vec<String>> = self
            .configs
            .iter()
            .map(|c| {
                (
                    c.tf,
                    c.indicators.iter().map(|i| i.state_key()).collect(),
                )
            })
            .collect();

        let mut new_state = Vec::with_capacity(new_configs.len());
        for cfg in &new_configs {
            let new_keys: Vec<String> = cfg.indicators.iter().map(|i| i.state_key()).collect();
            let mut map = old_state.remove(&cfg.tf).unwrap_or_default();

            if old_configs.get(&cfg.tf) == Some(&new_keys) {
                // Identical set: every instance survives untouched.
                stats.preserved += map.values().map(|s| s.indicators.len()).sum::<usize>();
            } else {
                for inst in map.values_mut() {
                    let mut prior: HashMap<String, Indicator> = inst
                        .indicators
                        .drain(..)
                        .map(|ind| (ind.state_key(), ind))
                        .collect();
                    inst.indicators = cfg
                        .indicators
                        .iter()
                        .map(|slot| match prior.remove(&slot.state_key()) {
                            Some(existing) => {
                                stats.preserved += 1;
                                existing
                            }
                            None => {
                                stats.created += 1;
                                Indicator::from_config(slot)
                            }
                        })
                        .collect();
                }
            }
            new_state.push(map);
        }

        self.tf_index = new_configs
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.tf, idx))
            .collect();
        self.configs = new_configs;
        self.state = new_state;

        info!(
            preserved = stats.preserved,
            created = stats.created,
            "indicator engine reconfigured"
        );
        Ok(stats)
    }

    // ── Snapshot / restore ──────────────────────────────────────────────

    /// Serialize every (tf, instrument, indicator) state together with the
    /// stream delivery positions known at checkpoint time.
    pub fn snapshot(&self, stream_id: HashMap<String, String>) -> EngineSnapshot {
        let mut tokens = Vec::new();
        for (cfg, map) in self.configs.iter().zip(&self.state) {
            for (key, inst) in map {
                tokens.push(TokenSnapshot {
                    token: key.token.clone(),
                    exchange: key.exchange.clone(),
                    tf: cfg.tf,
                    indicators: inst.indicators.iter().map(Indicator::snapshot).collect(),
                });
            }
        }
        EngineSnapshot {
            version: SNAPSHOT_VERSION,
            stream_id,
            tokens,
        }
    }

    /// Resume indicator state from a snapshot, matching by (type, period)
    /// within each (tf, instrument). Unmatched configured indicators stay
    /// cold; snapshot entries without a configured slot are silently
    /// dropped. Returns the number of indicator instances restored.
    pub fn restore(&mut self, snapshot: &EngineSnapshot) -> usize {
        let mut restored = 0;
        for tok in &snapshot.tokens {
            let Some(&idx) = self.tf_index.get(&tok.tf) else {
                debug!(tf = tok.tf, "snapshot timeframe no longer configured");
                continue;
            };
            let cfg = &self.configs[idx];
            let key = InstrumentKey::new(tok.exchange.clone(), tok.token.clone());
            let inst = self.state[idx]
                .entry(key)
                .or_insert_with(|| InstrumentState::from_configs(cfg));

            let by_key: HashMap<String, &IndicatorSnapshot> = tok
                .indicators
                .iter()
                .map(|s| (s.state_key(), s))
                .collect();
            for ind in &mut inst.indicators {
                if let Some(snap) = by_key.get(&ind.state_key()) {
                    if ind.restore_from_snapshot(snap) {
                        restored += 1;
                    }
                }
            }
        }
        restored
    }
}

// =============================================================================
// Tests
// =============================================================================
