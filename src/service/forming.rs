// =============================================================================
// Live forming-TF synthesis — 1s pub/sub candles into peek previews
// =============================================================================
//
// Mirrors the timeframe builder's merge rules but keeps only transient state:
// the synthesized candles exist purely to drive `ProcessPeek`, never to be
// persisted. When a 1s candle crosses into a new bucket the old forming
// state is simply replaced — the finalized version of that bucket arrives
// authoritatively via the durable stream path.

use std::collections::HashMap;

use crate::types::{Candle1s, InstrumentKey, TfCandle};

#[derive(Default)]
pub struct FormingSynth {
    state: HashMap<(u32, InstrumentKey), TfCandle>,
}

impl FormingSynth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one live 1s candle and return the forming snapshot per
    /// timeframe.
    pub fn on_1s(&mut self, candle: &Candle1s, tfs: &[u32]) -> Vec<TfCandle> {
        let key = candle.instrument_key();
        let mut out = Vec::with_capacity(tfs.len());

        for &tf in tfs {
            let bucket = candle.ts - candle.ts.rem_euclid(tf as i64);
            let slot = (tf, key.clone());

            match self.state.get_mut(&slot) {
                Some(forming) if forming.ts == bucket => {
                    forming.merge_1s(candle);
                    out.push(forming.clone());
                }
                _ => {
                    // New bucket (or stale state from before a gap): reset.
                    let fresh = TfCandle::open_from_1s(candle, tf, bucket);
                    out.push(fresh.clone());
                    self.state.insert(slot, fresh);
                }
            }
        }

        // Drop state for timeframes that were reconfigured away.
        self.state.retain(|(tf, _), _| tfs.contains(tf));
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_100; // multiple of 300

    fn candle_1s(ts: i64, close: i64) -> Candle1s {
        Candle1s {
            token: "3045".into(),
            exchange: "NSE".into(),
            ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
            ticks_count: 1,
        }
    }

    #[test]
    fn merges_within_bucket_and_resets_across() {
        let mut synth = FormingSynth::new();

        let first = synth.on_1s(&candle_1s(T0, 100_00), &[60]);
        assert_eq!(first[0].count, 1);
        assert!(first[0].forming);

        let second = synth.on_1s(&candle_1s(T0 + 1, 101_00), &[60]);
        assert_eq!(second[0].count, 2);
        assert_eq!(second[0].close, 101_00);
        assert_eq!(second[0].open, 100_00);

        // Next bucket: state resets rather than finalizing.
        let third = synth.on_1s(&candle_1s(T0 + 60, 102_00), &[60]);
        assert_eq!(third[0].count, 1);
        assert_eq!(third[0].ts, T0 + 60);
    }

    #[test]
    fn one_snapshot_per_timeframe() {
        let mut synth = FormingSynth::new();
        let out = synth.on_1s(&candle_1s(T0 + 30, 100_00), &[60, 300]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tf, 60);
        assert_eq!(out[0].ts, T0);
        assert_eq!(out[1].tf, 300);
        assert_eq!(out[1].ts, T0);
    }

    #[test]
    fn removed_tf_state_is_evicted() {
        let mut synth = FormingSynth::new();
        synth.on_1s(&candle_1s(T0, 100_00), &[60, 300]);
        assert_eq!(synth.state.len(), 2);

        synth.on_1s(&candle_1s(T0 + 1, 100_00), &[60]);
        assert_eq!(synth.state.len(), 1);
    }
}
