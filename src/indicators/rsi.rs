// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing, incremental
// =============================================================================
//
// The first close only records prev_close. Closes 2..=period+1 accumulate
// positive gains and losses; at count = period+1 the averages are seeded with
//   avg_gain = Σgain / period,  avg_loss = Σloss / period
// and thereafter Wilder smoothing applies:
//   avg_* = (avg_* * (period - 1) + new_*) / period
//   RS    = avg_gain / avg_loss
//   RSI   = 100 - 100 / (1 + RS)        (avg_loss == 0  =>  RSI = 100)

use super::IndicatorSnapshot;

#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    /// Number of closes seen (not deltas).
    count: u64,
    prev_close: f64,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            count: 0,
            prev_close: 0.0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn update(&mut self, close: f64) {
        self.count += 1;
        if self.count == 1 {
            self.prev_close = close;
            return;
        }

        let delta = close - self.prev_close;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        let count = self.count as usize;
        if count <= self.period {
            self.gain_sum += gain;
            self.loss_sum += loss;
        } else if count == self.period + 1 {
            self.gain_sum += gain;
            self.loss_sum += loss;
            self.avg_gain = self.gain_sum / self.period as f64;
            self.avg_loss = self.loss_sum / self.period as f64;
        } else {
            let p = self.period as f64;
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }

        self.prev_close = close;
    }

    pub fn value(&self) -> f64 {
        if !self.ready() {
            return 0.0;
        }
        Self::rsi_from(self.avg_gain, self.avg_loss)
    }

    pub fn ready(&self) -> bool {
        self.count as usize >= self.period + 1
    }

    /// Hypothetical RSI for a next close. Pre-seed, the partial delta window
    /// extended by the hypothetical delta is used.
    pub fn peek(&self, close: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let delta = close - self.prev_close;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        let p = self.period as f64;

        let next = self.count as usize + 1;
        if next > self.period + 1 {
            let avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            let avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
            Self::rsi_from(avg_gain, avg_loss)
        } else if next == self.period + 1 {
            Self::rsi_from((self.gain_sum + gain) / p, (self.loss_sum + loss) / p)
        } else {
            // next - 1 deltas would exist; average over those.
            let deltas = (next - 1) as f64;
            Self::rsi_from((self.gain_sum + gain) / deltas, (self.loss_sum + loss) / deltas)
        }
    }

    fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
        if avg_loss == 0.0 {
            return 100.0;
        }
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot::Rsi {
            period: self.period,
            count: self.count,
            prev_close: self.prev_close,
            gain_sum: self.gain_sum,
            loss_sum: self.loss_sum,
            avg_gain: self.avg_gain,
            avg_loss: self.avg_loss,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        &mut self,
        count: u64,
        prev_close: f64,
        gain_sum: f64,
        loss_sum: f64,
        avg_gain: f64,
        avg_loss: f64,
    ) {
        self.count = count;
        self.prev_close = prev_close;
        self.gain_sum = gain_sum;
        self.loss_sum = loss_sum;
        self.avg_gain = avg_gain;
        self.avg_loss = avg_loss;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi5_wilder_seed() {
        // Closes 44.00, 44.34, 44.09, 43.61, 44.33, 44.83.
        // Gains: 0.34, 0.72, 0.50 => avg_gain = 1.56 / 5 = 0.312
        // Losses: 0.25, 0.48      => avg_loss = 0.73 / 5 = 0.146
        // RSI = 100 - 100 / (1 + 0.312/0.146) ≈ 68.1
        let mut rsi = Rsi::new(5);
        for c in [44.00, 44.34, 44.09, 43.61, 44.33] {
            rsi.update(c);
            assert!(!rsi.ready());
        }

        rsi.update(44.83);
        assert!(rsi.ready());
        assert!(
            (rsi.value() - 68.1).abs() < 0.1,
            "expected ≈68.1, got {}",
            rsi.value()
        );
    }

    #[test]
    fn all_gains_clamps_to_100() {
        let mut rsi = Rsi::new(5);
        for i in 0..10 {
            rsi.update(100.0 + i as f64);
        }
        assert!(rsi.ready());
        assert!((rsi.value() - 100.0).abs() < 1e-10);
    }

    #[test]
    fn all_losses_approaches_zero() {
        let mut rsi = Rsi::new(5);
        for i in 0..10 {
            rsi.update(100.0 - i as f64);
        }
        assert!(rsi.ready());
        assert!(rsi.value().abs() < 1e-10);
    }

    #[test]
    fn value_stays_in_range() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let mut rsi = Rsi::new(14);
        for c in closes {
            rsi.update(c);
            if rsi.ready() {
                let v = rsi.value();
                assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
            }
        }
    }

    #[test]
    fn peek_matches_update() {
        let mut rsi = Rsi::new(5);
        let closes = [44.00, 44.34, 44.09, 43.61, 44.33, 44.83, 45.10, 44.90];
        for (i, c) in closes.iter().enumerate() {
            if i > 0 {
                let peeked = rsi.peek(*c);
                let snap_before = rsi.snapshot();
                rsi.update(*c);
                if rsi.ready() {
                    assert!(
                        (peeked - rsi.value()).abs() < 1e-12,
                        "peek diverged at input {i}"
                    );
                }
                // Peek must never have mutated prior state.
                let mut replay = Rsi::new(5);
                if let IndicatorSnapshot::Rsi {
                    count,
                    prev_close,
                    gain_sum,
                    loss_sum,
                    avg_gain,
                    avg_loss,
                    ..
                } = snap_before
                {
                    replay.restore(count, prev_close, gain_sum, loss_sum, avg_gain, avg_loss);
                }
                replay.update(*c);
                assert_eq!(replay.value(), rsi.value());
            } else {
                rsi.update(*c);
            }
        }
    }
}
