// =============================================================================
// Exponential Moving Average (EMA) — incremental
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes;
// until then the running partial average is reported with `ready == false`.

use super::IndicatorSnapshot;

#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    /// Number of closes folded in so far.
    count: u64,
    /// Accumulator for the SMA seed (only meaningful while count <= period).
    seed_sum: f64,
    current: f64,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            count: 0,
            seed_sum: 0.0,
            current: 0.0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn update(&mut self, close: f64) {
        self.count += 1;
        if (self.count as usize) < self.period {
            self.seed_sum += close;
        } else if self.count as usize == self.period {
            self.seed_sum += close;
            self.current = self.seed_sum / self.period as f64;
        } else {
            self.current = close * self.multiplier + self.current * (1.0 - self.multiplier);
        }
    }

    pub fn value(&self) -> f64 {
        if self.count as usize >= self.period {
            self.current
        } else if self.count > 0 {
            self.seed_sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn ready(&self) -> bool {
        self.count as usize >= self.period
    }

    /// Apply the EMA formula to a hypothetical next close without mutating.
    pub fn peek(&self, close: f64) -> f64 {
        let next = self.count as usize + 1;
        if next < self.period {
            (self.seed_sum + close) / next as f64
        } else if next == self.period {
            (self.seed_sum + close) / self.period as f64
        } else {
            close * self.multiplier + self.current * (1.0 - self.multiplier)
        }
    }

    pub fn snapshot(&self) -> IndicatorSnapshot {
        IndicatorSnapshot::Ema {
            period: self.period,
            count: self.count,
            seed_sum: self.seed_sum,
            current: self.current,
        }
    }

    pub fn restore(&mut self, count: u64, seed_sum: f64, current: f64) {
        self.count = count;
        self.seed_sum = seed_sum;
        self.current = current;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema3_seed_and_step() {
        // Inputs 100, 102, 104, 103, 105: ready at step 3 with SMA seed
        // 102.0; step 4 -> 102.5; step 5 -> 103.75 (multiplier = 0.5).
        let mut ema = Ema::new(3);

        ema.update(100.0);
        ema.update(102.0);
        assert!(!ema.ready());

        ema.update(104.0);
        assert!(ema.ready());
        assert!((ema.value() - 102.0).abs() < 1e-10);

        ema.update(103.0);
        assert!((ema.value() - 102.5).abs() < 1e-10);

        ema.update(105.0);
        assert!((ema.value() - 103.75).abs() < 1e-10);
    }

    #[test]
    fn peek_is_pure() {
        let mut ema = Ema::new(3);
        for c in [100.0, 102.0, 104.0] {
            ema.update(c);
        }
        let before = ema.value();
        let peeked = ema.peek(103.0);
        assert!((peeked - 102.5).abs() < 1e-10);
        assert_eq!(ema.value(), before);
    }

    #[test]
    fn peek_matches_update_at_seed_boundary() {
        let mut ema = Ema::new(3);
        ema.update(100.0);
        ema.update(102.0);
        // Next close completes the seed window.
        let peeked = ema.peek(104.0);
        ema.update(104.0);
        assert!((peeked - ema.value()).abs() < 1e-12);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut ema = Ema::new(3);
        for c in [100.0, 102.0, 104.0, 103.0] {
            ema.update(c);
        }
        let snap = ema.snapshot();

        let mut restored = Ema::new(3);
        if let IndicatorSnapshot::Ema {
            count,
            seed_sum,
            current,
            ..
        } = snap
        {
            restored.restore(count, seed_sum, current);
        } else {
            panic!("wrong snapshot variant");
        }

        ema.update(105.0);
        restored.update(105.0);
        assert_eq!(restored.value(), ema.value());
    }
}
