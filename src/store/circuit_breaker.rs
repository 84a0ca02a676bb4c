// =============================================================================
// Circuit Breaker — failure isolation for the durable write path
// =============================================================================
//
// States: Closed -> (N consecutive failures) -> Open -> (reset timeout) ->
// HalfOpen (single probe) -> Closed on success / Open on failure.
//
// While the circuit is not accepting writes, operations are parked in a
// bounded buffer (oldest evicted on overflow). The transition back to Closed
// drains the buffer and hands it to the caller for asynchronous replay
// through the underlying writer; `on_flush(n)` fires exactly once per drain.
//
// The breaker itself never executes anything. Callers ask for admission,
// run the operation, and report the outcome:
//
//   match breaker.admit(op) {
//       Admission::Execute(op) => match writer.execute(&op).await {
//           Ok(_)  => for op in breaker.on_success() { /* replay */ },
//           Err(_) => breaker.on_failure(),
//       },
//       Admission::Buffered => { /* counted, caller sees CircuitOpen */ }
//   }
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::metrics::{PipelineMetrics, BREAKER_CLOSED, BREAKER_HALF_OPEN, BREAKER_OPEN};

/// Default bound on the parked-write buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge(self) -> u8 {
        match self {
            Self::Closed => BREAKER_CLOSED,
            Self::Open => BREAKER_OPEN,
            Self::HalfOpen => BREAKER_HALF_OPEN,
        }
    }
}

/// Admission verdict for one operation.
#[derive(Debug)]
pub enum Admission<Op> {
    /// Run it now (normal traffic, or the single half-open probe).
    Execute(Op),
    /// Circuit is open (or a probe is already in flight); the op was parked.
    Buffered,
}

pub type StateChangeHook = Box<dyn Fn(BreakerState) + Send + Sync>;
pub type FlushHook = Box<dyn Fn(usize) + Send + Sync>;

struct Inner<Op> {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    /// True while the half-open probe is executing.
    probe_in_flight: bool,
    buffer: VecDeque<Op>,
}

pub struct CircuitBreaker<Op> {
    inner: Mutex<Inner<Op>>,
    max_failures: u32,
    reset_timeout: Duration,
    buffer_capacity: usize,
    metrics: Arc<PipelineMetrics>,
    on_state_change: Option<StateChangeHook>,
    on_flush: Option<FlushHook>,
}

impl<Op> CircuitBreaker<Op> {
    pub fn new(max_failures: u32, reset_timeout: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: Instant::now(),
                probe_in_flight: false,
                buffer: VecDeque::new(),
            }),
            max_failures,
            reset_timeout,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            metrics,
            on_state_change: None,
            on_flush: None,
        }
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_state_change_hook(mut self, hook: StateChangeHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }

    pub fn with_flush_hook(mut self, hook: FlushHook) -> Self {
        self.on_flush = Some(hook);
        self
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    // ── Admission ───────────────────────────────────────────────────────

    pub fn admit(&self, op: Op) -> Admission<Op> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Execute(op),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.reset_timeout {
                    // Reset elapsed: let exactly one probe through.
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Admission::Execute(op)
                } else {
                    self.park(&mut inner, op);
                    Admission::Buffered
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    self.park(&mut inner, op);
                    Admission::Buffered
                } else {
                    inner.probe_in_flight = true;
                    Admission::Execute(op)
                }
            }
        }
    }

    // ── Outcome reporting ───────────────────────────────────────────────

    /// Record a successful write. On the transition back to Closed the
    /// parked buffer is drained and returned for replay; `on_flush` fires
    /// with the drained count.
    pub fn on_success(&self) -> Vec<Op> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;

        let was_recovering = inner.state != BreakerState::Closed;
        if was_recovering {
            self.transition(&mut inner, BreakerState::Closed);
        }

        if inner.buffer.is_empty() {
            return Vec::new();
        }
        let drained: Vec<Op> = inner.buffer.drain(..).collect();
        drop(inner);

        info!(count = drained.len(), "circuit closed, draining buffered writes");
        if let Some(hook) = &self.on_flush {
            hook(drained.len());
        }
        drained
    }

    /// Record a failed write.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.max_failures {
                    inner.opened_at = Instant::now();
                    self.metrics.breaker_trips.fetch_add(1, Ordering::Relaxed);
                    self.transition(&mut inner, BreakerState::Open);
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker tripped open"
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: back to Open, restart the reset clock.
                inner.opened_at = Instant::now();
                self.transition(&mut inner, BreakerState::Open);
                warn!("circuit breaker probe failed, reopening");
            }
            BreakerState::Open => {}
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn park(&self, inner: &mut Inner<Op>, op: Op) {
        if inner.buffer.len() >= self.buffer_capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(op);
    }

    fn transition(&self, inner: &mut Inner<Op>, to: BreakerState) {
        if inner.state == to {
            return;
        }
        inner.state = to;
        self.metrics.breaker_state.store(to.gauge(), Ordering::Relaxed);
        if let Some(hook) = &self.on_state_change {
            hook(to);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
