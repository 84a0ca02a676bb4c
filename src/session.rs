// =============================================================================
// Market Session Controller — schedule-gated feed ingress
// =============================================================================
//
// State machine, one cycle per trading day:
//
//   ClosedWaiting -> PreOpenWarm (open - 5 min): TOTP login with exponential
//   backoff capped at 5 min -> AwaitConnect (hold until open - 1 min) ->
//   ConnectedOpen: WebSocket ingress with a hard deadline of close +
//   max_grace -> SmartClose: disconnect once the last traded price has been
//   still for `stable_for`, or at the hard deadline -> Disconnected: flush
//   the forming 1s and TF candles, then wait for the next trading day.
//
// The trading calendar is Mon–Fri in IST (fixed +05:30, no DST) minus the
// configured holiday set.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc, Weekday};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::feed::{self, LoginClient, TickObserver};
use crate::metrics::PipelineMetrics;
use crate::ring::Producer;
use crate::types::Tick;

/// Exchange-local offset: IST, +05:30, DST-free.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Warm-up lead before open, seconds.
const PRE_OPEN_WARM_SECS: i64 = 300;
/// Connect lead before open, seconds.
const CONNECT_LEAD_SECS: i64 = 60;
/// Login backoff ceiling, seconds.
const LOGIN_BACKOFF_CAP_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    ClosedWaiting,
    PreOpenWarm,
    AwaitConnect,
    ConnectedOpen,
    SmartClose,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ClosedWaiting => "ClosedWaiting",
            Self::PreOpenWarm => "PreOpenWarm",
            Self::AwaitConnect => "AwaitConnect",
            Self::ConnectedOpen => "ConnectedOpen",
            Self::SmartClose => "SmartClose",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Trading calendar
// =============================================================================

pub struct TradingCalendar {
    config: SessionConfig,
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(config: SessionConfig) -> Self {
        let holidays = config.holidays.iter().copied().collect();
        Self { config, holidays }
    }

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(IST_OFFSET_SECS).expect("valid IST offset")
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// (open, close) of the session on `date`, as UTC instants.
    pub fn session_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let ist = Self::ist();
        let open = date
            .and_time(self.config.open)
            .and_local_timezone(ist)
            .single()
            .expect("fixed offset is unambiguous")
            .with_timezone(&Utc);
        let close = date
            .and_time(self.config.close)
            .and_local_timezone(ist)
            .single()
            .expect("fixed offset is unambiguous")
            .with_timezone(&Utc);
        (open, close)
    }

    /// Bounds of the next session whose close is still ahead of `now`.
    pub fn next_session(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let mut date = now.with_timezone(&Self::ist()).date_naive();
        // A year's worth of days covers any holiday run.
        for _ in 0..370 {
            if self.is_trading_day(date) {
                let (open, close) = self.session_bounds(date);
                if close > now {
                    return (open, close);
                }
            }
            date = date.succ_opt().expect("date within range");
        }
        unreachable!("no trading day found within a year");
    }
}

// =============================================================================
// Close detector
// =============================================================================

/// Signals disconnect when the last traded price has been unchanged for
/// `stable_for`, or unconditionally past the hard deadline.
pub struct CloseDetector {
    last_price: Option<i64>,
    stable_since: DateTime<Utc>,
    stable_for: ChronoDuration,
    deadline: DateTime<Utc>,
}

impl CloseDetector {
    pub fn new(stable_for_secs: u64, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            last_price: None,
            stable_since: now,
            stable_for: ChronoDuration::seconds(stable_for_secs as i64),
            deadline,
        }
    }

    /// Fold in one observed trade price.
    pub fn observe(&mut self, price: i64, now: DateTime<Utc>) {
        if self.last_price != Some(price) {
            self.last_price = Some(price);
            self.stable_since = now;
        }
    }

    /// True once the price has stabilized long enough, or the deadline has
    /// passed.
    pub fn should_disconnect(&self, now: DateTime<Utc>) -> bool {
        if now > self.deadline {
            return true;
        }
        self.last_price.is_some() && now - self.stable_since >= self.stable_for
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct SessionController {
    calendar: TradingCalendar,
    login: LoginClient,
    stable_for_secs: u64,
    max_grace_secs: u64,
    metrics: Arc<PipelineMetrics>,
}

impl SessionController {
    pub fn new(
        session: SessionConfig,
        login: LoginClient,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let stable_for_secs = session.stable_for_secs;
        let max_grace_secs = session.max_grace_secs;
        Self {
            calendar: TradingCalendar::new(session),
            login,
            stable_for_secs,
            max_grace_secs,
            metrics,
        }
    }

    /// Run the controller until cancelled. `flush_*` are signalled at every
    /// session end so the aggregator and TF builder finalize their forming
    /// candles.
    pub async fn run(
        self,
        producer: Producer<Tick>,
        flush_aggregator: mpsc::Sender<()>,
        flush_tf: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let now = Utc::now();
            let (open, close) = self.calendar.next_session(now);
            info!(state = %SessionState::ClosedWaiting, open = %open, close = %close, "waiting for next session");

            if !sleep_until(open - ChronoDuration::seconds(PRE_OPEN_WARM_SECS), &cancel).await {
                return;
            }

            // ── PreOpenWarm: establish the upstream session ──────────
            info!(state = %SessionState::PreOpenWarm, "warming up upstream session");
            let tokens = match self.login_with_backoff(close, &cancel).await {
                Some(tokens) => tokens,
                None => {
                    warn!("session warm-up abandoned, skipping trading day");
                    continue;
                }
            };

            // ── AwaitConnect: hold until just before open ────────────
            info!(state = %SessionState::AwaitConnect, "session ready, awaiting connect window");
            if !sleep_until(open - ChronoDuration::seconds(CONNECT_LEAD_SECS), &cancel).await {
                return;
            }

            // ── ConnectedOpen: attach the feed under a hard deadline ─
            let deadline = close + ChronoDuration::seconds(self.max_grace_secs as i64);
            info!(state = %SessionState::ConnectedOpen, deadline = %deadline, "attaching tick feed");
            self.metrics
                .market_open
                .store(true, std::sync::atomic::Ordering::Relaxed);

            let detector = Arc::new(Mutex::new(CloseDetector::new(
                self.stable_for_secs,
                deadline,
                Utc::now(),
            )));
            let observer: TickObserver = {
                let detector = detector.clone();
                Arc::new(move |tick: &Tick| {
                    detector.lock().observe(tick.price, Utc::now());
                })
            };

            let url = self.login.feed_url(&tokens);
            let child = cancel.child_token();
            let feed = feed::run_feed_loop(
                &url,
                &producer,
                &self.metrics,
                Some(observer),
                child.clone(),
            );
            tokio::pin!(feed);

            let mut in_smart_close = false;
            loop {
                tokio::select! {
                    _ = &mut feed => break,
                    _ = cancel.cancelled() => {
                        child.cancel();
                        (&mut feed).await;
                        break;
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                        let now = Utc::now();
                        if !in_smart_close && now >= close {
                            in_smart_close = true;
                            info!(state = %SessionState::SmartClose, "scheduled close reached, watching for stabilization");
                        }
                        let fire = now > deadline
                            || (in_smart_close && detector.lock().should_disconnect(now));
                        if fire {
                            child.cancel();
                        }
                    }
                }
            }

            // ── Disconnected: flush forming candles, next day ────────
            self.metrics
                .market_open
                .store(false, std::sync::atomic::Ordering::Relaxed);
            let _ = flush_aggregator.try_send(());
            let _ = flush_tf.try_send(());
            info!(state = %SessionState::Disconnected, "session closed, forming candles flushed");
        }
    }

    async fn login_with_backoff(
        &self,
        close: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Option<feed::SessionTokens> {
        let mut backoff_secs = 1u64;
        loop {
            match self.login.login().await {
                Ok(tokens) => return Some(tokens),
                Err(e) => {
                    warn!(error = %e, retry_in_secs = backoff_secs, "upstream login failed");
                }
            }
            if Utc::now() > close {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(LOGIN_BACKOFF_CAP_SECS);
        }
    }
}

/// Sleep until a UTC instant; false when cancelled first.
async fn sleep_until(target: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    let now = Utc::now();
    if target <= now {
        return true;
    }
    let dur = (target - now).to_std().unwrap_or_default();
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn calendar(holidays: Vec<NaiveDate>) -> TradingCalendar {
        TradingCalendar::new(SessionConfig {
            open: NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            close: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            holidays,
            stable_for_secs: 30,
            max_grace_secs: 300,
        })
    }

    #[test]
    fn weekends_and_holidays_are_closed() {
        let holiday = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap(); // Monday
        let cal = calendar(vec![holiday]);

        assert!(cal.is_trading_day(NaiveDate::from_ymd_opt(2026, 1, 23).unwrap())); // Fri
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(2026, 1, 24).unwrap())); // Sat
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(2026, 1, 25).unwrap())); // Sun
        assert!(!cal.is_trading_day(holiday));
        assert!(cal.is_trading_day(NaiveDate::from_ymd_opt(2026, 1, 27).unwrap())); // Tue
    }

    #[test]
    fn session_bounds_convert_ist_to_utc() {
        let cal = calendar(vec![]);
        let date = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap();
        let (open, close) = cal.session_bounds(date);

        // 09:15 IST == 03:45 UTC; 15:30 IST == 10:00 UTC.
        assert_eq!(open, Utc.with_ymd_and_hms(2026, 1, 23, 3, 45, 0).unwrap());
        assert_eq!(close, Utc.with_ymd_and_hms(2026, 1, 23, 10, 0, 0).unwrap());
    }

    #[test]
    fn next_session_skips_weekend_and_holiday() {
        let holiday = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap(); // Monday
        let cal = calendar(vec![holiday]);

        // Friday evening after close: next session is Tuesday (Mon holiday).
        let now = Utc.with_ymd_and_hms(2026, 1, 23, 12, 0, 0).unwrap();
        let (open, _close) = cal.next_session(now);
        assert_eq!(open.date_naive(), NaiveDate::from_ymd_opt(2026, 1, 27).unwrap());
    }

    #[test]
    fn next_session_returns_today_before_close() {
        let cal = calendar(vec![]);
        // Friday 09:00 UTC is inside the session (closes 10:00 UTC).
        let now = Utc.with_ymd_and_hms(2026, 1, 23, 9, 0, 0).unwrap();
        let (open, close) = cal.next_session(now);
        assert_eq!(open.date_naive(), now.date_naive());
        assert!(close > now);
    }

    #[test]
    fn close_detector_trips_on_stable_price() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 23, 10, 0, 0).unwrap();
        let deadline = t0 + ChronoDuration::seconds(300);
        let mut det = CloseDetector::new(30, deadline, t0);

        det.observe(100_00, t0);
        assert!(!det.should_disconnect(t0 + ChronoDuration::seconds(29)));

        // Price moved: stability clock restarts.
        det.observe(100_50, t0 + ChronoDuration::seconds(20));
        assert!(!det.should_disconnect(t0 + ChronoDuration::seconds(49)));
        assert!(det.should_disconnect(t0 + ChronoDuration::seconds(50)));
    }

    #[test]
    fn close_detector_hard_deadline_wins() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 23, 10, 0, 0).unwrap();
        let deadline = t0 + ChronoDuration::seconds(300);
        let mut det = CloseDetector::new(30, deadline, t0);

        // Price keeps moving, but the deadline passes.
        for i in 0..400 {
            det.observe(100_00 + i, t0 + ChronoDuration::seconds(i));
        }
        assert!(det.should_disconnect(t0 + ChronoDuration::seconds(301)));
    }

    #[test]
    fn close_detector_needs_an_observation_for_stability() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 23, 10, 0, 0).unwrap();
        let deadline = t0 + ChronoDuration::seconds(300);
        let det = CloseDetector::new(30, deadline, t0);
        // No tick seen: only the deadline can fire.
        assert!(!det.should_disconnect(t0 + ChronoDuration::seconds(200)));
    }
}
