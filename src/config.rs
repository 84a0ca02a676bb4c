// =============================================================================
// Environment Configuration — Aurora Market Data Core
// =============================================================================
//
// Every recognized option is enumerated here and parsed once at startup.
// Defaults are production-sensible; parse failures on an explicitly-set
// variable are hard errors (a silently ignored typo in ENABLED_TFS would
// change which streams exist downstream).
//
// Secrets (upstream API credentials, TOTP seed) are read but never logged.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use tracing::info;

use crate::indicators::{self, IndicatorConfig};
use crate::types::{Exchange, InstrumentKey};

// =============================================================================
// Bounded queue capacities (fixed; drop-on-full everywhere)
// =============================================================================

pub const TICK_QUEUE_CAPACITY: usize = 10_000;
pub const CANDLE_QUEUE_CAPACITY: usize = 5_000;
pub const TF_QUEUE_CAPACITY: usize = 5_000;

// =============================================================================
// Defaults
// =============================================================================

const DEFAULT_TFS: &[u32] = &[60, 120, 180, 300];
const DEFAULT_INDICATORS: &str = "SMA:9,SMA:20,SMA:50,SMA:200,EMA:9,EMA:21,RSI:14";
const DEFAULT_SNAPSHOT_KEY: &str = "ind:snapshot:engine";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_SQLITE_PATH: &str = "aurora_market.db";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:3001";

// =============================================================================
// Sub-configs
// =============================================================================

/// Trading-session schedule. Times are in the exchange-local timezone (IST,
/// fixed +05:30, no DST).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub open: NaiveTime,
    pub close: NaiveTime,
    /// Dates on which the session never opens, beyond the weekend rule.
    pub holidays: Vec<NaiveDate>,
    /// How long the last price must hold still before smart close fires.
    pub stable_for_secs: u64,
    /// Hard disconnect deadline past scheduled close.
    pub max_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 15, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
            holidays: Vec::new(),
            stable_for_secs: 30,
            max_grace_secs: 300,
        }
    }
}

/// Upstream feed credentials and endpoints. `totp_secret` seeds the RFC-6238
/// one-time code used during login.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub user_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub totp_secret: String,
    pub login_url: String,
    pub ws_url: String,
}

// =============================================================================
// Config
// =============================================================================

/// Fully parsed process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Resampling timeframes, seconds, as configured order.
    pub enabled_tfs: Vec<u32>,
    /// Instruments to subscribe and build candles for.
    pub instruments: Vec<InstrumentKey>,
    /// Flat indicator set applied to every enabled timeframe.
    pub indicator_configs: Vec<IndicatorConfig>,

    pub snapshot_interval_secs: u64,
    pub snapshot_key: String,
    pub pel_reclaim_interval_secs: u64,
    pub pel_min_idle_ms: u64,

    pub redis_url: String,
    pub sqlite_path: String,
    pub metrics_bind_addr: String,

    /// Event-time reorder window for the 1s aggregator.
    pub reorder_buffer_ms: u64,
    /// Staleness tolerance for the timeframe builder.
    pub stale_tolerance_secs: u64,

    pub staging_mode: bool,
    pub simulator_url: String,

    pub session: SessionConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Read the full configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let enabled_tfs = match env_opt("ENABLED_TFS") {
            Some(csv) => parse_tfs(&csv)?,
            None => DEFAULT_TFS.to_vec(),
        };

        let instruments = match env_opt("SUBSCRIBE_TOKENS") {
            Some(csv) => parse_subscribe_tokens(&csv)?,
            None => Vec::new(),
        };

        let indicator_configs = indicators::parse_spec_list(
            &env_opt("INDICATOR_CONFIGS").unwrap_or_else(|| DEFAULT_INDICATORS.to_string()),
        )
        .context("parsing INDICATOR_CONFIGS")?;

        let session = SessionConfig {
            open: parse_time_opt("SESSION_OPEN")?
                .unwrap_or_else(|| SessionConfig::default().open),
            close: parse_time_opt("SESSION_CLOSE")?
                .unwrap_or_else(|| SessionConfig::default().close),
            holidays: match env_opt("SESSION_HOLIDAYS") {
                Some(csv) => parse_holidays(&csv)?,
                None => Vec::new(),
            },
            stable_for_secs: parse_num_opt("SESSION_STABLE_FOR_SEC")?.unwrap_or(30),
            max_grace_secs: parse_num_opt("SESSION_MAX_GRACE_SEC")?.unwrap_or(300),
        };

        let upstream = UpstreamConfig {
            user_id: env_opt("UPSTREAM_USER_ID").unwrap_or_default(),
            api_key: env_opt("UPSTREAM_API_KEY").unwrap_or_default(),
            api_secret: env_opt("UPSTREAM_API_SECRET").unwrap_or_default(),
            totp_secret: env_opt("UPSTREAM_TOTP_SECRET").unwrap_or_default(),
            login_url: env_opt("UPSTREAM_LOGIN_URL").unwrap_or_default(),
            ws_url: env_opt("UPSTREAM_WS_URL").unwrap_or_default(),
        };

        let config = Self {
            enabled_tfs,
            instruments,
            indicator_configs,
            snapshot_interval_secs: parse_num_opt("SNAPSHOT_INTERVAL_SEC")?.unwrap_or(30),
            snapshot_key: env_opt("SNAPSHOT_KEY")
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_KEY.to_string()),
            pel_reclaim_interval_secs: parse_num_opt("PEL_RECLAIM_INTERVAL_SEC")?.unwrap_or(30),
            pel_min_idle_ms: parse_num_opt("PEL_MIN_IDLE_MS")?.unwrap_or(60_000),
            redis_url: env_opt("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            sqlite_path: env_opt("SQLITE_PATH")
                .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string()),
            metrics_bind_addr: env_opt("METRICS_BIND_ADDR")
                .unwrap_or_else(|| DEFAULT_METRICS_BIND.to_string()),
            reorder_buffer_ms: parse_num_opt("REORDER_BUFFER_MS")?.unwrap_or(300),
            stale_tolerance_secs: parse_num_opt("STALE_TOLERANCE_SEC")?.unwrap_or(2),
            staging_mode: env_opt("STAGING_MODE")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            simulator_url: env_opt("SIMULATOR_URL").unwrap_or_default(),
            session,
            upstream,
        };

        Ok(config)
    }

    /// Log the effective configuration, omitting secrets.
    pub fn log_effective(&self) {
        info!(
            tfs = ?self.enabled_tfs,
            instruments = self.instruments.len(),
            indicators = ?self
                .indicator_configs
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>(),
            snapshot_interval_secs = self.snapshot_interval_secs,
            pel_reclaim_interval_secs = self.pel_reclaim_interval_secs,
            pel_min_idle_ms = self.pel_min_idle_ms,
            redis_url = %self.redis_url,
            sqlite_path = %self.sqlite_path,
            metrics_bind = %self.metrics_bind_addr,
            staging = self.staging_mode,
            "effective configuration"
        );
    }
}

// =============================================================================
// Parsers
// =============================================================================

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_num_opt<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(name) {
        Some(v) => Ok(Some(
            v.trim()
                .parse::<T>()
                .with_context(|| format!("{name}=`{v}` is not a valid number"))?,
        )),
        None => Ok(None),
    }
}

fn parse_time_opt(name: &str) -> Result<Option<NaiveTime>> {
    match env_opt(name) {
        Some(v) => Ok(Some(
            NaiveTime::parse_from_str(v.trim(), "%H:%M")
                .with_context(|| format!("{name}=`{v}` is not HH:MM"))?,
        )),
        None => Ok(None),
    }
}

/// `ENABLED_TFS` — CSV of positive integers, seconds.
pub fn parse_tfs(csv: &str) -> Result<Vec<u32>> {
    let mut tfs = Vec::new();
    for part in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let tf: u32 = part
            .parse()
            .with_context(|| format!("timeframe `{part}` is not an integer"))?;
        if tf == 0 {
            bail!("timeframe must be positive, got `{part}`");
        }
        if tfs.contains(&tf) {
            bail!("duplicate timeframe {tf}");
        }
        tfs.push(tf);
    }
    if tfs.is_empty() {
        bail!("ENABLED_TFS is empty");
    }
    Ok(tfs)
}

/// `SUBSCRIBE_TOKENS` — CSV of `EXTYPE:TOKEN` where EXTYPE is the upstream
/// numeric segment code.
pub fn parse_subscribe_tokens(csv: &str) -> Result<Vec<InstrumentKey>> {
    let mut keys = Vec::new();
    for part in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (code_str, token) = part
            .split_once(':')
            .with_context(|| format!("subscribe token `{part}` is not EXTYPE:TOKEN"))?;
        let code: u8 = code_str
            .trim()
            .parse()
            .with_context(|| format!("exchange code `{code_str}` is not an integer"))?;
        let exchange = Exchange::from_code(code)
            .with_context(|| format!("unknown exchange code {code} in `{part}`"))?;
        keys.push(InstrumentKey::new(exchange.as_str(), token.trim()));
    }
    Ok(keys)
}

/// `SESSION_HOLIDAYS` — CSV of `YYYY-MM-DD`.
fn parse_holidays(csv: &str) -> Result<Vec<NaiveDate>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("holiday `{s}` is not YYYY-MM-DD"))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tfs_parse_and_reject() {
        assert_eq!(parse_tfs("60,120,300").unwrap(), vec![60, 120, 300]);
        assert_eq!(parse_tfs(" 60 , 300 ").unwrap(), vec![60, 300]);
        assert!(parse_tfs("60,0").is_err());
        assert!(parse_tfs("60,60").is_err());
        assert!(parse_tfs("sixty").is_err());
        assert!(parse_tfs("").is_err());
    }

    #[test]
    fn subscribe_tokens_map_exchange_codes() {
        let keys = parse_subscribe_tokens("1:3045,5:217,13:8991").unwrap();
        assert_eq!(keys[0].to_string(), "NSE:3045");
        assert_eq!(keys[1].to_string(), "MCX:217");
        assert_eq!(keys[2].to_string(), "CDE:8991");

        assert!(parse_subscribe_tokens("9:123").is_err());
        assert!(parse_subscribe_tokens("3045").is_err());
    }

    #[test]
    fn holidays_parse() {
        let days = parse_holidays("2025-10-02, 2025-12-25").unwrap();
        assert_eq!(days.len(), 2);
        assert!(parse_holidays("not-a-date").is_err());
    }
}
