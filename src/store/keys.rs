// =============================================================================
// Redis key, stream and channel naming
// =============================================================================
//
// Single source of truth for every name written to or read from Redis:
//
//   streams      candle:1s:<EX>:<TOK>           candle:<TF>s:<EX>:<TOK>
//                ind:<NAME>:<TF>s:<EX>:<TOK>
//   pub/sub      pub:<stream name>               config:indicators
//   latest keys  candle:1s:latest:<EX>:<TOK>     candle:<TF>s:latest:<EX>:<TOK>
//                ind:<NAME>:<TF>s:latest:<EX>:<TOK>

use crate::types::InstrumentKey;

/// TTL for every latest-value key, seconds.
pub const LATEST_TTL_SECS: u64 = 1800;

/// TTL for the KV engine snapshot, seconds.
pub const SNAPSHOT_TTL_SECS: u64 = 86_400;

/// Pub/sub channel carrying flat indicator-spec reconfigure broadcasts.
pub const CONFIG_CHANNEL: &str = "config:indicators";

/// Field name carrying the JSON payload in every stream entry.
pub const PAYLOAD_FIELD: &str = "data";

pub fn stream_1s(key: &InstrumentKey) -> String {
    format!("candle:1s:{}:{}", key.exchange, key.token)
}

pub fn stream_tf(tf: u32, key: &InstrumentKey) -> String {
    format!("candle:{}s:{}:{}", tf, key.exchange, key.token)
}

pub fn stream_indicator(name: &str, tf: u32, key: &InstrumentKey) -> String {
    format!("ind:{}:{}s:{}:{}", name, tf, key.exchange, key.token)
}

pub fn channel_1s(key: &InstrumentKey) -> String {
    format!("pub:{}", stream_1s(key))
}

pub fn channel_tf(tf: u32, key: &InstrumentKey) -> String {
    format!("pub:{}", stream_tf(tf, key))
}

pub fn channel_indicator(name: &str, tf: u32, key: &InstrumentKey) -> String {
    format!("pub:{}", stream_indicator(name, tf, key))
}

/// Pattern matching every live 1s candle channel.
pub fn channel_1s_pattern() -> &'static str {
    "pub:candle:1s:*"
}

pub fn latest_1s(key: &InstrumentKey) -> String {
    format!("candle:1s:latest:{}:{}", key.exchange, key.token)
}

pub fn latest_tf(tf: u32, key: &InstrumentKey) -> String {
    format!("candle:{}s:latest:{}:{}", tf, key.exchange, key.token)
}

pub fn latest_indicator(name: &str, tf: u32, key: &InstrumentKey) -> String {
    format!("ind:{}:{}s:latest:{}:{}", name, tf, key.exchange, key.token)
}

/// Approximate stream trim length for a timeframe stream: roughly three hours
/// of rows plus slack, never below 200.
pub fn tf_stream_maxlen(tf: u32) -> usize {
    (10_800 / tf as usize + 100).max(200)
}

/// Approximate trim length for 1s candle streams (about three hours).
pub const STREAM_1S_MAXLEN: usize = 10_800;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InstrumentKey {
        InstrumentKey::new("NSE", "3045")
    }

    #[test]
    fn names_follow_wire_contract() {
        assert_eq!(stream_1s(&key()), "candle:1s:NSE:3045");
        assert_eq!(stream_tf(60, &key()), "candle:60s:NSE:3045");
        assert_eq!(stream_indicator("SMA_20", 60, &key()), "ind:SMA_20:60s:NSE:3045");

        assert_eq!(channel_1s(&key()), "pub:candle:1s:NSE:3045");
        assert_eq!(channel_tf(300, &key()), "pub:candle:300s:NSE:3045");
        assert_eq!(
            channel_indicator("RSI_14", 300, &key()),
            "pub:ind:RSI_14:300s:NSE:3045"
        );

        assert_eq!(latest_1s(&key()), "candle:1s:latest:NSE:3045");
        assert_eq!(latest_tf(60, &key()), "candle:60s:latest:NSE:3045");
        assert_eq!(
            latest_indicator("EMA_9", 60, &key()),
            "ind:EMA_9:60s:latest:NSE:3045"
        );
    }

    #[test]
    fn maxlen_is_proportional_with_floor() {
        assert_eq!(tf_stream_maxlen(60), 280);
        assert_eq!(tf_stream_maxlen(300), 200); // 36 + 100 < 200 floor
        assert_eq!(tf_stream_maxlen(120), 200); // 90 + 100 < 200 floor
    }
}
