// =============================================================================
// Upstream Login Client — TOTP + HMAC-SHA256 signed session establishment
// =============================================================================
//
// The upstream feed hands out ephemeral session tokens against a signed
// login: the request carries the account's API key, a six-digit time-based
// one-time code derived from the shared TOTP seed (30 s steps, HMAC-SHA256
// dynamic truncation), and an HMAC signature over the request identity.
//
// SECURITY: the API secret and TOTP seed are used for signing only and are
// never logged or serialized.
// =============================================================================

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use crate::config::UpstreamConfig;

type HmacSha256 = Hmac<Sha256>;

/// TOTP time step, seconds.
const TOTP_STEP_SECS: i64 = 30;

/// Ephemeral tokens returned by a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    #[serde(default)]
    pub feed_token: Option<String>,
}

#[derive(Clone)]
pub struct LoginClient {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl LoginClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self { config, client }
    }

    // ── One-time code ───────────────────────────────────────────────────

    /// Six-digit TOTP for the given Unix timestamp. The seed is the
    /// hex-encoded `UPSTREAM_TOTP_SECRET`.
    pub fn one_time_code(&self, unix_secs: i64) -> Result<String> {
        let seed = hex::decode(self.config.totp_secret.trim())
            .context("UPSTREAM_TOTP_SECRET is not valid hex")?;
        let counter = (unix_secs / TOTP_STEP_SECS) as u64;

        let mut mac =
            HmacSha256::new_from_slice(&seed).expect("HMAC accepts any key size");
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        // RFC 6238 dynamic truncation.
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let slice: [u8; 4] = digest[offset..offset + 4]
            .try_into()
            .expect("four-byte window inside digest");
        let code = (u32::from_be_bytes(slice) & 0x7fff_ffff) % 1_000_000;
        Ok(format!("{code:06}"))
    }

    // ── Login ───────────────────────────────────────────────────────────

    /// Produce an HMAC-SHA256 hex signature of `message` with the API
    /// secret.
    fn sign(&self, message: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Perform the upstream login and return the ephemeral session tokens.
    pub async fn login(&self) -> Result<SessionTokens> {
        if self.config.login_url.is_empty() {
            bail!("UPSTREAM_LOGIN_URL is not configured");
        }

        let now = chrono::Utc::now().timestamp();
        let totp = self.one_time_code(now)?;
        let signature = self.sign(&format!(
            "{}|{}|{}",
            self.config.user_id, self.config.api_key, totp
        ));

        debug!(user = %self.config.user_id, "performing upstream login");
        let resp = self
            .client
            .post(&self.config.login_url)
            .json(&serde_json::json!({
                "user_id": self.config.user_id,
                "api_key": self.config.api_key,
                "totp": totp,
                "signature": signature,
            }))
            .send()
            .await
            .context("login request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("login rejected with {status}: {body}");
        }

        let tokens: SessionTokens = resp
            .json()
            .await
            .context("login response was not valid JSON")?;
        info!("upstream session established");
        Ok(tokens)
    }

    /// Feed WebSocket URL with the session token attached.
    pub fn feed_url(&self, tokens: &SessionTokens) -> String {
        format!(
            "{}?token={}",
            self.config.ws_url,
            tokens.feed_token.as_deref().unwrap_or(&tokens.access_token)
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
