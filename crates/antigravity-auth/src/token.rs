//! OAuth token refresh
//!
//! Wraps the Google token endpoint's `refresh_token` grant. Refresh is lazy:
//! the pool calls it when a stored access token is missing or past its
//! expiry, never proactively. The refresher itself never mutates account
//! state; the caller applies the result.
//!
//! Every call is bounded by a hard 15-second timeout so a wedged token
//! endpoint cannot stall credential selection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{ANTIGRAVITY_CLIENT_ID, ANTIGRAVITY_CLIENT_SECRET, TOKEN_ENDPOINT};

/// Hard ceiling on a single refresh round-trip.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

/// A freshly minted access token with its absolute expiry.
///
/// `expires` is a unix timestamp in milliseconds, computed from the
/// endpoint's `expires_in` delta at response time.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access: String,
    pub expires: u64,
}

/// Wire shape of the token endpoint response.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client for the `refresh_token` grant.
///
/// The endpoint URL is overridable so tests can point at a local mock;
/// production callers use [`TokenRefresher::new`].
pub struct TokenRefresher {
    client: reqwest::Client,
    token_url: String,
    timeout: Duration,
}

impl TokenRefresher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token_url: TOKEN_ENDPOINT.to_string(),
            timeout: REFRESH_TIMEOUT,
        }
    }

    /// Refresher pointed at a non-default token endpoint.
    pub fn with_token_url(client: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            timeout: REFRESH_TIMEOUT,
        }
    }

    /// Override the hard timeout (tests exercise the timeout path with a
    /// hanging endpoint and a short ceiling).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Obtain a new access token for an account.
    ///
    /// Returns `None` without calling out when the account has no project id
    /// (no call can succeed without one), and `None` on timeout, transport
    /// error, non-success status, or a response missing the access token.
    /// The caller decides whether `None` is fatal.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        project_id: Option<&str>,
    ) -> Option<RefreshedToken> {
        match project_id {
            Some(p) if !p.is_empty() => {}
            _ => {
                debug!("skipping token refresh: account has no project id");
                return None;
            }
        }

        let request = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", ANTIGRAVITY_CLIENT_ID),
                ("client_secret", ANTIGRAVITY_CLIENT_SECRET),
            ])
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!(error = %e, "token refresh request failed");
                return None;
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "token refresh timed out"
                );
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(%status, body, "token endpoint returned error");
            return None;
        }

        let parsed: RefreshResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "invalid token refresh response");
                return None;
            }
        };

        let access = match parsed.access_token {
            Some(a) if !a.is_empty() => a,
            _ => {
                warn!("token refresh response carried no access token");
                return None;
            }
        };

        let expires = now_ms() + parsed.expires_in.unwrap_or(0).saturating_mul(1000);
        debug!(expires, "token refresh succeeded");
        Some(RefreshedToken { access, expires })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
