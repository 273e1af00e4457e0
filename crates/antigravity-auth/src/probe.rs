//! Account liveness probes
//!
//! Classifies whether an account's access token is actually usable against
//! the Code Assist surface. Two probes, walked in order until one is
//! definitive:
//!
//! 1. `loadCodeAssist` on the production endpoint, then the sandbox mirror —
//!    validates reachability for the Gemini families.
//! 2. A trivial Claude `generateContent` against the sandbox — a throttled
//!    response (`quota`, `rate`, `RESOURCE_EXHAUSTED`) still counts as
//!    valid: the credentials work, the account is merely rate-limited.
//!
//! Probes never mutate pool state; the broker applies the outcome.

use std::time::Duration;

use tracing::{debug, warn};

use crate::constants::{
    API_CLIENT_HEADER, CLIENT_METADATA_HEADER, CODE_ASSIST_ENDPOINT, CODE_ASSIST_SANDBOX_ENDPOINT,
    USER_AGENT,
};

/// Per-probe round-trip ceiling.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Definitive marker the Code Assist surface puts in rejection bodies.
const INVALID_CREDENTIALS_MARKER: &str = "Invalid Google Cloud Code Assist credentials";

/// Body substrings on the Claude probe that mean "working but throttled".
const THROTTLED_MARKERS: &[&str] = &["quota", "rate", "RESOURCE_EXHAUSTED"];

/// Classification of a probe round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Token reached the surface and was accepted (or merely throttled).
    Valid,
    /// Token was definitively rejected.
    Invalid(String),
    /// Nothing definitive (transport error, 5xx, timeout).
    Inconclusive(String),
}

impl ProbeOutcome {
    fn is_definitive(&self) -> bool {
        !matches!(self, ProbeOutcome::Inconclusive(_))
    }
}

/// Probe runner with overridable endpoints (tests point these at local mocks).
pub struct LivenessProbe {
    client: reqwest::Client,
    code_assist_endpoints: Vec<String>,
    claude_endpoint: String,
}

impl LivenessProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            code_assist_endpoints: vec![
                CODE_ASSIST_ENDPOINT.to_string(),
                CODE_ASSIST_SANDBOX_ENDPOINT.to_string(),
            ],
            claude_endpoint: CODE_ASSIST_SANDBOX_ENDPOINT.to_string(),
        }
    }

    /// Probe runner against non-default endpoints.
    pub fn with_endpoints(
        client: reqwest::Client,
        code_assist_endpoints: Vec<String>,
        claude_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            code_assist_endpoints,
            claude_endpoint: claude_endpoint.into(),
        }
    }

    /// Run the probe chain for one access token.
    ///
    /// Returns the first definitive outcome; if every probe is inconclusive,
    /// the last inconclusive reason is returned and the caller should leave
    /// the account's health unchanged.
    pub async fn probe(&self, access_token: &str, project_id: Option<&str>) -> ProbeOutcome {
        for base in &self.code_assist_endpoints {
            let outcome = self.probe_code_assist(base, access_token).await;
            debug!(endpoint = %base, ?outcome, "loadCodeAssist probe");
            if outcome.is_definitive() {
                return outcome;
            }
        }

        let outcome = self.probe_claude(access_token, project_id).await;
        debug!(endpoint = %self.claude_endpoint, ?outcome, "claude probe");
        if !outcome.is_definitive() {
            warn!("all liveness probes inconclusive");
        }
        outcome
    }

    /// `GET {base}/v1internal:loadCodeAssist`
    async fn probe_code_assist(&self, base: &str, access_token: &str) -> ProbeOutcome {
        let request = self
            .client
            .get(format!("{base}/v1internal:loadCodeAssist"))
            .bearer_auth(access_token)
            .header("User-Agent", USER_AGENT)
            .header("X-Goog-Api-Client", API_CLIENT_HEADER)
            .header("Client-Metadata", CLIENT_METADATA_HEADER)
            .send();

        let response = match tokio::time::timeout(PROBE_TIMEOUT, request).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return ProbeOutcome::Inconclusive(format!("transport error: {e}")),
            Err(_) => return ProbeOutcome::Inconclusive("probe timed out".into()),
        };

        let status = response.status();
        if status.is_success() {
            return ProbeOutcome::Valid;
        }
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return ProbeOutcome::Invalid(format!("loadCodeAssist returned {status}"));
        }
        if body.contains(INVALID_CREDENTIALS_MARKER) {
            return ProbeOutcome::Invalid(INVALID_CREDENTIALS_MARKER.to_string());
        }
        ProbeOutcome::Inconclusive(format!("loadCodeAssist returned {status}"))
    }

    /// `POST {sandbox}/v1internal:generateContent` with a trivial Claude body.
    async fn probe_claude(&self, access_token: &str, project_id: Option<&str>) -> ProbeOutcome {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "project": project_id,
            "request": {
                "contents": [{"role": "user", "parts": [{"text": "ping"}]}],
                "generationConfig": {"maxOutputTokens": 1}
            }
        });

        let request = self
            .client
            .post(format!("{}/v1internal:generateContent", self.claude_endpoint))
            .bearer_auth(access_token)
            .header("User-Agent", USER_AGENT)
            .header("X-Goog-Api-Client", API_CLIENT_HEADER)
            .header("Client-Metadata", CLIENT_METADATA_HEADER)
            .json(&body)
            .send();

        let response = match tokio::time::timeout(PROBE_TIMEOUT, request).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return ProbeOutcome::Inconclusive(format!("transport error: {e}")),
            Err(_) => return ProbeOutcome::Inconclusive("probe timed out".into()),
        };

        let status = response.status();
        if status.is_success() {
            return ProbeOutcome::Valid;
        }
        let text = response.text().await.unwrap_or_default();
        if THROTTLED_MARKERS.iter().any(|m| text.contains(m)) {
            // Credentials work, the account is just throttled
            return ProbeOutcome::Valid;
        }
        if status.as_u16() == 401 || status.as_u16() == 403 || text.contains("UNAUTHENTICATED") {
            return ProbeOutcome::Invalid(format!("generateContent returned {status}"));
        }
        ProbeOutcome::Inconclusive(format!("generateContent returned {status}"))
    }
}
