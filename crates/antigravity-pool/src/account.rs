//! Account data model
//!
//! An [`Account`] is one upstream OAuth identity. Rate limits are tracked
//! per [`ModelFamily`] as absolute reset timestamps; an entry at or before
//! "now" is semantically absent and pruned lazily. Credential health is a
//! tri-state: an account we have never probed is not the same as one whose
//! token was definitively rejected.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Coarse model grouping at which rate limits are tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    Claude,
    GeminiFlash,
    GeminiPro,
}

impl ModelFamily {
    /// Derive the family from a model identifier.
    ///
    /// Case-insensitive substring match: anything mentioning "claude" is
    /// Claude, anything else mentioning "flash" is Gemini Flash, and the
    /// rest falls into the Gemini Pro bucket.
    pub fn from_model_id(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        if lower.contains("claude") {
            Self::Claude
        } else if lower.contains("flash") {
            Self::GeminiFlash
        } else {
            Self::GeminiPro
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::GeminiFlash => "gemini-flash",
            Self::GeminiPro => "gemini-pro",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing level of an account; paid accounts are preferred by selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    Free,
    Paid,
}

/// Why the pool last switched to this account. Advisory, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchReason {
    RateLimit,
    Initial,
    Rotation,
    InvalidCreds,
}

/// Tri-state credential health derived from the persisted `hasAccess` field.
///
/// `Unknown` (never probed) and `Invalid` (probe rejected the token) behave
/// differently in selection: unknown accounts are still candidates, invalid
/// ones are excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHealth {
    Unknown,
    Verified,
    Invalid,
}

/// One upstream OAuth identity, as persisted in the account store.
///
/// The serialized field names are the on-disk schema; changing them breaks
/// existing store files.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// Access-token expiry, unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<AccountTier>,
    /// Per-family reset timestamps (epoch ms); absent key = no limit
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub rate_limit_reset_times: HashMap<ModelFamily, u64>,
    /// `Some(true)` = verified reachable, `Some(false)` = known invalid,
    /// `None` = never probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_access: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<u64>,
    #[serde(default)]
    pub last_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<SwitchReason>,
    #[serde(default)]
    pub added_at: u64,
}

/// Externally supplied credential tuple, produced by the OAuth login
/// collaborator or read from the legacy single-credential file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedCredential {
    pub refresh: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub expires: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tier: Option<AccountTier>,
}

impl Account {
    /// Create an account from a seed credential.
    pub fn from_seed(seed: SeedCredential) -> Self {
        Self {
            refresh_token: seed.refresh,
            project_id: seed.project_id,
            access: seed.access,
            expires: seed.expires,
            email: seed.email,
            tier: seed.tier,
            rate_limit_reset_times: HashMap::new(),
            has_access: None,
            last_error: None,
            last_error_at: None,
            last_used: 0,
            last_switch_reason: Some(SwitchReason::Initial),
            added_at: now_ms(),
        }
    }

    pub fn health(&self) -> CredentialHealth {
        match self.has_access {
            Some(true) => CredentialHealth::Verified,
            Some(false) => CredentialHealth::Invalid,
            None => CredentialHealth::Unknown,
        }
    }

    /// Whether the account has an active rate limit for a family.
    pub fn is_rate_limited(&self, family: ModelFamily, now: u64) -> bool {
        self.rate_limit_reset_times
            .get(&family)
            .is_some_and(|reset| *reset > now)
    }

    /// Drop reset entries at or before `now`. An expired entry is
    /// semantically absent; it must not survive serialization either.
    pub fn prune_expired_limits(&mut self, now: u64) {
        self.rate_limit_reset_times.retain(|_, reset| *reset > now);
    }

    /// Whether the stored access token needs refreshing before use: missing,
    /// empty, or past its expiry.
    pub fn needs_refresh(&self, now: u64) -> bool {
        match self.access.as_deref() {
            None | Some("") => true,
            Some(_) => self.expires.is_some_and(|expires| now >= expires),
        }
    }

    pub fn mark_rate_limited(&mut self, family: ModelFamily, duration_ms: u64, now: u64) {
        self.rate_limit_reset_times
            .insert(family, now + duration_ms);
        self.last_switch_reason = Some(SwitchReason::RateLimit);
    }

    pub fn mark_invalid(&mut self, error: impl Into<String>, now: u64) {
        self.has_access = Some(false);
        self.last_error = Some(error.into());
        self.last_error_at = Some(now);
        self.last_switch_reason = Some(SwitchReason::InvalidCreds);
    }

    pub fn mark_valid(&mut self) {
        self.has_access = Some(true);
        self.last_error = None;
        self.last_error_at = None;
    }

    /// Display identity for log lines and error messages: email when known,
    /// positional index otherwise.
    pub fn label(&self, index: usize) -> String {
        match &self.email {
            Some(email) => email.clone(),
            None => format!("#{index}"),
        }
    }
}

// Tokens must never reach logs; everything else is fair game.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("tier", &self.tier)
            .field("project_id", &self.project_id)
            .field("refresh_token", &"[REDACTED]")
            .field("access", &self.access.as_ref().map(|_| "[REDACTED]"))
            .field("expires", &self.expires)
            .field("rate_limit_reset_times", &self.rate_limit_reset_times)
            .field("has_access", &self.has_access)
            .field("last_used", &self.last_used)
            .field("last_switch_reason", &self.last_switch_reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(refresh: &str) -> SeedCredential {
        SeedCredential {
            refresh: refresh.into(),
            project_id: Some("proj".into()),
            access: Some("at".into()),
            expires: Some(4_102_444_800_000),
            email: Some("a@example.com".into()),
            tier: None,
        }
    }

    #[test]
    fn family_from_model_id() {
        assert_eq!(
            ModelFamily::from_model_id("claude-sonnet-4-5"),
            ModelFamily::Claude
        );
        assert_eq!(
            ModelFamily::from_model_id("CLAUDE-OPUS"),
            ModelFamily::Claude
        );
        assert_eq!(
            ModelFamily::from_model_id("gemini-2.5-flash"),
            ModelFamily::GeminiFlash
        );
        assert_eq!(
            ModelFamily::from_model_id("gemini-2.5-pro"),
            ModelFamily::GeminiPro
        );
        // Unknown models land in the pro bucket
        assert_eq!(
            ModelFamily::from_model_id("gpt-oss-120b"),
            ModelFamily::GeminiPro
        );
        // "claude" wins over "flash"
        assert_eq!(
            ModelFamily::from_model_id("claude-flash-experimental"),
            ModelFamily::Claude
        );
    }

    #[test]
    fn serialized_field_names_match_disk_schema() {
        let mut account = Account::from_seed(seed("rt_1"));
        account.tier = Some(AccountTier::Paid);
        account
            .rate_limit_reset_times
            .insert(ModelFamily::GeminiFlash, 12345);
        account.has_access = Some(true);

        let value = serde_json::to_value(&account).unwrap();
        assert_eq!(value["refreshToken"], "rt_1");
        assert_eq!(value["projectId"], "proj");
        assert_eq!(value["tier"], "paid");
        assert_eq!(value["rateLimitResetTimes"]["gemini-flash"], 12345);
        assert_eq!(value["hasAccess"], true);
        assert!(value.get("addedAt").is_some());
        assert!(value.get("lastUsed").is_some());
        // Absent optionals are omitted, not null
        assert!(value.get("lastError").is_none());
        assert!(value.get("lastSwitchReason").is_some()); // seed sets "initial"
        assert_eq!(value["lastSwitchReason"], "initial");
    }

    #[test]
    fn account_roundtrips_through_json() {
        let mut account = Account::from_seed(seed("rt_1"));
        account.mark_rate_limited(ModelFamily::Claude, 60_000, 1_000);
        account.mark_invalid("401 from probe", 2_000);

        let json = serde_json::to_string(&account).unwrap();
        let back: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(back, account);
    }

    #[test]
    fn health_tri_state() {
        let mut account = Account::from_seed(seed("rt_1"));
        assert_eq!(account.health(), CredentialHealth::Unknown);

        account.mark_invalid("rejected", 1);
        assert_eq!(account.health(), CredentialHealth::Invalid);
        assert!(account.last_error.is_some());

        account.mark_valid();
        assert_eq!(account.health(), CredentialHealth::Verified);
        assert!(account.last_error.is_none(), "mark_valid clears the error");
        assert!(account.last_error_at.is_none());
    }

    #[test]
    fn rate_limit_expiry_is_exclusive() {
        let mut account = Account::from_seed(seed("rt_1"));
        account.mark_rate_limited(ModelFamily::Claude, 1_000, 5_000);

        assert!(account.is_rate_limited(ModelFamily::Claude, 5_999));
        // Entry value == now means the limit has lifted
        assert!(!account.is_rate_limited(ModelFamily::Claude, 6_000));
        // Other families are untouched
        assert!(!account.is_rate_limited(ModelFamily::GeminiPro, 5_500));
    }

    #[test]
    fn prune_drops_only_expired_entries() {
        let mut account = Account::from_seed(seed("rt_1"));
        account.mark_rate_limited(ModelFamily::Claude, 1_000, 0);
        account.mark_rate_limited(ModelFamily::GeminiPro, 10_000, 0);

        account.prune_expired_limits(5_000);
        assert!(!account.rate_limit_reset_times.contains_key(&ModelFamily::Claude));
        assert!(account.rate_limit_reset_times.contains_key(&ModelFamily::GeminiPro));
    }

    #[test]
    fn needs_refresh_cases() {
        let mut account = Account::from_seed(seed("rt_1"));
        assert!(!account.needs_refresh(0), "fresh token with future expiry");

        account.access = None;
        assert!(account.needs_refresh(0), "missing token");

        account.access = Some(String::new());
        assert!(account.needs_refresh(0), "empty token");

        account.access = Some("at".into());
        account.expires = Some(1_000);
        assert!(account.needs_refresh(1_000), "expiry is inclusive");
        assert!(!account.needs_refresh(999));

        account.expires = None;
        assert!(
            !account.needs_refresh(u64::MAX),
            "token without expiry is trusted"
        );
    }

    #[test]
    fn debug_redacts_tokens() {
        let account = Account::from_seed(seed("rt_secret"));
        let debug = format!("{account:?}");
        assert!(!debug.contains("rt_secret"));
        assert!(!debug.contains("\"at\""));
        assert!(debug.contains("[REDACTED]"));
        assert!(debug.contains("a@example.com"));
    }

    #[test]
    fn label_prefers_email() {
        let mut account = Account::from_seed(seed("rt_1"));
        assert_eq!(account.label(3), "a@example.com");
        account.email = None;
        assert_eq!(account.label(3), "#3");
    }
}
