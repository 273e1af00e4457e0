//! Error types for pool, broker, and dispatch operations
//!
//! These are failure kinds, not transport types: messages name the offending
//! account (email or index), the model family, and the wait for the
//! all-rate-limited case, so they can surface to an operator unchanged.

use crate::account::ModelFamily;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pool is empty or nothing in it is usable.
    #[error("no usable account is available; add an account or re-authenticate")]
    NoAccounts,

    /// Selected account cannot produce a credential without a project id.
    #[error("account {account} has no project id; re-run login for it")]
    NoProjectId { account: String },

    /// Token refresh failed and the one fallback account did too.
    #[error("token refresh failed for account {account}; re-authenticate it")]
    RefreshFailed { account: String },

    /// Every account is rate-limited for the family.
    #[error("all accounts are rate-limited for {family}; retry in {}s", .retry_after_ms / 1000)]
    RateLimitedAll {
        family: ModelFamily,
        retry_after_ms: u64,
    },

    /// Silent rate-limit: the stream went quiet past the stall threshold.
    #[error("no streaming activity from account {account} for {}s on {family}", .idle_ms / 1000)]
    ActivityTimeout {
        account: String,
        family: ModelFamily,
        idle_ms: u64,
    },

    /// Explicit rate-limit, classified from the callback's error message.
    #[error("account {account} is rate-limited for {family}: {message}")]
    RateLimited {
        account: String,
        family: ModelFamily,
        message: String,
    },

    /// Caller-configured wall-clock deadline expired.
    #[error("request deadline exceeded after {}s", .elapsed_ms / 1000)]
    DeadlineExceeded { elapsed_ms: u64 },

    /// Error surfaced by the request callback, propagated unchanged.
    #[error("{0}")]
    Upstream(String),

    #[error("account store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_all_names_family_and_wait() {
        let err = Error::RateLimitedAll {
            family: ModelFamily::GeminiPro,
            retry_after_ms: 29_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("gemini-pro"), "got: {msg}");
        assert!(msg.contains("29s"), "got: {msg}");
    }

    #[test]
    fn activity_timeout_names_account_and_family() {
        let err = Error::ActivityTimeout {
            account: "a@example.com".into(),
            family: ModelFamily::Claude,
            idle_ms: 31_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("a@example.com"), "got: {msg}");
        assert!(msg.contains("claude"), "got: {msg}");
    }
}
