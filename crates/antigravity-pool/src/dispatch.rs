//! Dispatch loop with silent rate-limit detection
//!
//! Wraps a single logical request (the caller's streaming closure) in a
//! bounded retry. Two failure detectors run alongside every attempt:
//!
//! - An **activity watchdog** polls a shared last-activity timestamp; the
//!   streaming collaborator touches it on every token or tool event. A
//!   stream that goes quiet past the stall threshold is a silent rate-limit:
//!   the account is cooled down, the in-flight request cancelled, and a
//!   fresh account tried on the next attempt.
//! - A caller-configured wall-clock deadline, which cancels and propagates
//!   without retrying.
//!
//! Explicit failures are classified by message: anything matching the
//! rate-limit heuristic cools the account down but is not retried. The
//! retry budget exists solely to escape silently-stalled accounts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{ModelFamily, now_ms};
use crate::broker::{Credential, CredentialBroker};
use crate::error::{Error, Result};

/// Provider id that gets the full retry budget.
pub const ANTIGRAVITY_PROVIDER: &str = "google-antigravity";

/// Attempts for the Antigravity provider; every other provider gets one.
const MAX_ANTIGRAVITY_ATTEMPTS: u32 = 3;

/// How often the watchdog samples the activity timestamp.
const WATCHDOG_POLL: Duration = Duration::from_secs(5);

/// Idle time past which a stream counts as silently rate-limited.
const STALL_THRESHOLD: Duration = Duration::from_secs(30);

/// Cooldown applied on explicit or silent rate-limit detection.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(120);

/// Message substrings that classify an error as a rate limit.
/// Case-sensitive, matching the upstream client's error texts.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "rate",
    "quota",
    "limit",
    "timeout",
    "ECONNRESET",
    "ETIMEDOUT",
];

/// Whether an error message looks like a rate limit.
pub fn is_rate_limit_error(message: &str) -> bool {
    RATE_LIMIT_PATTERNS.iter().any(|p| message.contains(p))
}

/// Shared last-activity timestamp between the dispatch watchdog and the
/// streaming collaborator, which calls [`ActivityTracker::touch`] on every
/// observable stream event.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last: Arc<AtomicU64>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(AtomicU64::new(now_ms())),
        }
    }

    /// Record stream activity now.
    pub fn touch(&self) {
        self.last.store(now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last recorded activity.
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last.load(Ordering::Relaxed))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-attempt context handed to the request callback.
pub struct Attempt {
    /// Credential for this attempt; a retry may carry a different account.
    pub credential: Credential,
    /// Touch on every token/tool event to keep the watchdog quiet.
    pub activity: ActivityTracker,
    /// Fired exactly once when the attempt is cancelled (stall, deadline,
    /// or external abort); pending suspensions must observe it.
    pub cancel: CancellationToken,
}

/// Dispatch tuning. Defaults match production behavior; tests shrink the
/// durations.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub provider: String,
    /// Optional overall deadline per attempt; expiry cancels and propagates.
    pub wall_clock_timeout: Option<Duration>,
    pub watchdog_poll: Duration,
    pub stall_threshold: Duration,
    pub rate_limit_cooldown: Duration,
}

impl DispatchConfig {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            wall_clock_timeout: None,
            watchdog_poll: WATCHDOG_POLL,
            stall_threshold: STALL_THRESHOLD,
            rate_limit_cooldown: RATE_LIMIT_COOLDOWN,
        }
    }

    fn max_attempts(&self) -> u32 {
        if self.provider == ANTIGRAVITY_PROVIDER {
            MAX_ANTIGRAVITY_ATTEMPTS
        } else {
            1
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::for_provider(ANTIGRAVITY_PROVIDER)
    }
}

enum AttemptOutcome<T> {
    Finished(Result<T>),
    Stalled { idle_ms: u64 },
    Deadline,
}

/// Run a request with per-attempt credential selection and retry.
///
/// Each attempt re-asks the broker for a credential — that is the only
/// mechanism by which a retry escapes a bad account, since the stalled
/// account is rate-limited before the next selection.
pub async fn dispatch<T, F, Fut>(
    broker: &CredentialBroker,
    model_id: &str,
    config: &DispatchConfig,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let family = ModelFamily::from_model_id(model_id);
    let max_attempts = config.max_attempts();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let started = Instant::now();

    info!(
        %request_id,
        model = model_id,
        provider = %config.provider,
        "dispatching request"
    );

    let mut attempt = 0u32;
    loop {
        let issued = match broker.issue(model_id).await? {
            Some(issued) => issued,
            None => return Err(Error::NoAccounts),
        };
        debug!(
            %request_id,
            attempt,
            account = %issued.account_label,
            "starting attempt"
        );

        let activity = ActivityTracker::new();
        let cancel = CancellationToken::new();
        let fut = attempt_fn(Attempt {
            credential: issued.credential.clone(),
            activity: activity.clone(),
            cancel: cancel.clone(),
        });
        tokio::pin!(fut);

        let mut watchdog = tokio::time::interval(config.watchdog_poll);
        // Skip the immediate first tick — the attempt just started
        watchdog.tick().await;

        let wall_clock = async {
            match config.wall_clock_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(wall_clock);

        // Dropping out of this loop drops the attempt future and both
        // timers, so they are cleared on every exit path.
        let outcome = loop {
            tokio::select! {
                result = &mut fut => break AttemptOutcome::Finished(result),
                _ = watchdog.tick() => {
                    let idle_ms = activity.idle_ms();
                    if idle_ms >= config.stall_threshold.as_millis() as u64 {
                        break AttemptOutcome::Stalled { idle_ms };
                    }
                }
                _ = &mut wall_clock => break AttemptOutcome::Deadline,
            }
        };

        match outcome {
            AttemptOutcome::Finished(Ok(value)) => {
                debug!(%request_id, attempt, "attempt completed");
                return Ok(value);
            }
            AttemptOutcome::Finished(Err(error)) => {
                let message = error.to_string();
                if is_rate_limit_error(&message) {
                    warn!(
                        %request_id,
                        account = %issued.account_label,
                        family = %family,
                        message = %message,
                        "explicit rate limit, cooling account down"
                    );
                    broker
                        .report_rate_limited(issued.index, family, config.rate_limit_cooldown)
                        .await;
                    return Err(Error::RateLimited {
                        account: issued.account_label,
                        family,
                        message,
                    });
                }
                return Err(error);
            }
            AttemptOutcome::Stalled { idle_ms } => {
                cancel.cancel();
                warn!(
                    %request_id,
                    account = %issued.account_label,
                    family = %family,
                    idle_ms,
                    "no streaming activity, treating as silent rate limit"
                );
                broker
                    .report_rate_limited(issued.index, family, config.rate_limit_cooldown)
                    .await;

                attempt += 1;
                if attempt < max_attempts {
                    continue;
                }
                return Err(Error::ActivityTimeout {
                    account: issued.account_label,
                    family,
                    idle_ms,
                });
            }
            AttemptOutcome::Deadline => {
                cancel.cancel();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(%request_id, account = %issued.account_label, elapsed_ms, "wall-clock deadline exceeded");
                return Err(Error::DeadlineExceeded { elapsed_ms });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SeedCredential;
    use crate::pool::AccountPool;
    use crate::store::AccountStore;
    use antigravity_auth::probe::LivenessProbe;
    use antigravity_auth::token::TokenRefresher;
    use std::sync::atomic::AtomicU32;

    const FUTURE: u64 = 4_102_444_800_000;

    fn seed(refresh: &str, access: &str) -> SeedCredential {
        SeedCredential {
            refresh: refresh.into(),
            project_id: Some(format!("proj_{refresh}")),
            access: Some(access.into()),
            expires: Some(FUTURE),
            email: Some(format!("{refresh}@example.com")),
            tier: None,
        }
    }

    async fn broker_of(dir: &tempfile::TempDir, seeds: Vec<SeedCredential>) -> CredentialBroker {
        let pool = AccountPool::empty();
        for s in seeds {
            assert!(pool.add_account(s).await);
        }
        CredentialBroker::new(
            pool,
            AccountStore::new(dir.path().join("accounts.json")),
            // Tokens in tests are always fresh; the endpoint is never hit
            TokenRefresher::with_token_url(reqwest::Client::new(), "http://127.0.0.1:1/token"),
            LivenessProbe::with_endpoints(
                reqwest::Client::new(),
                vec!["http://127.0.0.1:1".into()],
                "http://127.0.0.1:1",
            ),
        )
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            watchdog_poll: Duration::from_millis(10),
            stall_threshold: Duration::from_millis(40),
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn heuristic_matches_known_patterns() {
        for message in [
            "upstream returned 429",
            "rate exceeded for account",
            "quota exhausted",
            "usage limit reached",
            "request timeout while streaming",
            "socket hang up: ECONNRESET",
            "connect ETIMEDOUT 10.0.0.1:443",
        ] {
            assert!(is_rate_limit_error(message), "should match: {message}");
        }
    }

    #[test]
    fn heuristic_is_case_sensitive_and_ignores_other_errors() {
        assert!(!is_rate_limit_error("internal server error"));
        assert!(!is_rate_limit_error("QUOTA EXCEEDED"));
        assert!(!is_rate_limit_error("Request Timeout"));
        assert!(!is_rate_limit_error("bad request: missing field"));
    }

    #[test]
    fn activity_tracker_reports_idle_time() {
        let tracker = ActivityTracker::new();
        assert!(tracker.idle_ms() < 1_000);
        tracker.touch();
        assert!(tracker.idle_ms() < 1_000);
    }

    #[tokio::test]
    async fn completes_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;

        let result = dispatch(&broker, "claude-sonnet-4-5", &fast_config(), |attempt| async move {
            assert_eq!(attempt.credential.access, "tok_a");
            Ok("done")
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn activity_stall_retries_on_a_fresh_account() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a"), seed("b", "tok_b")]).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = dispatch(&broker, "claude-sonnet-4-5", &fast_config(), move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt.credential.access == "tok_a" {
                    // One event, then silence past the stall threshold
                    attempt.activity.touch();
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        // Exactly one cooldown recorded, against the stalled account only
        let account_a = broker.pool().account(0).await.unwrap();
        assert_eq!(account_a.rate_limit_reset_times.len(), 1);
        assert!(account_a.is_rate_limited(ModelFamily::Claude, now_ms()));
        let account_b = broker.pool().account(1).await.unwrap();
        assert!(account_b.rate_limit_reset_times.is_empty());
    }

    #[tokio::test]
    async fn stall_on_final_attempt_surfaces_activity_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;
        let mut config = fast_config();
        config.provider = "openai".into(); // single attempt

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<&str> =
            dispatch(&broker, "gpt-oss-120b", &config, move |_attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("never")
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1, "non-antigravity providers get one attempt");
        match result.unwrap_err() {
            Error::ActivityTimeout { account, family, .. } => {
                assert_eq!(account, "a@example.com");
                assert_eq!(family, ModelFamily::GeminiPro);
            }
            other => panic!("expected ActivityTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn steady_activity_never_trips_the_watchdog() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;
        let mut config = fast_config();
        config.stall_threshold = Duration::from_millis(100);

        let result = dispatch(&broker, "claude-sonnet-4-5", &config, |attempt| async move {
            // 300ms of work, touching well inside the threshold
            for _ in 0..10 {
                attempt.activity.touch();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Ok("streamed")
        })
        .await;
        assert_eq!(result.unwrap(), "streamed");

        let account = broker.pool().account(0).await.unwrap();
        assert!(account.rate_limit_reset_times.is_empty(), "no cooldown recorded");
    }

    #[tokio::test]
    async fn explicit_rate_limit_marks_account_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a"), seed("b", "tok_b")]).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> =
            dispatch(&broker, "claude-sonnet-4-5", &fast_config(), move |_attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Upstream("upstream returned 429".into()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1, "explicit rate limits are not retried");
        match result.unwrap_err() {
            Error::RateLimited { account, family, message } => {
                assert_eq!(account, "a@example.com");
                assert_eq!(family, ModelFamily::Claude);
                assert!(message.contains("429"));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        let account = broker.pool().account(0).await.unwrap();
        assert!(account.is_rate_limited(ModelFamily::Claude, now_ms()));
    }

    #[tokio::test]
    async fn unrelated_errors_propagate_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;

        let result: Result<()> =
            dispatch(&broker, "claude-sonnet-4-5", &fast_config(), |_attempt| async move {
                Err(Error::Upstream("upstream refused the request body".into()))
            })
            .await;

        match result.unwrap_err() {
            Error::Upstream(message) => assert_eq!(message, "upstream refused the request body"),
            other => panic!("expected Upstream, got {other:?}"),
        }
        let account = broker.pool().account(0).await.unwrap();
        assert!(account.rate_limit_reset_times.is_empty(), "no cooldown for unrelated errors");
    }

    #[tokio::test]
    async fn wall_clock_deadline_cancels_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;
        let mut config = fast_config();
        config.stall_threshold = Duration::from_secs(60); // watchdog stays quiet
        config.wall_clock_timeout = Some(Duration::from_millis(50));

        let started = Instant::now();
        let result: Result<()> =
            dispatch(&broker, "claude-sonnet-4-5", &config, |_attempt| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result.unwrap_err(), Error::DeadlineExceeded { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "deadline must cut the attempt short"
        );
    }

    #[tokio::test]
    async fn empty_pool_fails_before_any_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![]).await;
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> =
            dispatch(&broker, "claude-sonnet-4-5", &fast_config(), move |_attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), Error::NoAccounts));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fully_rate_limited_pool_propagates_wait() {
        let dir = tempfile::tempdir().unwrap();
        let broker = broker_of(&dir, vec![seed("a", "tok_a")]).await;
        broker
            .pool()
            .mark_rate_limited(0, ModelFamily::Claude, 30_000)
            .await;

        let result: Result<()> =
            dispatch(&broker, "claude-sonnet-4-5", &fast_config(), |_attempt| async move {
                Ok(())
            })
            .await;

        match result.unwrap_err() {
            Error::RateLimitedAll { retry_after_ms, .. } => {
                assert!(retry_after_ms > 28_000 && retry_after_ms <= 30_000)
            }
            other => panic!("expected RateLimitedAll, got {other:?}"),
        }
    }
}
