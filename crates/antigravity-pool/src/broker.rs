//! Credential broker
//!
//! The public entry point of the engine: given a model identifier, pick an
//! account, make sure its access token is live (refreshing lazily), and hand
//! back a stable `{access, refresh, projectId, expires}` projection. When the
//! selected account cannot be refreshed it is cooled down for 60 seconds and
//! exactly one fallback account is tried before giving up.
//!
//! The broker persists after every successful issue so `lastUsed` and
//! rotation progress survive restarts. Persistence failures are logged, not
//! fatal — a credential in hand beats a durable cursor.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use antigravity_auth::probe::{LivenessProbe, ProbeOutcome};
use antigravity_auth::token::TokenRefresher;

use crate::account::{ModelFamily, now_ms};
use crate::error::{Error, Result};
use crate::pool::{AccountPool, AccountUpdate, Selected, SelectionMode};
use crate::store::{AccountStore, load_legacy_seed};

/// Cooldown applied to an account whose token refresh failed, so the next
/// selection does not immediately hand back the same bad account.
const REFRESH_FAILURE_COOLDOWN: Duration = Duration::from_secs(60);

/// The credential projection callers consume.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access: String,
    pub refresh: String,
    pub project_id: String,
    pub expires: Option<u64>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .field("project_id", &self.project_id)
            .field("expires", &self.expires)
            .finish()
    }
}

/// A credential plus the identity of the account that issued it. The
/// dispatch loop needs the identity to mark the right account on failure;
/// external callers see only the [`Credential`].
#[derive(Debug, Clone)]
pub struct Issued {
    pub index: usize,
    pub account_label: String,
    pub credential: Credential,
}

/// Long-lived broker owned by the application root.
pub struct CredentialBroker {
    pool: AccountPool,
    store: AccountStore,
    refresher: TokenRefresher,
    probe: LivenessProbe,
}

impl CredentialBroker {
    pub fn new(
        pool: AccountPool,
        store: AccountStore,
        refresher: TokenRefresher,
        probe: LivenessProbe,
    ) -> Self {
        Self {
            pool,
            store,
            refresher,
            probe,
        }
    }

    /// Build the broker from persisted state.
    ///
    /// Prefers the multi-account store; when it is absent or empty, falls
    /// back to the legacy single-credential file and persists the import
    /// immediately so it only happens once.
    pub async fn bootstrap(
        store: AccountStore,
        legacy_path: Option<&Path>,
        refresher: TokenRefresher,
        probe: LivenessProbe,
    ) -> Self {
        let pool = match store.load().await {
            Some(storage) if !storage.accounts.is_empty() => AccountPool::from_storage(storage),
            _ => match legacy_path {
                Some(path) => match load_legacy_seed(path).await {
                    Some(seed) => AccountPool::from_seed(seed),
                    None => AccountPool::empty(),
                },
                None => AccountPool::empty(),
            },
        };

        let broker = Self::new(pool, store, refresher, probe);
        if !broker.pool.is_empty().await {
            broker.persist().await;
        }
        broker
    }

    pub fn pool(&self) -> &AccountPool {
        &self.pool
    }

    /// Resolve a currently-usable credential for a model.
    ///
    /// Returns `Ok(None)` when no usable account exists (empty pool, or the
    /// selected account has no project id). Fails with `RateLimitedAll`
    /// when every account is limited for the model's family, and with
    /// `RefreshFailed` when neither the selected account nor one fallback
    /// could produce a live token.
    pub async fn get_credential_for_model(&self, model_id: &str) -> Result<Option<Credential>> {
        Ok(self.issue(model_id).await?.map(|issued| issued.credential))
    }

    /// Like [`Self::get_credential_for_model`] but keeps the issuing
    /// account's identity, for the dispatch loop.
    pub async fn issue(&self, model_id: &str) -> Result<Option<Issued>> {
        let family = ModelFamily::from_model_id(model_id);
        let mode = if self.pool.len().await >= 2 {
            SelectionMode::RoundRobin
        } else {
            SelectionMode::Sticky
        };

        let Some(selected) = self.pool.select_for_family(family, mode).await else {
            let retry_after_ms = self.pool.min_wait_for_family(family).await;
            if retry_after_ms > 0 {
                return Err(Error::RateLimitedAll {
                    family,
                    retry_after_ms,
                });
            }
            return Ok(None);
        };

        let label = selected.account.label(selected.index);
        let Some(project_id) = non_empty(selected.account.project_id.clone()) else {
            warn!(account = %label, "selected account has no project id, cannot issue credential");
            return Ok(None);
        };

        if !selected.account.needs_refresh(now_ms()) {
            self.persist().await;
            return Ok(Some(Issued {
                index: selected.index,
                account_label: label,
                credential: Credential {
                    access: selected.account.access.clone().unwrap_or_default(),
                    refresh: selected.account.refresh_token.clone(),
                    project_id,
                    expires: selected.account.expires,
                },
            }));
        }

        // Stale token: refresh, and on failure cool the account down and try
        // exactly one fallback.
        match self.refresh_into_credential(&selected, &project_id).await {
            Some(issued) => Ok(Some(issued)),
            None => {
                warn!(
                    account = %label,
                    family = %family,
                    cooldown_secs = REFRESH_FAILURE_COOLDOWN.as_secs(),
                    "token refresh failed, cooling account down and trying a fallback"
                );
                self.pool
                    .mark_rate_limited(
                        selected.index,
                        family,
                        REFRESH_FAILURE_COOLDOWN.as_millis() as u64,
                    )
                    .await;

                if let Some(fallback) = self.pool.select_for_family(family, mode).await {
                    if fallback.index != selected.index {
                        if let Some(fb_project) = non_empty(fallback.account.project_id.clone()) {
                            if !fallback.account.needs_refresh(now_ms()) {
                                self.persist().await;
                                return Ok(Some(Issued {
                                    index: fallback.index,
                                    account_label: fallback.account.label(fallback.index),
                                    credential: Credential {
                                        access: fallback.account.access.clone().unwrap_or_default(),
                                        refresh: fallback.account.refresh_token.clone(),
                                        project_id: fb_project,
                                        expires: fallback.account.expires,
                                    },
                                }));
                            }
                            if let Some(issued) =
                                self.refresh_into_credential(&fallback, &fb_project).await
                            {
                                return Ok(Some(issued));
                            }
                        }
                    }
                }

                Err(Error::RefreshFailed { account: label })
            }
        }
    }

    /// Run the liveness probes for one account and record the outcome.
    ///
    /// A definitive probe result flips the account's credential health (and
    /// is persisted); an inconclusive one leaves it untouched.
    pub async fn verify_account(&self, index: usize) -> Result<ProbeOutcome> {
        let Some(account) = self.pool.account(index).await else {
            return Err(Error::NoAccounts);
        };
        let label = account.label(index);
        if non_empty(account.project_id.clone()).is_none() {
            return Err(Error::NoProjectId { account: label });
        }

        let access = if account.needs_refresh(now_ms()) {
            match self
                .refresher
                .refresh(&account.refresh_token, account.project_id.as_deref())
                .await
            {
                Some(token) => {
                    self.pool
                        .update_account(
                            index,
                            AccountUpdate {
                                access: Some(token.access.clone()),
                                expires: Some(token.expires),
                                ..Default::default()
                            },
                        )
                        .await;
                    token.access
                }
                None => return Err(Error::RefreshFailed { account: label }),
            }
        } else {
            account.access.clone().unwrap_or_default()
        };

        let outcome = self.probe.probe(&access, account.project_id.as_deref()).await;
        match &outcome {
            ProbeOutcome::Valid => {
                info!(account = %label, "probe confirmed account credentials");
                self.pool.mark_valid_credentials(index).await;
            }
            ProbeOutcome::Invalid(reason) => {
                warn!(account = %label, reason = %reason, "probe rejected account credentials");
                self.pool.mark_invalid_credentials(index, reason.clone()).await;
            }
            ProbeOutcome::Inconclusive(reason) => {
                warn!(account = %label, reason = %reason, "probe inconclusive, leaving health unchanged");
            }
        }
        self.persist().await;
        Ok(outcome)
    }

    /// Mark an account rate-limited and persist the new state. Called by the
    /// dispatch loop on explicit and silent rate-limit detection.
    pub async fn report_rate_limited(&self, index: usize, family: ModelFamily, duration: Duration) {
        self.pool
            .mark_rate_limited(index, family, duration.as_millis() as u64)
            .await;
        self.persist().await;
    }

    async fn refresh_into_credential(&self, selected: &Selected, project_id: &str) -> Option<Issued> {
        let token = self
            .refresher
            .refresh(&selected.account.refresh_token, Some(project_id))
            .await?;
        self.pool
            .update_account(
                selected.index,
                AccountUpdate {
                    access: Some(token.access.clone()),
                    expires: Some(token.expires),
                    ..Default::default()
                },
            )
            .await;
        self.persist().await;
        Some(Issued {
            index: selected.index,
            account_label: selected.account.label(selected.index),
            credential: Credential {
                access: token.access,
                refresh: selected.account.refresh_token.clone(),
                project_id: project_id.to_string(),
                expires: Some(token.expires),
            },
        })
    }

    async fn persist(&self) {
        let snapshot = self.pool.snapshot().await;
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "failed to persist account store");
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
