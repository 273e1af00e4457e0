//! In-memory account pool and selection
//!
//! The pool is the single shared mutable object: one `Mutex` guards the
//! account list, the sticky cursor (`current_index`), and the monotonic
//! round-robin cursor (`rotation_index`). Selection never suspends while
//! holding the lock, so no caller can observe a half-advanced cursor.
//!
//! Candidate selection prefers, in order: accounts with verified credentials
//! over unprobed ones, paid tier over free within that class, then
//! round-robin within the final class to spread usage.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::account::{
    Account, AccountTier, CredentialHealth, ModelFamily, SeedCredential, SwitchReason, now_ms,
};
use crate::store::{AccountStorage, STORAGE_VERSION};

/// Hard cap on pool size.
pub const MAX_ACCOUNTS: usize = 10;

/// How the pool picks an account for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Keep the current account until forced to switch.
    Sticky,
    /// Advance the rotation cursor through eligible accounts.
    RoundRobin,
}

/// A selected account: its stable positional index plus a snapshot taken
/// under the pool lock.
#[derive(Debug, Clone)]
pub struct Selected {
    pub index: usize,
    pub account: Account,
}

/// Only-provided-fields update applied by [`AccountPool::update_account`].
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub access: Option<String>,
    pub expires: Option<u64>,
    pub refresh_token: Option<String>,
    pub project_id: Option<String>,
    pub email: Option<String>,
    pub tier: Option<AccountTier>,
}

struct PoolState {
    accounts: Vec<Account>,
    current_index: usize,
    rotation_index: usize,
}

/// Process-wide account pool shared across concurrent callers.
pub struct AccountPool {
    state: Mutex<PoolState>,
}

impl AccountPool {
    /// Hydrate from stored state. Both cursors start at the stored active
    /// index, clamped into range.
    pub fn from_storage(storage: AccountStorage) -> Self {
        let len = storage.accounts.len();
        let start = if storage.active_index < len {
            storage.active_index
        } else {
            0
        };
        info!(accounts = len, active = start, "pool hydrated from store");
        Self {
            state: Mutex::new(PoolState {
                accounts: storage.accounts,
                current_index: start,
                rotation_index: start,
            }),
        }
    }

    /// Single-account pool from a seed credential.
    pub fn from_seed(seed: SeedCredential) -> Self {
        Self {
            state: Mutex::new(PoolState {
                accounts: vec![Account::from_seed(seed)],
                current_index: 0,
                rotation_index: 0,
            }),
        }
    }

    pub fn empty() -> Self {
        Self {
            state: Mutex::new(PoolState {
                accounts: Vec::new(),
                current_index: 0,
                rotation_index: 0,
            }),
        }
    }

    /// Select an account for a model family.
    ///
    /// Expired rate limits are pruned up front on every account, so a reset
    /// timestamp at or before now behaves exactly like an absent entry.
    pub async fn select_for_family(
        &self,
        family: ModelFamily,
        mode: SelectionMode,
    ) -> Option<Selected> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let index = state.select_for_family(family, mode, now)?;
        debug!(
            family = %family,
            ?mode,
            account = %state.accounts[index].label(index),
            "selected account"
        );
        Some(Selected {
            index,
            account: state.accounts[index].clone(),
        })
    }

    /// Append a new account. Returns false when the pool is at capacity.
    pub async fn add_account(&self, seed: SeedCredential) -> bool {
        let mut state = self.state.lock().await;
        if state.accounts.len() >= MAX_ACCOUNTS {
            warn!(cap = MAX_ACCOUNTS, "refusing to add account: pool at capacity");
            return false;
        }
        let account = Account::from_seed(seed);
        info!(account = %account.label(state.accounts.len()), "account added");
        state.accounts.push(account);
        true
    }

    /// Remove an account by index; the tail re-indexes and the sticky
    /// cursor is clamped back into range.
    pub async fn remove_account(&self, index: usize) -> bool {
        let mut state = self.state.lock().await;
        if index >= state.accounts.len() {
            return false;
        }
        let removed = state.accounts.remove(index);
        info!(account = %removed.label(index), "account removed");
        let last = state.accounts.len().saturating_sub(1);
        state.current_index = state.current_index.min(last);
        true
    }

    /// Mark an account rate-limited for a family until `now + duration_ms`.
    pub async fn mark_rate_limited(&self, index: usize, family: ModelFamily, duration_ms: u64) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(index) {
            warn!(
                account = %account.label(index),
                family = %family,
                duration_ms,
                "account rate-limited"
            );
            account.mark_rate_limited(family, duration_ms, now_ms());
        }
    }

    /// Record that an account's credentials were definitively rejected.
    pub async fn mark_invalid_credentials(&self, index: usize, error: impl Into<String>) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(index) {
            let error = error.into();
            warn!(account = %account.label(index), error = %error, "credentials marked invalid");
            account.mark_invalid(error, now_ms());
        }
    }

    /// Record that an account's credentials were verified reachable.
    pub async fn mark_valid_credentials(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(index) {
            debug!(account = %account.label(index), "credentials marked valid");
            account.mark_valid();
        }
    }

    /// Apply the provided fields; omitted fields are preserved.
    pub async fn update_account(&self, index: usize, update: AccountUpdate) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.get_mut(index) {
            if let Some(access) = update.access {
                account.access = Some(access);
            }
            if let Some(expires) = update.expires {
                account.expires = Some(expires);
            }
            if let Some(refresh_token) = update.refresh_token {
                account.refresh_token = refresh_token;
            }
            if let Some(project_id) = update.project_id {
                account.project_id = Some(project_id);
            }
            if let Some(email) = update.email {
                account.email = Some(email);
            }
            if let Some(tier) = update.tier {
                account.tier = Some(tier);
            }
        }
    }

    /// Reconcile an externally supplied seed against the pool, using the
    /// refresh token as the natural key: update in place when known,
    /// otherwise add. Returns false only when an add hits the cap.
    pub async fn upsert_seed(&self, seed: SeedCredential) -> bool {
        {
            let mut state = self.state.lock().await;
            if let Some(index) = state.find_by_refresh_token(&seed.refresh) {
                let account = &mut state.accounts[index];
                if seed.access.is_some() {
                    account.access = seed.access;
                }
                if seed.expires.is_some() {
                    account.expires = seed.expires;
                }
                if seed.project_id.is_some() {
                    account.project_id = seed.project_id;
                }
                if seed.email.is_some() {
                    account.email = seed.email;
                }
                if seed.tier.is_some() {
                    account.tier = seed.tier;
                }
                debug!(account = %account.label(index), "seed reconciled into existing account");
                return true;
            }
        }
        self.add_account(seed).await
    }

    /// Milliseconds until some account becomes usable for the family: zero
    /// when any account is already un-limited, otherwise the soonest reset.
    pub async fn min_wait_for_family(&self, family: ModelFamily) -> u64 {
        let state = self.state.lock().await;
        let now = now_ms();
        if state
            .accounts
            .iter()
            .any(|a| !a.is_rate_limited(family, now))
        {
            return 0;
        }
        state
            .accounts
            .iter()
            .filter_map(|a| a.rate_limit_reset_times.get(&family))
            .map(|reset| reset.saturating_sub(now))
            .min()
            .unwrap_or(0)
    }

    pub async fn find_by_refresh_token(&self, token: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.find_by_refresh_token(token)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of one account.
    pub async fn account(&self, index: usize) -> Option<Account> {
        let state = self.state.lock().await;
        state.accounts.get(index).cloned()
    }

    /// Snapshot of the whole pool in on-disk form, for persistence.
    pub async fn snapshot(&self) -> AccountStorage {
        let state = self.state.lock().await;
        AccountStorage {
            version: STORAGE_VERSION,
            active_index: state.current_index,
            accounts: state.accounts.clone(),
        }
    }

    /// Pool summary for embedders that surface account state.
    ///
    /// Status mapping: all usable → healthy, some → degraded, none →
    /// unhealthy, where usable means credentials not known-invalid.
    pub async fn status(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = now_ms();

        let mut usable = 0usize;
        let accounts: Vec<serde_json::Value> = state
            .accounts
            .iter()
            .enumerate()
            .map(|(index, a)| {
                if a.health() != CredentialHealth::Invalid {
                    usable += 1;
                }
                let limits: serde_json::Map<String, serde_json::Value> = a
                    .rate_limit_reset_times
                    .iter()
                    .filter(|(_, reset)| **reset > now)
                    .map(|(family, reset)| {
                        (
                            family.as_str().to_string(),
                            serde_json::json!(reset.saturating_sub(now)),
                        )
                    })
                    .collect();
                serde_json::json!({
                    "index": index,
                    "email": a.email,
                    "tier": a.tier,
                    "hasAccess": a.has_access,
                    "lastError": a.last_error,
                    "rateLimitedMs": limits,
                })
            })
            .collect();

        let total = state.accounts.len();
        let status = if usable == total && total > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "accountsTotal": total,
            "accountsUsable": usable,
            "accounts": accounts,
        })
    }
}

impl PoolState {
    fn find_by_refresh_token(&self, token: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.refresh_token == token)
    }

    fn select_for_family(
        &mut self,
        family: ModelFamily,
        mode: SelectionMode,
        now: u64,
    ) -> Option<usize> {
        for account in &mut self.accounts {
            account.prune_expired_limits(now);
        }
        if self.accounts.is_empty() {
            return None;
        }

        if mode == SelectionMode::RoundRobin && self.accounts.len() > 1 {
            let next = self.next_for_family(family, now)?;
            self.accounts[next].last_switch_reason = Some(SwitchReason::Rotation);
            self.current_index = next;
            return Some(next);
        }

        // Sticky: keep the current account unless it is limited for this
        // family, known-invalid, or a paid account is available and the
        // current one isn't.
        let keep_current = match self.accounts.get(self.current_index) {
            Some(current)
                if !current.is_rate_limited(family, now)
                    && current.health() != CredentialHealth::Invalid =>
            {
                let upgrade_available = current.tier != Some(AccountTier::Paid)
                    && self.accounts.iter().enumerate().any(|(i, a)| {
                        i != self.current_index
                            && a.tier == Some(AccountTier::Paid)
                            && !a.is_rate_limited(family, now)
                            && a.health() != CredentialHealth::Invalid
                    });
                !upgrade_available
            }
            _ => false,
        };
        if keep_current {
            let index = self.current_index;
            self.accounts[index].last_used = now;
            return Some(index);
        }

        let next = self.next_for_family(family, now)?;
        self.current_index = next;
        Some(next)
    }

    /// Round-robin pick from the best eligible class.
    ///
    /// Eligible: no active limit for the family, credentials not
    /// known-invalid. Class narrowing: verified accounts beat unprobed
    /// ones, paid beats free within whichever of those is non-empty.
    fn next_for_family(&mut self, family: ModelFamily, now: u64) -> Option<usize> {
        let candidates: Vec<usize> = self
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                !a.is_rate_limited(family, now) && a.health() != CredentialHealth::Invalid
            })
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let confirmed: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| self.accounts[i].health() == CredentialHealth::Verified)
            .collect();

        let paid_subset = |set: &[usize]| -> Vec<usize> {
            set.iter()
                .copied()
                .filter(|&i| self.accounts[i].tier == Some(AccountTier::Paid))
                .collect()
        };

        let pool = if !confirmed.is_empty() {
            let paid = paid_subset(&confirmed);
            if paid.is_empty() { confirmed } else { paid }
        } else {
            let paid = paid_subset(&candidates);
            if paid.is_empty() { candidates } else { paid }
        };

        let pick = pool[self.rotation_index % pool.len()];
        self.rotation_index = self.rotation_index.wrapping_add(1);
        self.accounts[pick].last_used = now;
        Some(pick)
    }
}
