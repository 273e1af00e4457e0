//! Multi-account credential pool and dispatch engine
//!
//! Multiplexes model API calls across a pool of OAuth-authenticated
//! Antigravity accounts to spread per-account rate limits. The engine
//! persists accounts to a versioned JSON store, selects the right account
//! per request from family-scoped rate-limit state and account tier,
//! refreshes expired access tokens lazily, detects explicit and silent
//! rate limits, and retries stalled requests against a fresh account —
//! all behind a single stable `{access, refresh, projectId, expires}`
//! credential projection.
//!
//! Request flow:
//! 1. [`dispatch::dispatch`] wraps the caller's streaming closure in a
//!    bounded retry with an activity watchdog
//! 2. [`broker::CredentialBroker`] selects an account per attempt and
//!    guarantees a live access token (one refresh fallback)
//! 3. [`pool::AccountPool`] owns selection state behind a single mutex
//! 4. [`store::AccountStore`] persists every mutation that should survive
//!    a restart
//!
//! The pool is an explicit long-lived object owned by the application root;
//! tests construct fresh instances against temp-dir stores.

pub mod account;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod store;

pub use account::{Account, AccountTier, CredentialHealth, ModelFamily, SeedCredential, SwitchReason};
pub use broker::{Credential, CredentialBroker, Issued};
pub use config::Config;
pub use dispatch::{
    ANTIGRAVITY_PROVIDER, ActivityTracker, Attempt, DispatchConfig, dispatch, is_rate_limit_error,
};
pub use error::{Error, Result};
pub use pool::{AccountPool, AccountUpdate, MAX_ACCOUNTS, Selected, SelectionMode};
pub use store::{AccountStorage, AccountStore, LEGACY_PROVIDER_KEY, STORAGE_VERSION, load_legacy_seed};
