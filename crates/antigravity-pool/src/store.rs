//! Durable account storage
//!
//! One versioned JSON file holds the whole pool. Loading is deliberately
//! forgiving: a missing file, malformed JSON, a wrong shape, or an unknown
//! version all read as "no stored state" — the caller falls back to seeding.
//! Saving is strict: parent directory mode 0700, file mode 0600, atomic
//! temp-file + rename so a crash leaves either the old or the new content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::{Account, SeedCredential, now_ms};
use crate::error::{Error, Result};

/// On-disk schema version. Anything else is treated as absent state.
pub const STORAGE_VERSION: u32 = 2;

/// Provider key in the legacy single-credential file.
pub const LEGACY_PROVIDER_KEY: &str = "google-antigravity";

/// On-disk shape of the account pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountStorage {
    pub version: u32,
    #[serde(default)]
    pub active_index: usize,
    pub accounts: Vec<Account>,
}

/// File-backed store for [`AccountStorage`].
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read stored state.
    ///
    /// Returns `None` for a missing file, unreadable file, malformed JSON,
    /// wrong shape, or `version != 2`. An out-of-range `activeIndex` is
    /// clamped to 0; expired rate-limit entries are pruned on the way in.
    pub async fn load(&self) -> Option<AccountStorage> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read account store");
                return None;
            }
        };

        let mut storage: AccountStorage = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "account store is malformed, ignoring");
                return None;
            }
        };

        if storage.version != STORAGE_VERSION {
            warn!(
                version = storage.version,
                expected = STORAGE_VERSION,
                "unknown account store version, ignoring"
            );
            return None;
        }

        if storage.active_index >= storage.accounts.len() {
            storage.active_index = 0;
        }

        let now = now_ms();
        for account in &mut storage.accounts {
            account.prune_expired_limits(now);
        }

        info!(
            path = %self.path.display(),
            accounts = storage.accounts.len(),
            "loaded account store"
        );
        Some(storage)
    }

    /// Persist the pool.
    ///
    /// Writes pretty JSON with a trailing newline to a temp file in the same
    /// directory, sets 0600, then renames over the target. The parent
    /// directory is created with mode 0700. Expired rate-limit entries are
    /// dropped before serialization.
    pub async fn save(&self, storage: &AccountStorage) -> Result<()> {
        let mut snapshot = storage.clone();
        let now = now_ms();
        for account in &mut snapshot.accounts {
            account.prune_expired_limits(now);
        }

        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Store("account store path has no parent directory".into()))?;

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Store(format!("creating state directory: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(dir, perms)
                .await
                .map_err(|e| Error::Store(format!("setting state directory permissions: {e}")))?;
        }

        let mut json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Store(format!("serializing account store: {e}")))?;
        json.push('\n');

        let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| Error::Store(format!("writing temp account store: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(|e| Error::Store(format!("setting account store permissions: {e}")))?;
        }

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::Store(format!("renaming temp account store: {e}")))?;

        debug!(path = %self.path.display(), accounts = snapshot.accounts.len(), "persisted account store");
        Ok(())
    }
}

/// Read the legacy single-credential file as a seed.
///
/// Shape: `{"google-antigravity": {"refresh": ..., "access": ...,
/// "expires": ..., "projectId": ...}}`. Used only when the multi-account
/// store is absent; any parse failure reads as "no seed".
pub async fn load_legacy_seed(path: &Path) -> Option<SeedCredential> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let parsed: HashMap<String, SeedCredential> = match serde_json::from_str(&contents) {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "legacy credential file is malformed, ignoring");
            return None;
        }
    };
    let seed = parsed.into_iter().find_map(|(provider, seed)| {
        (provider == LEGACY_PROVIDER_KEY).then_some(seed)
    })?;
    info!(path = %path.display(), "seeding pool from legacy credential file");
    Some(seed)
}
