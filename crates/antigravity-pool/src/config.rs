//! Configuration loading
//!
//! Precedence: CLI path > `ANTIGRAVITY_CONFIG` env > default file name.
//! The state directory resolves env > config file > `~/.antigravity-gateway`
//! and holds both the multi-account store and the legacy credential file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Multi-account store file name inside the state directory.
const ACCOUNTS_FILE: &str = "accounts.json";

/// Legacy single-credential file name inside the state directory.
const LEGACY_AUTH_FILE: &str = "auth.json";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// Pool/state settings
#[derive(Debug, Default, Deserialize)]
pub struct PoolConfig {
    pub state_dir: Option<PathBuf>,
}

/// Dispatch settings
#[derive(Debug, Default, Deserialize)]
pub struct DispatchSettings {
    /// Optional per-request wall-clock deadline, seconds
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;

        if config.dispatch.timeout_secs == Some(0) {
            return Err(Error::Config(
                "dispatch.timeout_secs must be greater than 0".into(),
            ));
        }
        if let Some(dir) = &config.pool.state_dir {
            if dir.as_os_str().is_empty() {
                return Err(Error::Config("pool.state_dir must not be empty".into()));
            }
        }

        Ok(config)
    }

    /// Load from the resolved path, or fall back to defaults when no config
    /// file exists.
    pub fn load_or_default(cli_path: Option<&str>) -> Result<Self> {
        let path = Self::resolve_path(cli_path);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve config file path from CLI arg or `ANTIGRAVITY_CONFIG` env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("ANTIGRAVITY_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("antigravity-gateway.toml")
    }

    /// State directory: `ANTIGRAVITY_STATE_DIR` env > config file > home.
    pub fn state_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("ANTIGRAVITY_STATE_DIR") {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Some(dir) = &self.pool.state_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".antigravity-gateway")
    }

    /// Path of the multi-account store file.
    pub fn accounts_path(&self) -> PathBuf {
        self.state_dir().join(ACCOUNTS_FILE)
    }

    /// Path of the legacy single-credential seed file.
    pub fn legacy_auth_path(&self) -> PathBuf {
        self.state_dir().join(LEGACY_AUTH_FILE)
    }

    /// Wall-clock deadline for dispatch, when configured.
    pub fn wall_clock_timeout(&self) -> Option<Duration> {
        self.dispatch.timeout_secs.map(Duration::from_secs)
    }
}
