//! Configuration loading.
//!
//! A [`Config`] starts from built-in defaults, can be read from a JSON
//! file, and honours a single environment override for the shared root
//! ([`ROOT_ENV_VAR`]). Everything else is set programmatically.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, thread};

use crate::constants::{
    DEFAULT_POLL_INTERVAL, DEFAULT_RESCAN_INTERVAL, DEFAULT_SETTLE_ATTEMPTS,
    DEFAULT_SETTLE_INITIAL_DELAY, DEFAULT_SETTLE_MAX_DELAY, DEFAULT_SUBFOLDER,
    DEFAULT_SYNC_FOLDER, ROOT_ENV_VAR,
};

/// Which OS mechanism the tracker uses to learn about changes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Native notifications (inotify, kqueue, FSEvents).
    #[default]
    Native,
    /// Periodic stat sweeps at [`Config::poll_interval_ms`].
    Poll,
}

/// Bounded backoff used while waiting for a replicated path to appear.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SettleConfig {
    /// Number of re-checks after the first one. Zero checks exactly once.
    pub max_attempts: u32,
    /// Wait before the first re-check, doubled each attempt.
    pub initial_delay_ms: u64,
    /// Cap for a single wait.
    pub max_delay_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SETTLE_ATTEMPTS,
            initial_delay_ms: DEFAULT_SETTLE_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_SETTLE_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl SettleConfig {
    /// Never wait: a path is either visible on the first check or skipped.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before re-check number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Wait until `path` exists, re-checking with exponential backoff.
    ///
    /// Returns `false` if the path is still missing after the last attempt.
    pub fn wait_for(&self, path: &Path) -> bool {
        if path.exists() {
            return true;
        }
        for attempt in 0..self.max_attempts {
            thread::sleep(self.delay_for(attempt));
            if path.exists() {
                log::debug!(
                    "{} became visible after {} re-check(s)",
                    path.display(),
                    attempt + 1
                );
                return true;
            }
        }
        false
    }
}

/// Runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Shared root inside the synchronized folder.
    pub root: PathBuf,
    /// Watch backend selection.
    pub watch_mode: WatchMode,
    /// Sweep interval of the polling backend, in milliseconds.
    pub poll_interval_ms: u64,
    /// Interval of the monitor thread's safety rescan, in milliseconds.
    /// Zero disables the periodic rescan.
    pub rescan_interval_ms: u64,
    /// Backoff for paths that are still replicating.
    pub settle: SettleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            watch_mode: WatchMode::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            rescan_interval_ms: DEFAULT_RESCAN_INTERVAL.as_millis() as u64,
            settle: SettleConfig::default(),
        }
    }
}

impl Config {
    /// Default configuration rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// `$HOME/Dropbox/socks`, or a relative `Dropbox/socks` if the home
    /// directory cannot be determined.
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| {
                log::warn!("Could not determine home directory, using a relative root");
                PathBuf::new()
            })
            .join(DEFAULT_SYNC_FOLDER)
            .join(DEFAULT_SUBFOLDER)
    }

    /// Defaults with the environment override applied.
    #[must_use]
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    /// Applies [`ROOT_ENV_VAR`] from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ROOT_ENV_VAR).filter(|r| !r.is_empty()) {
            self.root = PathBuf::from(root);
        }
    }

    /// Poll backend interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Safety rescan interval, `None` when disabled.
    #[must_use]
    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }
}
