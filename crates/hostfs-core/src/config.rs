// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge configuration

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notifier::WakeStrategy;

pub const DEFAULT_MAX_READ: usize = 128 * 1024;

/// Environment variable overriding the tick interval (milliseconds).
pub const ENV_TICK_MS: &str = "HOSTFS_TICK_MS";
/// Environment variable selecting the explicit wake strategy when `1`/`true`.
pub const ENV_WAKE: &str = "HOSTFS_WAKE";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Whether opens requesting write access reach the host at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenPolicy {
    /// Reject non-read-only opens with `EACCES` before issuing a request.
    #[default]
    ReadOnly,
    /// Forward every open to the host.
    PassThrough,
}

/// Kernel cache lifetimes for attribute and entry replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub attr_ttl_ms: u64,
    pub entry_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub wake: WakeStrategy,
    pub open_policy: OpenPolicy,
    /// libfuse-style `-o` options, e.g. `fsname=hostfs` or `allow_other`.
    pub mount_options: Vec<String>,
    /// Size of the per-session kernel I/O buffer in bytes.
    pub max_read: usize,
    pub cache: CacheConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            wake: WakeStrategy::default(),
            open_policy: OpenPolicy::default(),
            mount_options: Vec::new(),
            max_read: DEFAULT_MAX_READ,
            cache: CacheConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Read a JSON config file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `HOSTFS_TICK_MS` / `HOSTFS_WAKE` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(ENV_TICK_MS) {
            let interval_ms = value.trim().parse::<u64>().map_err(|_| ConfigError::Env {
                var: ENV_TICK_MS,
                value: value.clone(),
            })?;
            self.wake = WakeStrategy::Tick { interval_ms };
        }
        if let Some(value) = lookup(ENV_WAKE) {
            if value == "1" || value.eq_ignore_ascii_case("true") {
                self.wake = WakeStrategy::Wake;
            }
        }
        Ok(())
    }
}
