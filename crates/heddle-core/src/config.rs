//! Coordinator configuration (TOML).
//!
//! ```toml
//! [lease]
//! duration_ms = 30000
//! sweep_interval_ms = 5000
//! sweep_batch = 256
//!
//! [claim]
//! max_candidates = 8
//!
//! [tasks]
//! max_attempts = 3
//!
//! [store]
//! kind = "sqlite"
//! path = "heddle.db"
//! ```
//!
//! Every key is optional; missing keys take the defaults above (the default
//! store is in-memory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{HeddleError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeddleConfig {
    pub lease: LeaseConfig,
    pub claim: ClaimConfig,
    pub tasks: TasksConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    /// Ownership granted per claim/renew.
    pub duration_ms: u64,

    /// How often the lease monitor sweeps.
    pub sweep_interval_ms: u64,

    /// Expired tasks handled per sweep.
    pub sweep_batch: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: 30_000,
            sweep_interval_ms: 5_000,
            sweep_batch: 256,
        }
    }
}

impl LeaseConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimConfig {
    /// CAS attempts per claim call (the K budget).
    pub max_candidates: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self { max_candidates: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Retry budget for tasks whose run params don't set one.
    pub max_attempts: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Database file for the sqlite store.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from("heddle.db"),
        }
    }
}

impl HeddleConfig {
    /// Parse without validating.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read and parse a file without validating.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            HeddleError::Config(format!("reading config file at {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|e| HeddleError::Config(format!("{}: {e}", path.display())))
    }

    /// Read, parse and validate. The entry point for binaries.
    pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks that serde can't express.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(HeddleError::Config(msg.to_string()));

        if self.lease.duration_ms == 0 {
            return fail("[lease].duration_ms must be >= 1");
        }
        if self.lease.sweep_interval_ms == 0 {
            return fail("[lease].sweep_interval_ms must be >= 1");
        }
        if self.lease.sweep_interval_ms > self.lease.duration_ms {
            // A lease could otherwise stay expired for more than one lease length.
            return fail("[lease].sweep_interval_ms must not exceed [lease].duration_ms");
        }
        if self.lease.sweep_batch == 0 {
            return fail("[lease].sweep_batch must be >= 1");
        }
        if self.claim.max_candidates == 0 {
            return fail("[claim].max_candidates must be >= 1");
        }
        if self.tasks.max_attempts == 0 {
            return fail("[tasks].max_attempts must be >= 1");
        }
        if self.store.kind == StoreKind::Sqlite && self.store.path.as_os_str().is_empty() {
            return fail("[store].path is required for the sqlite store");
        }
        Ok(())
    }
}
