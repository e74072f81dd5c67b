use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub database: PathBuf,
    /// Snapshot file of the file-backed ledger.
    pub ledger: PathBuf,
    pub chain_id: u64,
    pub ledger_timeout_ms: u64,
    /// How many times an anchor is re-read after an indeterminate write or
    /// failed read-back before the run is declared a partial commit.
    pub read_back_attempts: u32,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("winetrace.db"),
            ledger: PathBuf::from("ledger.json"),
            chain_id: 11155111,
            ledger_timeout_ms: 30_000,
            read_back_attempts: 3,
        }
    }
}

impl TraceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: TraceConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger_timeout_ms == 0 {
            return Err(TraceError::Config("ledger_timeout_ms must be greater than 0".into()));
        }
        if self.read_back_attempts == 0 {
            return Err(TraceError::Config("read_back_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    pub fn with_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger = path.into();
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.ledger_timeout_ms = ms;
        self
    }

    pub fn with_read_back_attempts(mut self, attempts: u32) -> Self {
        self.read_back_attempts = attempts;
        self
    }
}
