//! Engine configuration
//!
//! `EngineConfig` collects every tunable of a database instance. It can be
//! built fluently or loaded from a JSON file; omitted fields keep their
//! defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::transaction::IsolationLevel;

/// When foreign key existence is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForeignKeyCheck {
    /// At commit, against the state the commit would publish
    Deferred,
    /// At the end of each statement
    Immediate,
}

/// Database engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding catalog, data, index and log files; `None` keeps
    /// everything in memory
    pub data_dir: Option<PathBuf>,
    /// Isolation used by `begin_default`
    pub default_isolation: IsolationLevel,
    /// Longest a writer waits on another transaction's write intent
    pub lock_timeout_ms: u64,
    /// Inactivity after which a transaction is reported by the idle sweep
    pub idle_timeout_ms: u64,
    /// Period of the background idle monitor
    pub sweep_interval_ms: u64,
    /// Force-abort idle transactions instead of only reporting them
    pub abort_idle: bool,
    pub foreign_key_check: ForeignKeyCheck,
    /// fsync data and log files on commit
    pub sync_on_commit: bool,
    /// Maximum nesting of trigger-enqueued writes
    pub max_trigger_depth: usize,
    /// Maximum keys per B+ tree node
    pub btree_order: usize,
    /// Abort the whole transaction on any statement error
    pub escalate_statement_errors: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_isolation: IsolationLevel::ReadCommitted,
            lock_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            sweep_interval_ms: 1_000,
            abort_idle: false,
            foreign_key_check: ForeignKeyCheck::Deferred,
            sync_on_commit: true,
            max_trigger_depth: 16,
            btree_order: 64,
            escalate_statement_errors: false,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Persist data under `dir`
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn abort_idle(mut self, abort: bool) -> Self {
        self.abort_idle = abort;
        self
    }

    pub fn foreign_key_check(mut self, check: ForeignKeyCheck) -> Self {
        self.foreign_key_check = check;
        self
    }

    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    pub fn max_trigger_depth(mut self, depth: usize) -> Self {
        self.max_trigger_depth = depth;
        self
    }

    pub fn btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    pub fn escalate_statement_errors(mut self, escalate: bool) -> Self {
        self.escalate_statement_errors = escalate;
        self
    }

    pub fn lock_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .default_isolation(IsolationLevel::Serializable)
            .lock_timeout(Duration::from_millis(250))
            .foreign_key_check(ForeignKeyCheck::Immediate);

        assert_eq!(config.default_isolation, IsolationLevel::Serializable);
        assert_eq!(config.lock_timeout_duration(), Duration::from_millis(250));
        assert_eq!(config.foreign_key_check, ForeignKeyCheck::Immediate);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapdb.json");
        std::fs::write(
            &path,
            r#"{ "default_isolation": "RepeatableRead", "btree_order": 8 }"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.default_isolation, IsolationLevel::RepeatableRead);
        assert_eq!(config.btree_order, 8);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }
}
