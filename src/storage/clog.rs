//! Commit log
//!
//! Tuple headers name their creating and deleting transactions; the commit
//! log records which of those transactions committed so headers can be
//! interpreted after a restart. Records are JSON lines appended to
//! `commit.log`. A transaction without a commit record is aborted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::tuple::TxnId;
use crate::error::Result;

/// Type of log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClogRecordType {
    Commit,
    Abort,
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClogRecord {
    /// Log Sequence Number
    pub lsn: u64,
    pub txn: TxnId,
    pub record_type: ClogRecordType,
}

/// What a replay of the log established
#[derive(Debug, Default)]
pub struct ClogState {
    pub committed: HashSet<TxnId>,
    pub max_txn: TxnId,
    pub next_lsn: u64,
}

#[derive(Debug)]
struct LogFile {
    file: File,
    next_lsn: u64,
}

/// Append-only commit log
#[derive(Debug)]
pub struct CommitLog {
    inner: Mutex<Option<LogFile>>,
    path: Option<PathBuf>,
    sync: bool,
}

impl CommitLog {
    /// A log that records nothing, for in-memory databases
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(None),
            path: None,
            sync: false,
        }
    }

    /// Open (or create) the log at `path` and replay it
    pub fn open(path: impl AsRef<Path>, sync: bool) -> Result<(Self, ClogState)> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            Self::replay(&path)?
        } else {
            ClogState::default()
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let log = Self {
            inner: Mutex::new(Some(LogFile {
                file,
                next_lsn: state.next_lsn,
            })),
            path: Some(path),
            sync,
        };
        Ok((log, state))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record and push it to disk
    pub fn append(&self, txn: TxnId, record_type: ClogRecordType) -> Result<u64> {
        let mut guard = self.inner.lock();
        let Some(log) = guard.as_mut() else {
            return Ok(0);
        };
        let record = ClogRecord {
            lsn: log.next_lsn,
            txn,
            record_type,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        log.file.write_all(&line)?;
        log.file.flush()?;
        if self.sync {
            log.file.sync_data()?;
        }
        log.next_lsn += 1;
        Ok(record.lsn)
    }

    /// Read all records from disk. A torn final line is ignored.
    pub fn read_from_log(path: &Path) -> Result<Vec<ClogRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        let mut lines = reader.lines().peekable();

        while let Some(line) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) if lines.peek().is_none() => {
                    warn!(error = %e, "ignoring torn commit log tail");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(records)
    }

    fn replay(path: &Path) -> Result<ClogState> {
        let mut state = ClogState::default();
        for record in Self::read_from_log(path)? {
            state.max_txn = state.max_txn.max(record.txn);
            state.next_lsn = state.next_lsn.max(record.lsn + 1);
            if record.record_type == ClogRecordType::Commit {
                state.committed.insert(record.txn);
            }
        }
        Ok(state)
    }
}
