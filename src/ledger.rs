//! Append-only JSON-lines event log (C2). One ledger per job, at
//! `.nibbler/jobs/<id>/ledger.jsonl`. The ledger is the authoritative
//! event history: every decision that affects retry, resume or
//! reporting must be reconstructable from it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to open ledger at {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("failed to write ledger record: {0}")]
    Write(std::io::Error),
    #[error("failed to read ledger at {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to serialize ledger record: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub record_type: String,
    pub data: Value,
}

/// Terminator event types — exactly one must appear in a job's ledger by
/// the time the job manager's main loop exits.
pub const TERMINATOR_TYPES: &[&str] = &[
    "job_completed",
    "job_failed",
    "job_budget_exceeded",
    "job_cancelled",
];

pub struct Ledger {
    path: PathBuf,
    // Serializes appends within this process; multiple Ledger handles for
    // the same job never exist concurrently (single orchestrator, §5).
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn open(job_dir: &Path) -> Self {
        Ledger {
            path: job_dir.join("ledger.jsonl"),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record_type: &str, data: Value) -> Result<(), LedgerError> {
        let record = LedgerRecord {
            timestamp: Utc::now(),
            record_type: record_type.to_string(),
            data,
        };
        let line = serde_json::to_string(&record).map_err(LedgerError::Serialize)?;

        let _guard = self.write_lock.lock().unwrap();
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::Open(self.path.clone(), e))?;
        writeln!(file, "{line}").map_err(LedgerError::Write)?;
        Ok(())
    }

    /// Parses every line, skipping malformed ones — a partially-written
    /// line from a crash mid-append must never block recovery.
    pub fn read_all(&self) -> Result<Vec<LedgerRecord>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| LedgerError::Read(self.path.clone(), e))?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<LedgerRecord>(l).ok())
            .collect())
    }

    pub fn find_by_type(&self, record_type: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.record_type == record_type)
            .collect())
    }

    pub fn last_by_type(&self, record_type: &str) -> Result<Option<LedgerRecord>, LedgerError> {
        Ok(self.find_by_type(record_type)?.into_iter().last())
    }

    pub fn terminator(&self) -> Result<Option<LedgerRecord>, LedgerError> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|r| TERMINATOR_TYPES.contains(&r.record_type.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_and_read_all() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path());
        ledger.append("job_started", json!({"jobId": "j-1"})).unwrap();
        ledger.append("session_complete", json!({"role": "worker"})).unwrap();

        let all = ledger.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].record_type, "job_started");
        assert_eq!(all[1].record_type, "session_complete");
    }

    #[test]
    fn find_by_type_filters() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path());
        ledger.append("session_reverted", json!({"attempt": 1})).unwrap();
        ledger.append("session_complete", json!({})).unwrap();
        ledger.append("session_reverted", json!({"attempt": 2})).unwrap();

        let reverted = ledger.find_by_type("session_reverted").unwrap();
        assert_eq!(reverted.len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path());
        ledger.append("job_started", json!({})).unwrap();
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(ledger.path())
                .unwrap();
            writeln!(file, "{{not valid json").unwrap();
        }
        ledger.append("job_completed", json!({})).unwrap();

        let all = ledger.read_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn append_only_prefix_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path());
        for i in 0..5 {
            ledger.append("tick", json!({"i": i})).unwrap();
        }
        let first_five = ledger.read_all().unwrap();
        ledger.append("tick", json!({"i": 5})).unwrap();
        let after = ledger.read_all().unwrap();
        assert_eq!(&after[..5].iter().map(|r| r.data.clone()).collect::<Vec<_>>(),
                   &first_five.iter().map(|r| r.data.clone()).collect::<Vec<_>>());
        assert_eq!(after.len(), 6);
    }

    #[test]
    fn terminator_finds_any_terminal_type() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path());
        ledger.append("session_complete", json!({})).unwrap();
        assert!(ledger.terminator().unwrap().is_none());
        ledger.append("job_budget_exceeded", json!({})).unwrap();
        let term = ledger.terminator().unwrap().unwrap();
        assert_eq!(term.record_type, "job_budget_exceeded");
    }
}
