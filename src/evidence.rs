//! Evidence Collector (C3). Persists per-attempt artifacts — diffs,
//! scope checks, completion checks, custom checks, gate snapshots, final
//! tree — under a job-scoped directory tree, and returns the relative
//! path for inclusion in ledger entries.

use std::path::{Path, PathBuf};

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("failed to create evidence directory {0}: {1}")]
    Mkdir(PathBuf, std::io::Error),
    #[error("failed to write evidence file {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to serialize evidence: {0}")]
    Serialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy)]
pub enum EvidenceKind {
    Diffs,
    Checks,
    Commands,
    Gates,
    Sessions,
}

impl EvidenceKind {
    fn dirname(self) -> &'static str {
        match self {
            EvidenceKind::Diffs => "diffs",
            EvidenceKind::Checks => "checks",
            EvidenceKind::Commands => "commands",
            EvidenceKind::Gates => "gates",
            EvidenceKind::Sessions => "sessions",
        }
    }
}

pub struct EvidenceCollector {
    job_dir: PathBuf,
}

impl EvidenceCollector {
    pub fn new(job_dir: &Path) -> Self {
        EvidenceCollector {
            job_dir: job_dir.to_path_buf(),
        }
    }

    fn dir_for(&self, kind: EvidenceKind) -> PathBuf {
        self.job_dir.join("evidence").join(kind.dirname())
    }

    /// Writes `value` as pretty JSON under `evidence/<kind>/<role>-<label>.json`
    /// and returns the path relative to the job directory.
    pub fn record<T: Serialize>(
        &self,
        kind: EvidenceKind,
        role: &str,
        label: &str,
        value: &T,
    ) -> Result<PathBuf, EvidenceError> {
        let dir = self.dir_for(kind);
        std::fs::create_dir_all(&dir).map_err(|e| EvidenceError::Mkdir(dir.clone(), e))?;

        let filename = format!("{role}-{label}-{}.json", Self::timestamp_token());
        let path = dir.join(&filename);
        let json = serde_json::to_string_pretty(value).map_err(EvidenceError::Serialize)?;
        std::fs::write(&path, json).map_err(|e| EvidenceError::Write(path.clone(), e))?;

        Ok(PathBuf::from("evidence")
            .join(kind.dirname())
            .join(&filename))
    }

    pub fn record_diff<T: Serialize>(&self, role: &str, diff: &T) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Diffs, role, "diff", diff)
    }

    pub fn record_scope_check<T: Serialize>(
        &self,
        role: &str,
        result: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Checks, role, "scope", result)
    }

    pub fn record_completion_check<T: Serialize>(
        &self,
        role: &str,
        result: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Checks, role, "completion", result)
    }

    pub fn record_custom_check<T: Serialize>(
        &self,
        role: &str,
        label: &str,
        result: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Checks, role, label, result)
    }

    pub fn record_command<T: Serialize>(
        &self,
        role: &str,
        label: &str,
        result: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Commands, role, label, result)
    }

    pub fn record_gate<T: Serialize>(
        &self,
        gate_id: &str,
        label: &str,
        value: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Gates, gate_id, label, value)
    }

    pub fn record_session<T: Serialize>(
        &self,
        role: &str,
        label: &str,
        value: &T,
    ) -> Result<PathBuf, EvidenceError> {
        self.record(EvidenceKind::Sessions, role, label, value)
    }

    /// Captures a final file-tree listing of the worktree (via `git
    /// ls-files`, already noise-filtered by the caller) at job
    /// finalization.
    pub fn capture_final_tree(&self, files: &[String]) -> Result<PathBuf, EvidenceError> {
        let path = self.job_dir.join("evidence").join("final-tree.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EvidenceError::Mkdir(parent.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(files).map_err(EvidenceError::Serialize)?;
        std::fs::write(&path, json).map_err(|e| EvidenceError::Write(path.clone(), e))?;
        Ok(PathBuf::from("evidence/final-tree.json"))
    }

    pub fn capture_terminal_snapshot<T: Serialize>(&self, snapshot: &T) -> Result<PathBuf, EvidenceError> {
        let path = self.job_dir.join("evidence").join("terminal-state.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EvidenceError::Mkdir(parent.to_path_buf(), e))?;
        }
        let json = serde_json::to_string_pretty(snapshot).map_err(EvidenceError::Serialize)?;
        std::fs::write(&path, json).map_err(|e| EvidenceError::Write(path.clone(), e))?;
        Ok(PathBuf::from("evidence/terminal-state.json"))
    }

    fn timestamp_token() -> String {
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_writes_under_kind_dir() {
        let dir = tempfile::tempdir().unwrap();
        let collector = EvidenceCollector::new(dir.path());
        let rel = collector
            .record_diff("worker", &json!({"files": []}))
            .unwrap();
        assert!(rel.starts_with("evidence/diffs"));
        assert!(dir.path().join(&rel).exists());
    }

    #[test]
    fn capture_final_tree_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let collector = EvidenceCollector::new(dir.path());
        let files = vec!["src/main.rs".to_string(), "Cargo.toml".to_string()];
        let rel = collector.capture_final_tree(&files).unwrap();
        let content = std::fs::read_to_string(dir.path().join(&rel)).unwrap();
        let read_back: Vec<String> = serde_json::from_str(&content).unwrap();
        assert_eq!(read_back, files);
    }
}
