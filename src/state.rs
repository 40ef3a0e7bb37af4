//! Job State & Status Snapshot (C12). The in-memory job record plus a
//! persisted status.json used by resume and by external status
//! reporting. Snapshot writes go through a temp-file-then-rename so a
//! reader never observes a partially written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::DelegationPlan;
use crate::git::DiffSummary;
use crate::scope::ScopeOverridesByRole;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to serialize job state: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to parse job state at {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("failed to write job state at {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to read job state at {0}: {1}")]
    Read(PathBuf, std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Build,
    Fix,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLifecycle {
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeAttemptSummary {
    pub passed: bool,
    pub violation_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_violations: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionAttemptSummary {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_criteria: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub scope: ScopeAttemptSummary,
    pub completion: CompletionAttemptSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_decision: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionLiveness {
    pub active: bool,
    #[serde(default)]
    pub handle_id: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub seq: u32,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub started_at_iso: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at_iso: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: String,
    pub repo_root: PathBuf,
    pub worktree_path: PathBuf,
    pub source_branch: String,
    pub job_branch: String,
    pub mode: JobMode,
    pub description: String,

    pub current_phase_id: String,
    pub current_phase_actor_index: usize,
    #[serde(default)]
    pub current_role_id: Option<String>,
    #[serde(default)]
    pub roles_planned: Vec<String>,
    #[serde(default)]
    pub roles_completed: Vec<String>,

    #[serde(default)]
    pub attempts_by_role: BTreeMap<String, u32>,
    #[serde(default)]
    pub current_role_max_iterations: Option<u32>,

    #[serde(default)]
    pub feedback_by_role: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub feedback_history_by_role: BTreeMap<String, Vec<AttemptSummary>>,

    #[serde(default)]
    pub scope_overrides_by_role: ScopeOverridesByRole,

    #[serde(default)]
    pub session: SessionLiveness,

    pub state: JobLifecycle,
    #[serde(default)]
    pub pending_gate_id: Option<String>,

    #[serde(default)]
    pub pre_session_commit: Option<String>,
    #[serde(default)]
    pub last_diff: Option<DiffSummary>,
    #[serde(default)]
    pub delegation_plan: Option<DelegationPlan>,

    pub started_at_iso: DateTime<Utc>,
    pub global_budget_limit_ms: u64,

    #[serde(default)]
    pub finalized: bool,
}

impl JobState {
    pub fn new(
        job_id: String,
        repo_root: PathBuf,
        worktree_path: PathBuf,
        source_branch: String,
        job_branch: String,
        mode: JobMode,
        description: String,
        entry_phase_id: String,
        global_budget_limit_ms: u64,
    ) -> Self {
        JobState {
            job_id,
            repo_root,
            worktree_path,
            source_branch,
            job_branch,
            mode,
            description,
            current_phase_id: entry_phase_id,
            current_phase_actor_index: 0,
            current_role_id: None,
            roles_planned: Vec::new(),
            roles_completed: Vec::new(),
            attempts_by_role: BTreeMap::new(),
            current_role_max_iterations: None,
            feedback_by_role: BTreeMap::new(),
            feedback_history_by_role: BTreeMap::new(),
            scope_overrides_by_role: ScopeOverridesByRole::default(),
            session: SessionLiveness::default(),
            state: JobLifecycle::Executing,
            pending_gate_id: None,
            pre_session_commit: None,
            last_diff: None,
            delegation_plan: None,
            started_at_iso: Utc::now(),
            global_budget_limit_ms,
            finalized: false,
        }
    }

    pub fn job_dir(&self) -> PathBuf {
        self.repo_root.join(".nibbler/jobs").join(&self.job_id)
    }

    pub fn status_path(&self) -> PathBuf {
        self.job_dir().join("status.json")
    }

    pub fn global_elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at_iso).num_milliseconds().max(0)
    }

    /// Persists this state to `status.json` via a temp-file-then-rename
    /// so a concurrent reader never sees a half-written file.
    pub fn persist(&self) -> Result<(), StateError> {
        let path = self.status_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Write(path.clone(), e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(StateError::Serialize)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| StateError::Write(tmp_path.clone(), e))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StateError::Write(path.clone(), e))?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, StateError> {
        let raw = std::fs::read_to_string(path).map_err(|e| StateError::Read(path.to_path_buf(), e))?;
        serde_json::from_str(&raw).map_err(|e| StateError::Parse(path.to_path_buf(), e))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            JobLifecycle::Completed
                | JobLifecycle::Failed
                | JobLifecycle::Cancelled
                | JobLifecycle::BudgetExceeded
        )
    }
}

/// A compact read-only view for reporting/UI progress output, derived
/// from a `JobState` rather than stored directly.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    pub job_id: String,
    pub phase_id: String,
    pub role_id: Option<String>,
    pub roles_completed: usize,
    pub roles_planned: usize,
    pub state: JobLifecycle,
    pub pending_gate_id: Option<String>,
    pub global_elapsed_ms: i64,
    pub global_budget_limit_ms: u64,
}

impl From<&JobState> for ProgressView {
    fn from(state: &JobState) -> Self {
        ProgressView {
            job_id: state.job_id.clone(),
            phase_id: state.current_phase_id.clone(),
            role_id: state.current_role_id.clone(),
            roles_completed: state.roles_completed.len(),
            roles_planned: state.roles_planned.len(),
            state: state.state,
            pending_gate_id: state.pending_gate_id.clone(),
            global_elapsed_ms: state.global_elapsed_ms(),
            global_budget_limit_ms: state.global_budget_limit_ms,
        }
    }
}

/// Derives the next `j-YYYYMMDD-NNN` job id from existing entries under
/// `.nibbler/jobs/` for today's UTC date.
pub fn next_job_id(repo_root: &Path) -> String {
    let today = Utc::now().format("%Y%m%d").to_string();
    let jobs_dir = repo_root.join(".nibbler/jobs");
    let prefix = format!("j-{today}-");

    let mut max_seq = 0u32;
    if let Ok(entries) = std::fs::read_dir(&jobs_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(seq_str) = name.strip_prefix(&prefix) {
                if let Ok(seq) = seq_str.parse::<u32>() {
                    max_seq = max_seq.max(seq);
                }
            }
        }
    }
    format!("{prefix}{:03}", max_seq + 1)
}
