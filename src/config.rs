//! Engine tunables (C1-C12 ambient). Loaded from `nibbler.toml` at the
//! repo root; every field has a sane default so a repo with no config
//! file at all still runs.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub runner: RunnerTuning,
    #[serde(default)]
    pub policy: PolicyTuning,
    #[serde(default)]
    pub paths: PathConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { runner: RunnerTuning::default(), policy: PolicyTuning::default(), paths: PathConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerTuning {
    /// Seconds of silence from a session before `InactiveTimeout` fires.
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_timeout_secs: u64,
    /// Milliseconds to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_graceful_stop_ms")]
    pub graceful_stop_ms: u64,
    #[serde(default = "default_forceful_stop_ms")]
    pub forceful_stop_ms: u64,
}

impl Default for RunnerTuning {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_secs(),
            graceful_stop_ms: default_graceful_stop_ms(),
            forceful_stop_ms: default_forceful_stop_ms(),
        }
    }
}

fn default_inactivity_secs() -> u64 {
    600
}
fn default_graceful_stop_ms() -> u64 {
    1500
}
fn default_forceful_stop_ms() -> u64 {
    2500
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyTuning {
    /// Out-of-scope path count above which a violation is treated as
    /// structural (escalate) rather than a one-off retry.
    #[serde(default = "default_many_threshold")]
    pub many_threshold: usize,
    /// Consecutive scope-violation retries before escalating to the
    /// architect for a scope-exception decision.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Phase transitions allowed for a single job before it is forced
    /// to a terminal `failed` state as a runaway guard.
    #[serde(default = "default_max_phase_transitions")]
    pub max_phase_transitions: u32,
    #[serde(default = "default_http_smoke_timeout_ms")]
    pub http_smoke_timeout_ms: u64,
    #[serde(default = "default_http_request_timeout_ms")]
    pub http_request_timeout_ms: u64,
}

impl Default for PolicyTuning {
    fn default() -> Self {
        Self {
            many_threshold: default_many_threshold(),
            max_recovery_attempts: default_max_recovery_attempts(),
            max_phase_transitions: default_max_phase_transitions(),
            http_smoke_timeout_ms: default_http_smoke_timeout_ms(),
            http_request_timeout_ms: default_http_request_timeout_ms(),
        }
    }
}

fn default_many_threshold() -> usize {
    5
}
fn default_max_recovery_attempts() -> u32 {
    2
}
fn default_max_phase_transitions() -> u32 {
    50
}
fn default_http_smoke_timeout_ms() -> u64 {
    20_000
}
fn default_http_request_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathConfig {
    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: String,
    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: String,
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            ledger_dir: default_ledger_dir(),
            evidence_dir: default_evidence_dir(),
            jobs_dir: default_jobs_dir(),
        }
    }
}

fn default_ledger_dir() -> String {
    ".nibbler/ledger".into()
}
fn default_evidence_dir() -> String {
    ".nibbler/evidence".into()
}
fn default_jobs_dir() -> String {
    ".nibbler/jobs".into()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read nibbler.toml: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse nibbler.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize nibbler.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl EngineConfig {
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join("nibbler.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, repo_root: &Path) -> Result<(), ConfigError> {
        let path = repo_root.join("nibbler.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.policy.many_threshold = 9;
        config.save(dir.path()).unwrap();
        let loaded = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.policy.many_threshold, 9);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nibbler.toml"), "[policy]\nmany_threshold = 3\n").unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.policy.many_threshold, 3);
        assert_eq!(config.policy.max_recovery_attempts, default_max_recovery_attempts());
        assert_eq!(config.runner.inactivity_timeout_secs, default_inactivity_secs());
    }
}
