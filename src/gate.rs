//! Gate Controller (C8). Resolves a gate's required inputs, renders a
//! decision model to a human-prompt interface, records the
//! presentation and resolution, and computes a deterministic
//! fingerprint used to auto-reapply a prior approval on resume.

use std::io::{self, BufRead, Write as IoWrite};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::contract::{ApprovalScope, Gate};
use crate::evidence::{EvidenceCollector, EvidenceError};
use crate::ledger::{Ledger, LedgerError};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error("failed to read decision from human-prompt interface: {0}")]
    Prompt(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedInput {
    pub name: String,
    pub path: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateDecisionModel {
    pub gate_id: String,
    pub trigger: String,
    pub approval_scope: ApprovalScope,
    pub approval_expectations: Vec<String>,
    pub business_outcomes: Vec<String>,
    pub functional_scope: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub resolved_inputs: Vec<ResolvedInput>,
}

#[derive(Debug, Clone)]
pub struct GateResolution {
    pub decision: Decision,
    pub notes: Option<String>,
}

/// The seam a richer interactive shell plugs into; the crate ships one
/// blocking stdio implementation, sufficient to drive end-to-end
/// scenarios without a TUI.
pub trait HumanPrompt: Send + Sync {
    fn present(&self, model: &GateDecisionModel) -> Result<GateResolution, GateError>;
}

pub struct StdioPrompt;

impl HumanPrompt for StdioPrompt {
    fn present(&self, model: &GateDecisionModel) -> Result<GateResolution, GateError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "--- gate: {} ({}) ---", model.gate_id, model.trigger).ok();
        for input in &model.resolved_inputs {
            writeln!(out, "  input {} -> {} (exists={})", input.name, input.path, input.exists)
                .ok();
        }
        for outcome in &model.business_outcomes {
            writeln!(out, "  business outcome: {outcome}").ok();
        }
        for scope in &model.functional_scope {
            writeln!(out, "  in scope: {scope}").ok();
        }
        write!(out, "approve/reject> ").ok();
        out.flush().ok();

        let stdin = io::stdin();
        let mut line = String::new();
        stdin.lock().read_line(&mut line).map_err(GateError::Prompt)?;
        let decision = if line.trim().eq_ignore_ascii_case("approve") {
            Decision::Approve
        } else {
            Decision::Reject
        };
        Ok(GateResolution { decision, notes: None })
    }
}

pub struct GateController<'a> {
    repo_root: &'a Path,
    ledger: &'a Ledger,
    evidence: &'a EvidenceCollector,
    prompt: &'a dyn HumanPrompt,
}

impl<'a> GateController<'a> {
    pub fn new(
        repo_root: &'a Path,
        ledger: &'a Ledger,
        evidence: &'a EvidenceCollector,
        prompt: &'a dyn HumanPrompt,
    ) -> Self {
        GateController { repo_root, ledger, evidence, prompt }
    }

    /// Substitutes `<id>` in a required-input's path value, resolves it
    /// relative to the repo root, falling back to a case-insensitive
    /// directory scan when the literal path doesn't exist and contains
    /// no glob metacharacters.
    fn resolve_input_path(&self, job_id: &str, value: &str) -> (PathBuf, bool) {
        let substituted = value.replace("<id>", job_id);
        let candidate = self.repo_root.join(&substituted);
        if candidate.exists() {
            return (candidate, true);
        }
        if substituted.contains('*') || substituted.contains('?') {
            return (candidate, false);
        }
        if let Some(found) = case_insensitive_lookup(self.repo_root, &substituted) {
            return (found, true);
        }
        (candidate, false)
    }

    fn build_decision_model(&self, gate_id: &str, gate: &Gate, job_id: &str) -> GateDecisionModel {
        let resolved_inputs = gate
            .required_inputs
            .iter()
            .filter(|i| i.kind == "path")
            .map(|i| {
                let (path, exists) = self.resolve_input_path(job_id, &i.value);
                let content_hash = if exists {
                    std::fs::read(&path).ok().map(|bytes| hex_sha256(&bytes))
                } else {
                    None
                };
                ResolvedInput {
                    name: i.name.clone(),
                    path: path.display().to_string(),
                    exists,
                    content_hash,
                }
            })
            .collect();

        let (business_outcomes, functional_scope) = match gate.approval_scope {
            ApprovalScope::BuildRequirements => {
                (gate.business_outcomes.clone(), gate.functional_scope.clone())
            }
            ApprovalScope::PhaseOutput => (Vec::new(), gate.functional_scope.clone()),
            ApprovalScope::Both => {
                (gate.business_outcomes.clone(), gate.functional_scope.clone())
            }
        };

        GateDecisionModel {
            gate_id: gate_id.to_string(),
            trigger: gate.trigger.clone(),
            approval_scope: gate.approval_scope,
            approval_expectations: gate.approval_expectations.clone(),
            business_outcomes,
            functional_scope,
            out_of_scope: gate.out_of_scope.clone(),
            resolved_inputs,
        }
    }

    /// Deterministic over gate identity, scope, rendered content and
    /// each resolved input's existence/content hash — never over
    /// wall-clock or process state, so it is stable across resumes.
    pub fn fingerprint(model: &GateDecisionModel) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.gate_id.as_bytes());
        hasher.update(model.trigger.as_bytes());
        hasher.update(format!("{:?}", model.approval_scope).as_bytes());
        for s in model
            .approval_expectations
            .iter()
            .chain(model.business_outcomes.iter())
            .chain(model.functional_scope.iter())
            .chain(model.out_of_scope.iter())
        {
            hasher.update(s.as_bytes());
        }
        for input in &model.resolved_inputs {
            hasher.update(input.name.as_bytes());
            hasher.update([input.exists as u8]);
            if let Some(hash) = &input.content_hash {
                hasher.update(hash.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Looks up the last `gate_resolved` record for this gate id and
    /// returns it only when its decision was `approve` and its
    /// fingerprint matches — a `reject` is never auto-reapplied.
    pub fn auto_reapply_decision(
        &self,
        gate_id: &str,
        fingerprint: &str,
    ) -> Result<Option<GateResolution>, GateError> {
        for record in self.ledger.find_by_type("gate_resolved")? {
            let Some(rid) = record.data.get("gateId").and_then(|v| v.as_str()) else {
                continue;
            };
            if rid != gate_id {
                continue;
            }
            let decision = record.data.get("decision").and_then(|v| v.as_str());
            let fp = record.data.get("fingerprint").and_then(|v| v.as_str());
            if decision == Some("approve") && fp == Some(fingerprint) {
                return Ok(Some(GateResolution { decision: Decision::Approve, notes: None }));
            }
        }
        Ok(None)
    }

    /// Presents `gate`, recording presentation and resolution evidence.
    /// Attempts auto-reapply before invoking the human-prompt
    /// interface.
    pub fn present_gate(
        &self,
        gate_id: &str,
        gate: &Gate,
        job_id: &str,
    ) -> Result<GateResolution, GateError> {
        let model = self.build_decision_model(gate_id, gate, job_id);
        let fingerprint = Self::fingerprint(&model);

        self.ledger.append(
            "gate_presented",
            serde_json::json!({ "gateId": gate_id, "trigger": gate.trigger }),
        )?;
        self.evidence.record_gate(gate_id, "presented", &model)?;

        if let Some(resolution) = self.auto_reapply_decision(gate_id, &fingerprint)? {
            self.record_resolution(gate_id, &resolution, &fingerprint)?;
            return Ok(resolution);
        }

        let resolution = self.prompt.present(&model)?;
        self.record_resolution(gate_id, &resolution, &fingerprint)?;
        Ok(resolution)
    }

    fn record_resolution(
        &self,
        gate_id: &str,
        resolution: &GateResolution,
        fingerprint: &str,
    ) -> Result<(), GateError> {
        self.ledger.append(
            "gate_resolved",
            serde_json::json!({
                "gateId": gate_id,
                "decision": resolution.decision.as_str(),
                "notes": resolution.notes,
                "fingerprint": fingerprint,
            }),
        )?;
        self.evidence.record_gate(
            gate_id,
            "resolution",
            &serde_json::json!({
                "decision": resolution.decision.as_str(),
                "notes": resolution.notes,
                "fingerprint": fingerprint,
            }),
        )?;
        Ok(())
    }
}

fn case_insensitive_lookup(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for component in Path::new(relative).components() {
        let wanted = component.as_os_str().to_string_lossy().to_lowercase();
        let entries = std::fs::read_dir(&current).ok()?;
        let mut matched = None;
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().to_lowercase() == wanted {
                matched = Some(entry.path());
                break;
            }
        }
        current = matched?;
    }
    Some(current)
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Minimal hex encoder so the crate doesn't pull in a dedicated `hex`
/// dependency for this one call site.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{GateOutcomes, RequiredInput};

    struct AutoApprove;
    impl HumanPrompt for AutoApprove {
        fn present(&self, _model: &GateDecisionModel) -> Result<GateResolution, GateError> {
            Ok(GateResolution { decision: Decision::Approve, notes: Some("lgtm".into()) })
        }
    }

    fn sample_gate() -> Gate {
        Gate {
            trigger: "planning->execution".into(),
            audience: "PO".into(),
            approval_scope: ApprovalScope::BuildRequirements,
            approval_expectations: vec!["looks good".into()],
            business_outcomes: vec!["ship it".into()],
            functional_scope: vec!["worker writes src/**".into()],
            out_of_scope: vec![],
            required_inputs: vec![RequiredInput {
                name: "vision".into(),
                kind: "path".into(),
                value: "vision.md".into(),
            }],
            outcomes: GateOutcomes { approve: "execution".into(), reject: "planning".into() },
        }
    }

    #[test]
    fn present_gate_records_presentation_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vision.md"), "# Vision\ndo the thing").unwrap();
        let job_dir = dir.path().join(".nibbler/jobs/job-1");
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);
        let prompt = AutoApprove;
        let controller = GateController::new(dir.path(), &ledger, &evidence, &prompt);

        let resolution = controller.present_gate("plan", &sample_gate(), "job-1").unwrap();
        assert_eq!(resolution.decision, Decision::Approve);

        let presented = ledger.find_by_type("gate_presented").unwrap();
        let resolved = ledger.find_by_type("gate_resolved").unwrap();
        assert_eq!(presented.len(), 1);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].data["decision"], "approve");
    }

    #[test]
    fn auto_reapply_only_fires_on_matching_approve() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vision.md"), "# Vision\nsame content").unwrap();
        let job_dir = dir.path().join(".nibbler/jobs/job-1");
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);
        let prompt = AutoApprove;
        let controller = GateController::new(dir.path(), &ledger, &evidence, &prompt);

        controller.present_gate("plan", &sample_gate(), "job-1").unwrap();

        struct PanicPrompt;
        impl HumanPrompt for PanicPrompt {
            fn present(&self, _model: &GateDecisionModel) -> Result<GateResolution, GateError> {
                panic!("must not be called when auto-reapply fires");
            }
        }
        let controller2 = GateController::new(dir.path(), &ledger, &evidence, &PanicPrompt);
        let resolution = controller2.present_gate("plan", &sample_gate(), "job-1").unwrap();
        assert_eq!(resolution.decision, Decision::Approve);
    }

    #[test]
    fn fingerprint_changes_when_input_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vision.md"), "v1").unwrap();
        let job_dir = dir.path().join(".nibbler/jobs/job-1");
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);
        let prompt = AutoApprove;
        let controller = GateController::new(dir.path(), &ledger, &evidence, &prompt);

        let model1 = controller.build_decision_model("plan", &sample_gate(), "job-1");
        let fp1 = GateController::fingerprint(&model1);

        std::fs::write(dir.path().join("vision.md"), "v2").unwrap();
        let model2 = controller.build_decision_model("plan", &sample_gate(), "job-1");
        let fp2 = GateController::fingerprint(&model2);

        assert_ne!(fp1, fp2);
    }

    #[test]
    fn case_insensitive_fallback_resolves_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("VISION.MD"), "x").unwrap();
        let (path, exists) = {
            let job_dir = dir.path().join(".nibbler/jobs/job-1");
            let ledger = Ledger::open(&job_dir);
            let evidence = EvidenceCollector::new(&job_dir);
            let prompt = AutoApprove;
            let controller = GateController::new(dir.path(), &ledger, &evidence, &prompt);
            controller.resolve_input_path("job-1", "vision.md")
        };
        assert!(exists);
        assert_eq!(path.file_name().unwrap().to_string_lossy(), "VISION.MD");
    }
}
