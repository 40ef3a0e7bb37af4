//! End-to-end scenarios against the public `JobManager` API, using a
//! scripted in-process `Runner` fixture instead of a real agent process.
//! Covers the scenarios from the testable-properties section not already
//! exercised by `src/job.rs`'s inline tests (happy path, budget exhaustion).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command as StdCommand;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use nibbler::config::EngineConfig;
use nibbler::contract::{
    ApprovalScope, Authority, Budget, CompletionCriterion, Contract, EscalationTarget, Gate,
    GateOutcomes, GlobalLifetime, Phase, RequiredInput, Role, Successor,
};
use nibbler::gate::{Decision, GateDecisionModel, GateError, GateResolution, HumanPrompt};
use nibbler::job::{JobManager, JobOutcome};
use nibbler::ledger::Ledger;
use nibbler::protocol::NibblerEvent;
use nibbler::runner::{
    Runner, RunnerCapabilities, RunnerError, RunnerMessage, SessionHandle, SpawnRequest,
};
use nibbler::state::{next_job_id, JobMode};

fn init_repo(dir: &std::path::Path) {
    StdCommand::new("git").args(["init"]).current_dir(dir).output().unwrap();
    StdCommand::new("git")
        .args(["config", "user.email", "test@test.com"])
        .current_dir(dir)
        .output()
        .unwrap();
    StdCommand::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().unwrap();
    std::fs::write(dir.join("README.md"), "# repo\n").unwrap();
    StdCommand::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
    StdCommand::new("git").args(["commit", "-m", "init"]).current_dir(dir).output().unwrap();
}

fn write_vision_and_architecture(dir: &std::path::Path) {
    std::fs::write(dir.join("vision.md"), "# Vision\nbuild it").unwrap();
    std::fs::write(dir.join("architecture.md"), "# Architecture\nkeep it simple").unwrap();
    StdCommand::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
    StdCommand::new("git").args(["commit", "-m", "vision+arch"]).current_dir(dir).output().unwrap();
}

fn sample_contract() -> Contract {
    let mut roles = BTreeMap::new();
    roles.insert(
        "architect".to_string(),
        Role {
            scope: vec!["vision.md".into(), "architecture.md".into(), ".nibbler-staging/**".into()],
            authority: Authority::default(),
            verification_method: "manual".into(),
            budget: Budget {
                max_iterations: 3,
                exhaustion_escalation: EscalationTarget::Terminate,
                ..Default::default()
            },
        },
    );
    roles.insert(
        "worker".to_string(),
        Role {
            scope: vec!["src/**".into()],
            authority: Authority::default(),
            verification_method: "automated".into(),
            budget: Budget {
                max_iterations: 2,
                exhaustion_escalation: EscalationTarget::Role("architect".into()),
                ..Default::default()
            },
        },
    );

    let mut gates = BTreeMap::new();
    gates.insert(
        "plan".to_string(),
        Gate {
            trigger: "planning->execution".into(),
            audience: "PO".into(),
            approval_scope: ApprovalScope::BuildRequirements,
            approval_expectations: vec!["looks good".into()],
            business_outcomes: vec!["ship it".into()],
            functional_scope: vec!["worker writes src/**".into()],
            out_of_scope: vec![],
            required_inputs: vec![
                RequiredInput { name: "vision".into(), kind: "path".into(), value: "vision.md".into() },
                RequiredInput { name: "architecture".into(), kind: "path".into(), value: "architecture.md".into() },
                RequiredInput {
                    name: "acceptance".into(),
                    kind: "path".into(),
                    value: ".nibbler/jobs/<id>/plan/acceptance.md".into(),
                },
            ],
            outcomes: GateOutcomes { approve: "execution".into(), reject: "planning".into() },
        },
    );

    Contract {
        roles,
        phases: vec![
            Phase {
                id: "planning".into(),
                actors: vec!["architect".into()],
                input_boundaries: vec![],
                output_boundaries: vec![".nibbler/jobs/<id>/plan/acceptance.md".into()],
                completion_criteria: vec![CompletionCriterion::ArtifactExists {
                    pattern: ".nibbler/jobs/<id>/plan/acceptance.md".into(),
                }],
                successors: vec![Successor { on: "done".into(), next: "execution".into() }],
                is_terminal: false,
            },
            Phase {
                id: "execution".into(),
                actors: vec!["worker".into()],
                input_boundaries: vec![],
                output_boundaries: vec!["src/**".into()],
                completion_criteria: vec![CompletionCriterion::DiffNonEmpty],
                successors: vec![],
                is_terminal: true,
            },
        ],
        gates,
        shared_scopes: vec![],
        global_lifetime: GlobalLifetime { max_time_ms: 3_600_000, exhaustion_escalation: EscalationTarget::Terminate },
    }
}

struct AutoApprove;
impl HumanPrompt for AutoApprove {
    fn present(&self, _model: &GateDecisionModel) -> Result<GateResolution, GateError> {
        Ok(GateResolution { decision: Decision::Approve, notes: None })
    }
}

/// Rejects the gate's first presentation, approves every one after.
struct RejectThenApprove {
    calls: AtomicUsize,
}

impl RejectThenApprove {
    fn new() -> Self {
        RejectThenApprove { calls: AtomicUsize::new(0) }
    }
}

impl HumanPrompt for RejectThenApprove {
    fn present(&self, _model: &GateDecisionModel) -> Result<GateResolution, GateError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let decision = if n == 0 { Decision::Reject } else { Decision::Approve };
        Ok(GateResolution { decision, notes: None })
    }
}

/// A fixture runner that writes a queued `(relative_path, content)` pair
/// into the session workspace (if any remain) before emitting a scripted
/// terminal event, standing in for an agent that actually edits the repo.
/// An attempt with no queued write emits the event with no file change.
struct FileWritingRunner {
    calls: AsyncMutex<Vec<(PathBuf, String)>>,
}

impl FileWritingRunner {
    fn new(writes: Vec<(PathBuf, String)>) -> Self {
        FileWritingRunner { calls: AsyncMutex::new(writes) }
    }
}

#[async_trait]
impl Runner for FileWritingRunner {
    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities { interactive: false, permissions: true, stream_json: true }
    }

    async fn spawn(
        &self,
        req: SpawnRequest,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), RunnerError> {
        let mut calls = self.calls.lock().await;
        if !calls.is_empty() {
            let (rel, content) = calls.remove(0);
            let path = req.workspace.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx.send(RunnerMessage::Event(NibblerEvent::PhaseComplete { summary: None })).await;
        });
        Ok((SessionHandle { id: "t".into(), pid: None, started_at_iso: Utc::now() }, rx))
    }

    async fn send(&self, _h: &SessionHandle, _p: &str) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn is_alive(&self, _h: &SessionHandle) -> bool {
        false
    }

    async fn stop(&self, _h: &SessionHandle) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// A runner whose session never completes a write and never needs to —
/// used for scenarios where the job terminates before any session spawns.
struct UnusedRunner;

#[async_trait]
impl Runner for UnusedRunner {
    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities { interactive: false, permissions: true, stream_json: true }
    }

    async fn spawn(
        &self,
        _req: SpawnRequest,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), RunnerError> {
        panic!("this scenario must never spawn a session")
    }

    async fn send(&self, _h: &SessionHandle, _p: &str) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn is_alive(&self, _h: &SessionHandle) -> bool {
        false
    }

    async fn stop(&self, _h: &SessionHandle) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Scenario 2: worker's first attempt writes out of scope, its second
/// attempt writes in scope — expect a revert followed by a completed job.
#[tokio::test]
async fn scope_violation_then_retry_recovers() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_vision_and_architecture(dir.path());

    let contract = sample_contract();
    let expected_job_id = next_job_id(dir.path());
    let plan_rel = format!(".nibbler/jobs/{expected_job_id}/plan/acceptance.md");

    let runner: Arc<dyn Runner> = Arc::new(FileWritingRunner::new(vec![
        (PathBuf::from(&plan_rel), "# Acceptance\nDone".into()),
        (PathBuf::from("README-out-of-scope.md"), "oops".into()),
        (PathBuf::from("src/ok.ts"), "export const ok = true;\n".into()),
    ]));
    let manager = JobManager::new(dir.path().to_path_buf(), EngineConfig::default(), runner, Arc::new(AutoApprove));

    let outcome = manager.run_contract_job(&contract, JobMode::Build, "ship it".into()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Ok), "{outcome:?}");

    let job_dir = dir.path().join(".nibbler/jobs").join(&expected_job_id);
    let ledger = Ledger::open(&job_dir);
    let records = ledger.read_all().unwrap();

    let reverted_index = records.iter().position(|r| r.record_type == "session_reverted");
    let completed_for_worker = records.iter().rposition(|r| {
        r.record_type == "session_complete" && r.data.get("role").and_then(|v| v.as_str()) == Some("worker")
    });
    assert!(reverted_index.is_some(), "expected at least one session_reverted record");
    assert!(completed_for_worker.is_some(), "expected a session_complete record for worker");
    assert!(reverted_index.unwrap() < completed_for_worker.unwrap());

    let terminator = ledger.terminator().unwrap().unwrap();
    assert_eq!(terminator.record_type, "job_completed");
}

/// Scenario 4: the gate rejects its first presentation (looping back to
/// planning) then approves the second — expect two `gate_resolved`
/// records for the same gate and exactly one final `job_completed`.
#[tokio::test]
async fn gate_rejection_then_approval_completes() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_vision_and_architecture(dir.path());

    let contract = sample_contract();
    let expected_job_id = next_job_id(dir.path());
    let plan_rel = format!(".nibbler/jobs/{expected_job_id}/plan/acceptance.md");

    // Architect's second attempt (after the gate loops back to planning)
    // needs no new write: `artifact_exists` finds the file the first
    // attempt already committed to the worktree.
    let runner: Arc<dyn Runner> = Arc::new(FileWritingRunner::new(vec![
        (PathBuf::from(&plan_rel), "# Acceptance\nDone".into()),
        (PathBuf::from("src/y.ts"), "export const y = 1;\n".into()),
    ]));
    let manager =
        JobManager::new(dir.path().to_path_buf(), EngineConfig::default(), runner, Arc::new(RejectThenApprove::new()));

    let outcome = manager.run_contract_job(&contract, JobMode::Build, "ship it".into()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Ok), "{outcome:?}");

    let job_dir = dir.path().join(".nibbler/jobs").join(&expected_job_id);
    let ledger = Ledger::open(&job_dir);
    let records = ledger.read_all().unwrap();

    let gate_resolutions: Vec<_> = records
        .iter()
        .filter(|r| r.record_type == "gate_resolved" && r.data.get("gateId").and_then(|v| v.as_str()) == Some("plan"))
        .collect();
    assert_eq!(gate_resolutions.len(), 2, "expected reject then approve: {records:?}");
    assert_eq!(gate_resolutions[0].data.get("decision").and_then(|v| v.as_str()), Some("reject"));
    assert_eq!(gate_resolutions[1].data.get("decision").and_then(|v| v.as_str()), Some("approve"));

    let terminators: Vec<_> = records
        .iter()
        .filter(|r| nibbler::ledger::TERMINATOR_TYPES.contains(&r.record_type.as_str()))
        .collect();
    assert_eq!(terminators.len(), 1);
    assert_eq!(terminators[0].record_type, "job_completed");
}

/// Scenario 5: a global lifetime budget that is already exhausted before
/// the first role session even spawns.
#[tokio::test]
async fn global_budget_exceeded_before_first_session() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_vision_and_architecture(dir.path());

    let mut contract = sample_contract();
    contract.global_lifetime = GlobalLifetime { max_time_ms: 0, exhaustion_escalation: EscalationTarget::Terminate };

    let expected_job_id = next_job_id(dir.path());

    let runner: Arc<dyn Runner> = Arc::new(UnusedRunner);
    let manager = JobManager::new(dir.path().to_path_buf(), EngineConfig::default(), runner, Arc::new(AutoApprove));

    let outcome = manager.run_contract_job(&contract, JobMode::Build, "ship it".into()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::BudgetExceeded { .. }), "{outcome:?}");

    let job_dir = dir.path().join(".nibbler/jobs").join(&expected_job_id);
    let ledger = Ledger::open(&job_dir);
    let terminator = ledger.terminator().unwrap().unwrap();
    assert_eq!(terminator.record_type, "job_budget_exceeded");
}

/// Scenario 6: worker's session exits cleanly without ever emitting a
/// `NIBBLER_EVENT`, but has made a valid in-scope change — verification
/// still runs deterministically and the role still completes.
struct ProtocolMissingRunner {
    plan_write: (PathBuf, String),
    worker_write: (PathBuf, String),
    calls: AsyncMutex<usize>,
}

#[async_trait]
impl Runner for ProtocolMissingRunner {
    fn capabilities(&self) -> RunnerCapabilities {
        RunnerCapabilities { interactive: false, permissions: true, stream_json: true }
    }

    async fn spawn(
        &self,
        req: SpawnRequest,
    ) -> Result<(SessionHandle, mpsc::Receiver<RunnerMessage>), RunnerError> {
        let mut calls = self.calls.lock().await;
        let (rel, content) = if *calls == 0 { &self.plan_write } else { &self.worker_write };
        let path = req.workspace.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        let first_call = *calls == 0;
        *calls += 1;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            if first_call {
                // Architect's planning session behaves normally.
                let _ = tx.send(RunnerMessage::Event(NibblerEvent::PhaseComplete { summary: None })).await;
            } else {
                // Worker exits clean with no protocol event at all.
                let _ = tx.send(RunnerMessage::Exited { code: Some(0), signal: None }).await;
            }
        });
        Ok((SessionHandle { id: "t".into(), pid: None, started_at_iso: Utc::now() }, rx))
    }

    async fn send(&self, _h: &SessionHandle, _p: &str) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn is_alive(&self, _h: &SessionHandle) -> bool {
        false
    }

    async fn stop(&self, _h: &SessionHandle) -> Result<(), RunnerError> {
        Ok(())
    }
}

#[tokio::test]
async fn protocol_missing_falls_back_to_deterministic_verification() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    write_vision_and_architecture(dir.path());

    let contract = sample_contract();
    let expected_job_id = next_job_id(dir.path());
    let plan_rel = format!(".nibbler/jobs/{expected_job_id}/plan/acceptance.md");

    let runner: Arc<dyn Runner> = Arc::new(ProtocolMissingRunner {
        plan_write: (PathBuf::from(&plan_rel), "# Acceptance\nDone".into()),
        worker_write: (PathBuf::from("src/z.ts"), "export const z = 1;\n".into()),
        calls: AsyncMutex::new(0),
    });
    let manager = JobManager::new(dir.path().to_path_buf(), EngineConfig::default(), runner, Arc::new(AutoApprove));

    let outcome = manager.run_contract_job(&contract, JobMode::Build, "ship it".into()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Ok), "{outcome:?}");

    let job_dir = dir.path().join(".nibbler/jobs").join(&expected_job_id);
    let ledger = Ledger::open(&job_dir);
    let records = ledger.read_all().unwrap();

    assert!(records.iter().any(|r| r.record_type == "protocol_missing"));
    assert!(records.iter().any(|r| {
        r.record_type == "session_complete" && r.data.get("role").and_then(|v| v.as_str()) == Some("worker")
    }));
    let terminator = ledger.terminator().unwrap().unwrap();
    assert_eq!(terminator.record_type, "job_completed");
}
