//! Job Manager (C11) — the hub. Drives the phase graph end to end: picks
//! actors per phase (respecting a delegation plan during execution),
//! runs each role's attempt loop (session, diff, scope/completion
//! verification, commit-or-revert, retry/escalation), enforces gates on
//! phase transitions, and finalizes the job with exactly one ledger
//! terminator. Every other component is a near-pure collaborator this
//! module wires together; almost nothing here is itself a policy
//! decision.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::config::EngineConfig;
use crate::contract::{Contract, EscalationTarget, Gate, Phase};
use crate::delegation::{resolve_delegation, DelegationPlan};
use crate::error::EngineError;
use crate::evidence::EvidenceCollector;
use crate::gate::{Decision, GateController, HumanPrompt};
use crate::git::{GitAdapter, MergeOptions};
use crate::ledger::Ledger;
use crate::policy::{self, CompletionContext, DelegatedTask};
use crate::protocol::NibblerEvent;
use crate::runner::{Runner, SessionMode, SpawnRequest, TaskType};
use crate::scope::{self, AttemptContext, OverrideKind, ScopeOverride};
use crate::session::{SessionController, SessionOutcome};
use crate::state::{
    next_job_id, AttemptSummary, CompletionAttemptSummary, JobLifecycle, JobMode, JobState,
    ScopeAttemptSummary,
};

const ARCHITECT_ROLE: &str = "architect";

/// The outcome the CLI surfaces to a user, per §7 of the data model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Ok,
    Failed { details: String },
    BudgetExceeded { details: String },
    Escalated { details: String },
    Cancelled { info: String },
}

enum RoleOutcome {
    Ok,
    Terminal(JobOutcome),
}

enum PlanStepOutcome {
    Proceed,
    Retry,
    Terminal(JobOutcome),
}

/// What a mediation session (architect escalation or scope-exception
/// decision) resolves to: either the failing role gets another attempt,
/// or the job ends.
enum MediationOutcome {
    Retry,
    Terminal(JobOutcome),
}

enum Transition {
    End,
    Next(String),
}

pub struct JobManager {
    repo_root: PathBuf,
    config: EngineConfig,
    runner: Arc<dyn Runner>,
    prompt: Arc<dyn HumanPrompt>,
    cancelled: Arc<AtomicBool>,
}

impl JobManager {
    pub fn new(
        repo_root: PathBuf,
        config: EngineConfig,
        runner: Arc<dyn Runner>,
        prompt: Arc<dyn HumanPrompt>,
    ) -> Self {
        JobManager {
            repo_root,
            config,
            runner,
            prompt,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests best-effort cancellation; the phase loop observes this at
    /// every iteration and the attempt loop observes it before spawning
    /// each new session.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Starts a brand new job at the contract's unique entry phase.
    pub async fn run_contract_job(
        &self,
        contract: &Contract,
        mode: JobMode,
        description: String,
    ) -> Result<JobOutcome, EngineError> {
        let git = GitAdapter::new(&self.repo_root);
        let source_branch = git.get_current_branch()?;
        let base_commit = git.get_current_commit()?;
        let job_id = next_job_id(&self.repo_root);
        let job_branch = format!("nibbler/{job_id}");
        git.create_branch_at(&job_branch, &base_commit)?;

        let repo_basename = self
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let worktree_root = self
            .repo_root
            .parent()
            .unwrap_or(self.repo_root.as_path())
            .join(format!(".nibbler-wt-{repo_basename}"));
        let worktree_path = worktree_root.join(&job_id);
        git.add_worktree(&worktree_path, &job_branch)?;

        let entry_phase = find_entry_phase(contract)?;

        let mut job = JobState::new(
            job_id,
            self.repo_root.clone(),
            worktree_path,
            source_branch,
            job_branch,
            mode,
            description,
            entry_phase,
            contract.global_lifetime.max_time_ms,
        );
        job.persist()?;
        let ledger = Ledger::open(&job.job_dir());
        ledger.append(
            "job_started",
            json!({"jobId": job.job_id, "mode": format!("{:?}", job.mode)}),
        )?;

        self.phase_loop(&mut job, contract).await
    }

    /// Starts an already-materialized job at a specific phase (used by the
    /// `fix` CLI entry point to re-enter the graph mid-way).
    pub async fn run_contract_job_from_phase(
        &self,
        mut job: JobState,
        contract: &Contract,
        phase_id: &str,
    ) -> Result<JobOutcome, EngineError> {
        job.current_phase_id = phase_id.to_string();
        job.current_phase_actor_index = 0;
        self.phase_loop(&mut job, contract).await
    }

    /// Resumes a persisted job. If it was paused awaiting a gate decision,
    /// the pending gate is resolved first (with auto-reapply available)
    /// before the phase loop continues.
    pub async fn resume_contract_job(
        &self,
        mut job: JobState,
        contract: &Contract,
    ) -> Result<JobOutcome, EngineError> {
        let job_dir = job.job_dir();
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);

        if job.state == JobLifecycle::Paused {
            if let Some(gate_id) = job.pending_gate_id.clone() {
                if let Some(gate) = contract.gates.get(&gate_id).cloned() {
                    let transition = self.enforce_gate(&job, &gate_id, &gate, &ledger, &evidence)?;
                    job.pending_gate_id = None;
                    job.state = JobLifecycle::Executing;
                    match transition {
                        Transition::End => {
                            let git = GitAdapter::new(&job.repo_root);
                            return self
                                .finalize(&mut job, &ledger, &evidence, &git, JobOutcome::Ok)
                                .await;
                        }
                        Transition::Next(phase_id) => {
                            job.current_phase_id = phase_id;
                            job.current_phase_actor_index = 0;
                        }
                    }
                    job.persist()?;
                }
            }
        }

        self.phase_loop(&mut job, contract).await
    }

    /// Cancels a job without re-entering the phase loop: stops any active
    /// session best-effort and finalizes with `job_cancelled`. Used by the
    /// `cancel` CLI entry point against a job persisted by another process.
    pub async fn cancel_job(
        &self,
        mut job: JobState,
        _contract: &Contract,
    ) -> Result<JobOutcome, EngineError> {
        let job_dir = job.job_dir();
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);
        let git = GitAdapter::new(&job.repo_root);
        self.cancel();
        if let Some(handle_id) = job.session.handle_id.clone() {
            let handle = crate::runner::SessionHandle {
                id: handle_id,
                pid: job.session.pid,
                started_at_iso: job.session.started_at_iso.unwrap_or_else(Utc::now),
            };
            let _ = self.runner.stop(&handle).await;
        }
        self.finalize(
            &mut job,
            &ledger,
            &evidence,
            &git,
            JobOutcome::Cancelled { info: "cancelled via CLI".into() },
        )
        .await
    }

    async fn phase_loop(
        &self,
        job: &mut JobState,
        contract: &Contract,
    ) -> Result<JobOutcome, EngineError> {
        let job_dir = job.job_dir();
        let ledger = Ledger::open(&job_dir);
        let evidence = EvidenceCollector::new(&job_dir);
        let git = GitAdapter::new(&job.repo_root);

        let mut transitions = 0u32;
        loop {
            if self.is_cancelled() {
                return self
                    .finalize(
                        job,
                        &ledger,
                        &evidence,
                        &git,
                        JobOutcome::Cancelled { info: "cancelled by operator".into() },
                    )
                    .await;
            }
            transitions += 1;
            if transitions > self.config.policy.max_phase_transitions {
                return self
                    .finalize(
                        job,
                        &ledger,
                        &evidence,
                        &git,
                        JobOutcome::Failed { details: "max phase transitions exceeded".into() },
                    )
                    .await;
            }

            let Some(phase) = contract.phase(&job.current_phase_id).cloned() else {
                return self
                    .finalize(
                        job,
                        &ledger,
                        &evidence,
                        &git,
                        JobOutcome::Failed {
                            details: format!("unknown phase '{}'", job.current_phase_id),
                        },
                    )
                    .await;
            };
            job.persist()?;

            if phase.id == "execution" {
                self.maybe_load_delegation_plan(job, contract, &ledger)?;
            }

            let actors = self.select_actors(job, &phase);

            while job.current_phase_actor_index < actors.len() {
                if self.is_cancelled() {
                    return self
                        .finalize(
                            job,
                            &ledger,
                            &evidence,
                            &git,
                            JobOutcome::Cancelled { info: "cancelled by operator".into() },
                        )
                        .await;
                }
                let (role_id, delegated_tasks) = actors[job.current_phase_actor_index].clone();
                job.current_role_id = Some(role_id.clone());
                job.persist()?;

                let result = self
                    .run_role_session(
                        job,
                        contract,
                        &phase,
                        &role_id,
                        &delegated_tasks,
                        &ledger,
                        &evidence,
                        &git,
                    )
                    .await?;

                match result {
                    RoleOutcome::Ok => {
                        if !job.roles_completed.contains(&role_id) {
                            job.roles_completed.push(role_id.clone());
                        }
                        job.current_phase_actor_index += 1;
                        job.persist()?;
                    }
                    RoleOutcome::Terminal(outcome) => {
                        return self.finalize(job, &ledger, &evidence, &git, outcome).await;
                    }
                }
            }

            job.current_phase_actor_index = 0;

            match self.resolve_transition(job, contract, &phase, &ledger, &evidence)? {
                Transition::End => {
                    return self.finalize(job, &ledger, &evidence, &git, JobOutcome::Ok).await;
                }
                Transition::Next(phase_id) => {
                    job.current_phase_id = phase_id;
                    job.persist()?;
                }
            }
        }
    }

    /// For the execution phase with a loaded delegation plan, the
    /// topological task order; otherwise each phase's declared actor
    /// list, none of them delegated.
    fn select_actors(&self, job: &JobState, phase: &Phase) -> Vec<(String, Vec<DelegatedTask>)> {
        if phase.id == "execution" {
            if let Some(plan) = &job.delegation_plan {
                let resolved = resolve_delegation(&plan.tasks);
                return resolved
                    .role_order
                    .iter()
                    .map(|role_id| {
                        let tasks = resolved.tasks_by_role.get(role_id).cloned().unwrap_or_default();
                        let delegated = tasks
                            .iter()
                            .map(|t| DelegatedTask {
                                task_id: t.task_id.clone(),
                                scope_hints: t.scope_hints.clone(),
                            })
                            .collect();
                        (role_id.clone(), delegated)
                    })
                    .collect();
            }
        }
        phase.actors.iter().map(|a| (a.clone(), Vec::new())).collect()
    }

    fn maybe_load_delegation_plan(
        &self,
        job: &mut JobState,
        contract: &Contract,
        ledger: &Ledger,
    ) -> Result<(), EngineError> {
        if job.delegation_plan.is_some() {
            return Ok(());
        }
        let rel = format!(".nibbler/jobs/{}/plan/delegation.yaml", job.job_id);
        for root in [job.worktree_path.clone(), job.repo_root.clone()] {
            let candidate = root.join(&rel);
            if !candidate.exists() {
                continue;
            }
            match DelegationPlan::load(&candidate) {
                Ok(plan) => {
                    if let Err(errors) = plan.validate(contract) {
                        warn!(?errors, "delegation plan failed validation; falling back to phase actor order");
                        return Ok(());
                    }
                    ledger.append("delegation_plan_loaded", json!({"tasks": plan.tasks.len()}))?;
                    job.delegation_plan = Some(plan);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse delegation plan");
                }
            }
        }
        Ok(())
    }

    fn resolve_transition(
        &self,
        job: &JobState,
        contract: &Contract,
        phase: &Phase,
        ledger: &Ledger,
        evidence: &EvidenceCollector,
    ) -> Result<Transition, EngineError> {
        let is_terminal_phase = phase.is_terminal || phase.successors.is_empty();
        if is_terminal_phase {
            let trigger = format!("{}->__END__", phase.id);
            if let Some((gate_id, gate)) = policy::should_enforce_gate(&trigger, contract) {
                return self.enforce_gate(job, gate_id, gate, ledger, evidence);
            }
            return Ok(Transition::End);
        }

        let successor = phase
            .successors
            .iter()
            .find(|s| s.on == "done")
            .or_else(|| phase.successors.first());
        let Some(successor) = successor else {
            return Ok(Transition::End);
        };

        let trigger = format!("{}->{}", phase.id, successor.next);
        if let Some((gate_id, gate)) = policy::should_enforce_gate(&trigger, contract) {
            return self.enforce_gate(job, gate_id, gate, ledger, evidence);
        }
        Ok(map_next(&successor.next))
    }

    fn enforce_gate(
        &self,
        job: &JobState,
        gate_id: &str,
        gate: &Gate,
        ledger: &Ledger,
        evidence: &EvidenceCollector,
    ) -> Result<Transition, EngineError> {
        let controller = GateController::new(&job.repo_root, ledger, evidence, self.prompt.as_ref());
        let resolution = controller.present_gate(gate_id, gate, &job.job_id)?;
        let outcome_str = match resolution.decision {
            Decision::Approve => &gate.outcomes.approve,
            Decision::Reject => &gate.outcomes.reject,
        };
        Ok(map_next(outcome_str))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_role_session(
        &self,
        job: &mut JobState,
        contract: &Contract,
        phase: &Phase,
        role_id: &str,
        delegated_tasks: &[DelegatedTask],
        ledger: &Ledger,
        evidence: &EvidenceCollector,
        git: &GitAdapter,
    ) -> Result<RoleOutcome, EngineError> {
        let Some(base_role) = contract.role(role_id) else {
            return Ok(RoleOutcome::Terminal(JobOutcome::Failed {
                details: format!("role '{role_id}' not found in contract"),
            }));
        };
        job.current_role_max_iterations = Some(base_role.budget.max_iterations);
        let is_planning = phase.id == "planning";

        loop {
            if self.is_cancelled() {
                return Ok(RoleOutcome::Terminal(JobOutcome::Cancelled {
                    info: "cancelled by operator".into(),
                }));
            }
            if policy::check_global_budget(job.global_elapsed_ms() as u64, contract) {
                return Ok(RoleOutcome::Terminal(JobOutcome::BudgetExceeded {
                    details: "global lifetime exceeded".into(),
                }));
            }

            self.repair_worktree(job, git);

            let pre_session_commit = git.get_current_commit()?;
            job.pre_session_commit = Some(pre_session_commit.clone());

            let attempt = job.attempts_by_role.get(role_id).copied().unwrap_or(0) + 1;
            job.attempts_by_role.insert(role_id.to_string(), attempt);
            job.persist()?;

            let attempt_ctx = AttemptContext { phase_id: phase.id.clone(), attempt };
            let effective_contract = scope::build_effective_contract_for_session(
                contract,
                &job.scope_overrides_by_role,
                role_id,
                &attempt_ctx,
            );
            let effective_role = effective_contract.role(role_id).expect("role checked above").clone();
            let writable_patterns = effective_contract.effective_scope_patterns(role_id);

            if phase.id == "execution" && !delegated_tasks.is_empty() {
                match self
                    .run_delegated_plan_step(
                        job,
                        &effective_contract,
                        role_id,
                        delegated_tasks,
                        ledger,
                        evidence,
                        git,
                    )
                    .await?
                {
                    PlanStepOutcome::Proceed => {}
                    PlanStepOutcome::Retry => continue,
                    PlanStepOutcome::Terminal(outcome) => return Ok(RoleOutcome::Terminal(outcome)),
                }
            }

            let bootstrap_prompt = self.compose_bootstrap_prompt(
                job,
                &effective_contract,
                phase,
                role_id,
                delegated_tasks,
                is_planning,
            );

            let session_controller = SessionController::new(
                self.runner.clone(),
                std::time::Duration::from_secs(self.config.runner.inactivity_timeout_secs),
            );
            let spawn_req = SpawnRequest {
                workspace: job.worktree_path.clone(),
                env_vars: BTreeMap::new(),
                config_dir: job.repo_root.join(".nibbler/config/cursor-profiles").join(role_id),
                mode: if is_planning { SessionMode::Plan } else { SessionMode::Normal },
                interactive: false,
                task_type: if is_planning { TaskType::Plan } else { TaskType::Execute },
            };

            let (handle, rx) = session_controller
                .start_session(role_id, &writable_patterns, spawn_req, &bootstrap_prompt)
                .await?;
            job.session.active = true;
            job.session.handle_id = Some(handle.id.clone());
            job.session.pid = handle.pid;
            job.session.started_at_iso = Some(handle.started_at_iso);
            job.session.seq += 1;
            job.persist()?;

            let outcome = session_controller
                .wait_for_completion(rx, &effective_role.budget, || {})
                .await;

            session_controller.stop_session(&handle).await.ok();
            job.session.active = false;
            job.persist()?;

            ledger.append("session_attempt", json!({"role": role_id, "attempt": attempt}))?;

            let attempt_max = effective_role.budget.max_iterations;

            match outcome {
                SessionOutcome::Event(NibblerEvent::NeedsEscalation { reason, context })
                    if role_id != ARCHITECT_ROLE =>
                {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "needs_escalation"}),
                    )?;
                    match self
                        .run_mediation_session(
                            job,
                            contract,
                            ARCHITECT_ROLE,
                            role_id,
                            reason.as_deref(),
                            context.as_ref(),
                            ledger,
                            evidence,
                            git,
                        )
                        .await?
                    {
                        MediationOutcome::Retry => continue,
                        MediationOutcome::Terminal(outcome) => return Ok(RoleOutcome::Terminal(outcome)),
                    }
                }
                SessionOutcome::Event(NibblerEvent::NeedsEscalation { .. }) => {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "architect_needs_escalation"}),
                    )?;
                    return Ok(RoleOutcome::Terminal(JobOutcome::Escalated {
                        details: "architect requested escalation with no further target".into(),
                    }));
                }
                SessionOutcome::BudgetExceeded => {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "session_timeout"}),
                    )?;
                    return Ok(RoleOutcome::Terminal(JobOutcome::BudgetExceeded {
                        details: format!("role '{role_id}' exceeded its session time budget"),
                    }));
                }
                SessionOutcome::InactiveTimeout => {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "inactive_timeout"}),
                    )?;
                    return Ok(RoleOutcome::Terminal(JobOutcome::Failed {
                        details: format!("role '{role_id}' session went inactive"),
                    }));
                }
                SessionOutcome::ProcessExit { code, signal } if code != Some(0) || signal.is_some() => {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "process_exit_error"}),
                    )?;
                    if attempt >= attempt_max {
                        return Ok(self.escalate(job, contract, role_id, "budget_exhausted", ledger, evidence, git).await?.into_role_outcome());
                    }
                    job.feedback_by_role.insert(
                        role_id.to_string(),
                        json!({"engineHint": format!("previous attempt exited with code {code:?} signal {signal:?}")}),
                    );
                    continue;
                }
                SessionOutcome::ProcessExit { .. } => {
                    // Protocol-missing fallback: the process exited cleanly with no
                    // terminal event. Fall through to deterministic verification.
                    ledger.append("protocol_missing", json!({"role": role_id, "attempt": attempt}))?;
                    job.feedback_by_role.insert(
                        role_id.to_string(),
                        json!({"engineHint": "emit NIBBLER_EVENT {\"type\":\"PHASE_COMPLETE\"} when finished"}),
                    );
                }
                SessionOutcome::Event(NibblerEvent::Exception { reason, impact }) => {
                    git.reset_hard(&pre_session_commit)?;
                    git.clean()?;
                    ledger.append(
                        "session_reverted",
                        json!({"role": role_id, "attempt": attempt, "reason": "exception"}),
                    )?;
                    if attempt >= attempt_max {
                        return Ok(self.escalate(job, contract, role_id, "budget_exhausted", ledger, evidence, git).await?.into_role_outcome());
                    }
                    job.feedback_by_role.insert(
                        role_id.to_string(),
                        json!({"engineHint": format!("prior attempt raised an exception: {reason:?} ({impact:?})")}),
                    );
                    continue;
                }
                SessionOutcome::Event(NibblerEvent::Question { .. })
                | SessionOutcome::Event(NibblerEvent::Questions { .. }) => {
                    // wait_for_completion only returns on terminal events; these
                    // never actually arrive here, but handle defensively.
                    continue;
                }
                SessionOutcome::Event(NibblerEvent::PhaseComplete { .. }) => {}
            }

            let diff = git.diff(&pre_session_commit, None)?.filtered_non_engine();
            job.last_diff = Some(diff.summary.clone());

            let changed_paths: Vec<String> = diff.files.iter().map(|f| f.path.clone()).collect();
            let scope_result = policy::verify_scope(&changed_paths, role_id, &effective_contract);
            evidence.record_scope_check(role_id, &scope_result)?;

            let completion_ctx = CompletionContext {
                job_id: &job.job_id,
                repo_root: &job.repo_root,
                worktree_path: &job.worktree_path,
                is_planning,
                role_id,
                effective_scope_patterns: &writable_patterns,
                diff: &diff,
                delegated_tasks,
            };
            let completion_result = policy::verify_completion(phase, &completion_ctx).await;
            evidence.record_completion_check(role_id, &completion_result)?;

            if scope_result.passed && completion_result.passed {
                git.commit(&format!("{role_id}: attempt {attempt} ({})", phase.id), false)?;
                ledger.append("session_complete", json!({"role": role_id, "attempt": attempt}))?;
                job.feedback_by_role.remove(role_id);
                return Ok(RoleOutcome::Ok);
            }

            git.reset_hard(&pre_session_commit)?;
            git.clean()?;
            ledger.append(
                "session_reverted",
                json!({
                    "role": role_id,
                    "attempt": attempt,
                    "scopePassed": scope_result.passed,
                    "completionPassed": completion_result.passed,
                }),
            )?;

            let prior = job.feedback_history_by_role.get(role_id).and_then(|h| h.last()).cloned();
            let summary = AttemptSummary {
                attempt,
                scope: ScopeAttemptSummary {
                    passed: scope_result.passed,
                    violation_count: scope_result.violations.len(),
                    sample_violations: if scope_result.violations.is_empty() {
                        None
                    } else {
                        Some(scope_result.violation_paths().into_iter().take(5).collect())
                    },
                },
                completion: CompletionAttemptSummary {
                    passed: completion_result.passed,
                    failed_criteria: if completion_result.failed_criteria.is_empty() {
                        None
                    } else {
                        Some(completion_result.failed_criteria.clone())
                    },
                },
                engine_hint: None,
                scope_decision: None,
            };
            job.feedback_history_by_role.entry(role_id.to_string()).or_default().push(summary.clone());

            let usage = policy::BudgetUsage {
                iterations: attempt,
                elapsed_ms: job.global_elapsed_ms() as u64,
                diff_lines: diff.summary.additions + diff.summary.deletions,
            };
            let budget_exceeded = policy::check_budget(usage, &effective_role);

            let repeated_completion_failure = scope_result.passed
                && !completion_result.passed
                && prior
                    .as_ref()
                    .map(|p| !p.completion.passed && p.completion.failed_criteria == summary.completion.failed_criteria)
                    .unwrap_or(false);

            let protected_violation = scope_result
                .violations
                .iter()
                .any(|v| v.reason == policy::ScopeViolationReason::ProtectedPath);
            let assessment = scope::is_structural_out_of_scope_violation(
                &scope_result.violation_paths(),
                role_id,
                &effective_contract,
                self.config.policy.many_threshold,
            );
            let scope_exception_due = !scope_result.passed
                && role_id != ARCHITECT_ROLE
                && ((attempt == 1 && assessment.structural) || attempt >= 2 || protected_violation);

            if budget_exceeded || attempt >= attempt_max {
                job.feedback_by_role.insert(
                    role_id.to_string(),
                    json!({"engineHint": "role exhausted its iteration/time/diff budget"}),
                );
                return Ok(self.escalate(job, contract, role_id, "budget_exhausted", ledger, evidence, git).await?.into_role_outcome());
            }
            if repeated_completion_failure {
                return Ok(self
                    .escalate(job, contract, role_id, "repeated_completion_failure", ledger, evidence, git)
                    .await?
                    .into_role_outcome());
            }
            if scope_exception_due {
                match self
                    .run_scope_exception_session(
                        job,
                        contract,
                        role_id,
                        &scope_result,
                        &assessment,
                        attempt,
                        ledger,
                        evidence,
                        git,
                    )
                    .await?
                {
                    MediationOutcome::Retry => continue,
                    MediationOutcome::Terminal(outcome) => return Ok(RoleOutcome::Terminal(outcome)),
                }
            }

            job.feedback_by_role.insert(
                role_id.to_string(),
                json!({
                    "engineHint": format!(
                        "attempt {attempt} failed verification (scope_passed={}, completion_passed={})",
                        scope_result.passed, completion_result.passed
                    ),
                }),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_delegated_plan_step(
        &self,
        job: &mut JobState,
        effective_contract: &Contract,
        role_id: &str,
        delegated_tasks: &[DelegatedTask],
        ledger: &Ledger,
        evidence: &EvidenceCollector,
        git: &GitAdapter,
    ) -> Result<PlanStepOutcome, EngineError> {
        let Some(role) = effective_contract.role(role_id) else {
            return Ok(PlanStepOutcome::Terminal(JobOutcome::Failed {
                details: format!("role '{role_id}' missing from contract"),
            }));
        };

        let plan_rel = format!(".nibbler-staging/plan/{}/{}-impl-plan.md", job.job_id, role_id);
        let pre_commit = git.get_current_commit()?;

        let task_lines: Vec<String> = delegated_tasks
            .iter()
            .map(|t| format!("- {} (scope: {})", t.task_id, t.scope_hints.join(", ")))
            .collect();
        let prompt = format!(
            "Write an implementation plan for your delegated tasks to `{plan_rel}` before making any other change.\n\nTasks:\n{}",
            task_lines.join("\n"),
        );

        let session_controller = SessionController::new(
            self.runner.clone(),
            std::time::Duration::from_secs(self.config.runner.inactivity_timeout_secs),
        );
        let spawn_req = SpawnRequest {
            workspace: job.worktree_path.clone(),
            env_vars: BTreeMap::new(),
            config_dir: job.repo_root.join(".nibbler/config/cursor-profiles").join(role_id),
            mode: SessionMode::Plan,
            interactive: false,
            task_type: TaskType::Plan,
        };
        let staging_patterns = vec![".nibbler-staging/**".to_string()];
        let (handle, rx) = session_controller
            .start_session(role_id, &staging_patterns, spawn_req, &prompt)
            .await?;
        let _ = session_controller.wait_for_completion(rx, &role.budget, || {}).await;
        session_controller.stop_session(&handle).await.ok();

        let diff = git.diff(&pre_commit, None)?;
        let only_engine = diff.files.iter().all(|f| crate::globmatch::is_engine_managed(&f.path));
        let plan_path = job.worktree_path.join(&plan_rel);

        if !only_engine || !plan_path.exists() {
            git.reset_hard(&pre_commit)?;
            git.clean()?;
            ledger.append("plan_step_failed", json!({"role": role_id}))?;
            job.feedback_by_role.insert(
                role_id.to_string(),
                json!({"engineHint": "plan step failed: write the implementation plan and touch nothing else"}),
            );
            return Ok(PlanStepOutcome::Retry);
        }

        let content = std::fs::read_to_string(&plan_path).unwrap_or_default();
        let dest_rel = format!(".nibbler/jobs/{}/plan/{}-impl-plan.md", job.job_id, role_id);
        for root in [job.repo_root.clone(), job.worktree_path.clone()] {
            let dest = root.join(&dest_rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
            }
            std::fs::write(&dest, &content).map_err(EngineError::Io)?;
        }
        evidence.record_custom_check(role_id, "plan_step", &json!({"planPath": dest_rel}))?;
        ledger.append("plan_step_complete", json!({"role": role_id, "path": dest_rel}))?;
        git.commit(&format!("{role_id}: delegated implementation plan"), false)?;
        Ok(PlanStepOutcome::Proceed)
    }

    fn compose_bootstrap_prompt(
        &self,
        job: &JobState,
        effective_contract: &Contract,
        phase: &Phase,
        role_id: &str,
        delegated_tasks: &[DelegatedTask],
        is_planning: bool,
    ) -> String {
        let writable = effective_contract.effective_scope_patterns(role_id);
        let mut prompt = format!(
            "You are acting as role `{role_id}` in phase `{}` of job `{}`.\n\nRequirement:\n{}\n\nWritable paths:\n{}\n",
            phase.id,
            job.job_id,
            job.description,
            writable.iter().map(|p| format!("- {p}")).collect::<Vec<_>>().join("\n"),
        );
        prompt.push_str("\nCompletion criteria:\n");
        for c in &phase.completion_criteria {
            prompt.push_str(&format!("- {c:?}\n"));
        }
        if let Some(feedback) = job.feedback_by_role.get(role_id) {
            prompt.push_str(&format!("\nFeedback from a prior attempt:\n{feedback}\n"));
        }
        if !delegated_tasks.is_empty() {
            prompt.push_str("\nDelegated tasks:\n");
            for t in delegated_tasks {
                prompt.push_str(&format!("- {} (scope: {})\n", t.task_id, t.scope_hints.join(", ")));
            }
            prompt.push_str(&format!(
                "\nAn implementation plan has been prepared at `.nibbler/jobs/{}/plan/{}-impl-plan.md`.\n",
                job.job_id, role_id,
            ));
        }
        if is_planning {
            prompt.push_str(
                "\nThis is the planning phase: stage your outputs under `.nibbler-staging/plan/<id>/` \
                 and produce `acceptance.md` plus a `delegation.yaml` describing the execution tasks.\n",
            );
        }
        prompt.push_str("\nWhen done, emit `NIBBLER_EVENT {\"type\":\"PHASE_COMPLETE\"}` on its own line.\n");
        prompt
    }

    /// Routes an exhausted role to whatever its budget names, or
    /// terminates the job if that target is `terminate`.
    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        job: &mut JobState,
        contract: &Contract,
        role_id: &str,
        reason: &str,
        ledger: &Ledger,
        evidence: &EvidenceCollector,
        git: &GitAdapter,
    ) -> Result<MediationOutcome, EngineError> {
        let Some(role) = contract.role(role_id) else {
            return Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                details: format!("role '{role_id}' missing from contract during escalation"),
            }));
        };
        ledger.append("role_escalated", json!({"role": role_id, "reason": reason}))?;

        match role.budget.exhaustion_escalation.clone() {
            EscalationTarget::Terminate => Ok(MediationOutcome::Terminal(JobOutcome::Escalated {
                details: format!("role '{role_id}' escalated ({reason}) with no recovery target"),
            })),
            EscalationTarget::Role(target_id)
                if target_id != role_id && contract.role(&target_id).is_some() =>
            {
                self.run_mediation_session(
                    job,
                    contract,
                    &target_id,
                    role_id,
                    Some(reason),
                    None,
                    ledger,
                    evidence,
                    git,
                )
                .await
            }
            EscalationTarget::Role(_) => Ok(MediationOutcome::Terminal(JobOutcome::Escalated {
                details: format!("role '{role_id}' escalated ({reason})"),
            })),
        }
    }

    /// Runs a restricted session for `mediator_role_id` (conventionally
    /// the architect) asked to write guidance for `failing_role_id`'s next
    /// attempt to a known staging path. The mediator may only touch
    /// engine-managed/staging paths; any other change voids the session.
    #[allow(clippy::too_many_arguments)]
    async fn run_mediation_session(
        &self,
        job: &mut JobState,
        contract: &Contract,
        mediator_role_id: &str,
        failing_role_id: &str,
        reason: Option<&str>,
        context: Option<&serde_json::Value>,
        ledger: &Ledger,
        _evidence: &EvidenceCollector,
        git: &GitAdapter,
    ) -> Result<MediationOutcome, EngineError> {
        let Some(mediator) = contract.role(mediator_role_id) else {
            return Ok(MediationOutcome::Terminal(JobOutcome::Escalated {
                details: format!(
                    "role '{failing_role_id}' escalated ({reason:?}) and mediator role '{mediator_role_id}' is undefined"
                ),
            }));
        };

        ledger.append(
            "escalation_requested",
            json!({"role": failing_role_id, "mediator": mediator_role_id, "reason": reason, "context": context}),
        )?;

        let pre_commit = git.get_current_commit()?;
        let guidance_rel = format!(".nibbler-staging/escalation/{}/guidance.md", job.job_id);
        let prompt = format!(
            "Role `{failing_role_id}` has been escalated to you (reason: {}).\n\n\
             Write guidance for its next attempt to `{guidance_rel}` and make no other change.",
            reason.unwrap_or("unspecified"),
        );

        let session_controller = SessionController::new(
            self.runner.clone(),
            std::time::Duration::from_secs(self.config.runner.inactivity_timeout_secs),
        );
        let spawn_req = SpawnRequest {
            workspace: job.worktree_path.clone(),
            env_vars: BTreeMap::new(),
            config_dir: job.repo_root.join(".nibbler/config/cursor-profiles").join(mediator_role_id),
            mode: SessionMode::Plan,
            interactive: false,
            task_type: TaskType::Plan,
        };
        let staging_patterns = vec![".nibbler-staging/**".to_string()];
        let (handle, rx) = session_controller
            .start_session(mediator_role_id, &staging_patterns, spawn_req, &prompt)
            .await?;
        let _ = session_controller.wait_for_completion(rx, &mediator.budget, || {}).await;
        session_controller.stop_session(&handle).await.ok();

        let diff = git.diff(&pre_commit, None)?;
        let only_engine = diff.files.iter().all(|f| crate::globmatch::is_engine_managed(&f.path));
        let guidance_path = job.worktree_path.join(&guidance_rel);

        if !only_engine || !guidance_path.exists() {
            git.reset_hard(&pre_commit)?;
            git.clean()?;
            ledger.append("escalation_denied", json!({"role": failing_role_id}))?;
            return Ok(MediationOutcome::Terminal(JobOutcome::Escalated {
                details: format!("'{mediator_role_id}' could not produce guidance for '{failing_role_id}'"),
            }));
        }

        let guidance = std::fs::read_to_string(&guidance_path).unwrap_or_default();
        git.reset_hard(&pre_commit)?;
        git.clean()?;
        ledger.append(
            "escalation_resolved",
            json!({"role": failing_role_id, "guidance": guidance}),
        )?;
        job.feedback_by_role.insert(failing_role_id.to_string(), json!({"engineHint": guidance}));
        job.attempts_by_role.insert(failing_role_id.to_string(), 0);
        Ok(MediationOutcome::Retry)
    }

    /// The architect scope-exception decision protocol (§4.11): stage a
    /// proposal, ask the architect for a JSON decision written to a known
    /// staging path, and fold a granted override into the role's scope
    /// overrides (never for protected paths).
    #[allow(clippy::too_many_arguments)]
    async fn run_scope_exception_session(
        &self,
        job: &mut JobState,
        contract: &Contract,
        role_id: &str,
        scope_result: &policy::ScopeResult,
        assessment: &scope::OutOfScopeAssessment,
        attempt: u32,
        ledger: &Ledger,
        _evidence: &EvidenceCollector,
        git: &GitAdapter,
    ) -> Result<MediationOutcome, EngineError> {
        let Some(architect) = contract.role(ARCHITECT_ROLE) else {
            return Ok(MediationOutcome::Terminal(JobOutcome::Escalated {
                details: format!("role '{role_id}' needs a scope exception and no architect role is defined"),
            }));
        };

        let proposal = json!({
            "role": role_id,
            "violations": scope_result.violation_paths(),
            "ownerHints": assessment.owner_hints,
        });
        let proposal_rel = format!(".nibbler-staging/scope-exception/{}/proposal.json", job.job_id);
        let decision_rel = format!(".nibbler-staging/scope-exception/{}/decision.json", job.job_id);
        let proposal_path = job.worktree_path.join(&proposal_rel);
        if let Some(parent) = proposal_path.parent() {
            std::fs::create_dir_all(parent).map_err(EngineError::Io)?;
        }
        std::fs::write(&proposal_path, serde_json::to_string_pretty(&proposal).unwrap_or_default())
            .map_err(EngineError::Io)?;
        ledger.append("scope_exception_requested", proposal.clone())?;

        let pre_commit = git.get_current_commit()?;
        let prompt = format!(
            "Role `{role_id}` hit out-of-scope paths: {:?}.\n\
             Protected paths can never be granted. Owner hints: {:?}.\n\n\
             Write your decision to `{decision_rel}` as JSON:\n\
             {{\"decision\": \"deny\"|\"terminate\"|\"reroute_work\"|\"grant_narrow_access\", \
             \"kind\"?: \"shared_scope\"|\"extra_scope\", \"patterns\"?: [...], \
             \"ownerRoleId\"?: string, \"expiresAfterAttempt\"?: number, \"notes\"?: string}}",
            scope_result.violation_paths(),
            assessment.owner_hints,
        );

        let session_controller = SessionController::new(
            self.runner.clone(),
            std::time::Duration::from_secs(self.config.runner.inactivity_timeout_secs),
        );
        let spawn_req = SpawnRequest {
            workspace: job.worktree_path.clone(),
            env_vars: BTreeMap::new(),
            config_dir: job.repo_root.join(".nibbler/config/cursor-profiles").join(ARCHITECT_ROLE),
            mode: SessionMode::Plan,
            interactive: false,
            task_type: TaskType::Plan,
        };
        let staging_patterns = vec![".nibbler-staging/**".to_string()];
        let (handle, rx) = session_controller
            .start_session(ARCHITECT_ROLE, &staging_patterns, spawn_req, &prompt)
            .await?;
        let _ = session_controller.wait_for_completion(rx, &architect.budget, || {}).await;
        session_controller.stop_session(&handle).await.ok();

        let diff = git.diff(&pre_commit, None)?;
        let only_engine = diff.files.iter().all(|f| crate::globmatch::is_engine_managed(&f.path));
        let decision_path = job.worktree_path.join(&decision_rel);

        if !only_engine || !decision_path.exists() {
            git.reset_hard(&pre_commit)?;
            git.clean()?;
            ledger.append("scope_exception_denied", json!({"role": role_id}))?;
            return Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                details: format!("scope exception for '{role_id}' was denied"),
            }));
        }

        let raw = std::fs::read_to_string(&decision_path).unwrap_or_default();
        let parsed: Option<serde_json::Value> = serde_json::from_str(&raw).ok();
        git.reset_hard(&pre_commit)?;
        git.clean()?;

        let Some(decision) = parsed else {
            ledger.append("scope_exception_denied", json!({"role": role_id}))?;
            return Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                details: format!("scope exception for '{role_id}' was denied"),
            }));
        };

        let decision_kind = decision.get("decision").and_then(|v| v.as_str()).unwrap_or("");
        match decision_kind {
            "grant_narrow_access" => {
                let patterns: Vec<String> = decision
                    .get("patterns")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|p| p.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                if patterns.is_empty() || patterns.iter().any(|p| crate::globmatch::is_protected(p)) {
                    ledger.append("scope_exception_denied", json!({"role": role_id}))?;
                    return Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                        details: format!("scope exception for '{role_id}' was denied"),
                    }));
                }
                let kind = match decision.get("kind").and_then(|v| v.as_str()) {
                    Some("shared_scope") => OverrideKind::SharedScope,
                    _ => OverrideKind::ExtraScope,
                };
                let expires_after_attempt =
                    decision.get("expiresAfterAttempt").and_then(|v| v.as_u64()).map(|n| n as u32);
                job.scope_overrides_by_role.push(
                    role_id,
                    ScopeOverride {
                        patterns,
                        kind,
                        expires_after_attempt,
                        granted_at_attempt: attempt,
                        granted_at_iso: Utc::now(),
                    },
                );
                ledger.append("scope_exception_granted", json!({"role": role_id, "decision": decision}))?;
                if attempt >= contract.role(role_id).map(|r| r.budget.max_iterations).unwrap_or(attempt) {
                    job.attempts_by_role.insert(role_id.to_string(), attempt.saturating_sub(1));
                }
                Ok(MediationOutcome::Retry)
            }
            "terminate" | "reroute_work" => {
                ledger.append("scope_exception_rerouted", json!({"role": role_id, "decision": decision}))?;
                Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                    details: format!("architect decided to {decision_kind} for role '{role_id}'"),
                }))
            }
            _ => {
                ledger.append("scope_exception_denied", json!({"role": role_id}))?;
                Ok(MediationOutcome::Terminal(JobOutcome::Failed {
                    details: format!("scope exception for '{role_id}' was denied"),
                }))
            }
        }
    }

    /// Re-adds the worktree registration when its `.git` pointer file
    /// references a gitdir that no longer exists (e.g. after the main
    /// repo's `.git/worktrees/<id>` metadata was pruned externally).
    fn repair_worktree(&self, job: &JobState, git: &GitAdapter) {
        let pointer = job.worktree_path.join(".git");
        let needs_repair = match std::fs::read_to_string(&pointer) {
            Ok(content) => {
                let gitdir = content.trim().strip_prefix("gitdir: ").unwrap_or(content.trim());
                !Path::new(gitdir).exists()
            }
            Err(_) => true,
        };
        if needs_repair {
            let _ = git.add_worktree(&job.worktree_path, &job.job_branch);
        }
    }

    async fn finalize(
        &self,
        job: &mut JobState,
        ledger: &Ledger,
        evidence: &EvidenceCollector,
        git: &GitAdapter,
        outcome: JobOutcome,
    ) -> Result<JobOutcome, EngineError> {
        if job.finalized {
            return Ok(outcome);
        }
        self.repair_worktree(job, git);

        let files = git.ls_files().unwrap_or_default();
        let _ = evidence.capture_final_tree(&files);
        let _ = evidence.capture_terminal_snapshot(&json!({
            "jobId": job.job_id,
            "phase": job.current_phase_id,
            "outcome": outcome,
        }));

        let (terminator_type, lifecycle) = match &outcome {
            JobOutcome::Ok => ("job_completed", JobLifecycle::Completed),
            JobOutcome::Failed { .. } => ("job_failed", JobLifecycle::Failed),
            JobOutcome::BudgetExceeded { .. } => ("job_budget_exceeded", JobLifecycle::BudgetExceeded),
            JobOutcome::Escalated { .. } => ("job_failed", JobLifecycle::Failed),
            JobOutcome::Cancelled { .. } => ("job_cancelled", JobLifecycle::Cancelled),
        };
        ledger.append(terminator_type, serde_json::to_value(&outcome).unwrap_or_else(|_| json!({})))?;

        job.state = lifecycle;
        job.finalized = true;
        job.persist()?;

        if matches!(outcome, JobOutcome::Ok) {
            let merged = git.merge_branch(
                &job.job_branch,
                &MergeOptions { ff_only: false, allow_no_ff: true },
            );
            if merged.is_ok() {
                let _ = git.remove_worktree(&job.worktree_path, true);
                let _ = git.delete_branch(&job.job_branch, true);
            }
        }

        Ok(outcome)
    }
}

impl MediationOutcome {
    fn into_role_outcome(self) -> RoleOutcome {
        match self {
            MediationOutcome::Retry => {
                // The caller's attempt loop never calls this for `Retry` —
                // every call site matches on the enum directly. Kept as an
                // explicit panic rather than a silent wrong-outcome bug.
                unreachable!("MediationOutcome::Retry must be handled by `continue`, not converted")
            }
            MediationOutcome::Terminal(outcome) => RoleOutcome::Terminal(outcome),
        }
    }
}

fn map_next(next: &str) -> Transition {
    match next {
        "__END__" => Transition::End,
        // Legacy tokens from older contract generators (§9): treated as END.
        "completed" | "complete" | "done" | "success" => Transition::End,
        other => Transition::Next(other.to_string()),
    }
}

fn find_entry_phase(contract: &Contract) -> Result<String, EngineError> {
    let mut indegree: BTreeMap<&str, usize> =
        contract.phases.iter().map(|p| (p.id.as_str(), 0)).collect();
    for phase in &contract.phases {
        for succ in &phase.successors {
            if succ.next != "__END__" {
                if let Some(d) = indegree.get_mut(succ.next.as_str()) {
                    *d += 1;
                }
            }
        }
    }
    contract
        .phases
        .iter()
        .find(|p| indegree.get(p.id.as_str()) == Some(&0))
        .map(|p| p.id.clone())
        .ok_or_else(|| EngineError::PhaseGraph("no phase has indegree 0".into()))
}
