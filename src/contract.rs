//! Contract Model & Validator (C4). Typed entities for roles, phases and
//! gates, loaded from `.nibbler/contract/{team,phases}.yaml`, plus the
//! structural validator that enforces the invariants in the data model.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::globmatch;

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(String, serde_yaml::Error),
    #[error("role '{0}' has an empty scope")]
    EmptyScope(String),
    #[error("role '{0}' scope pattern '{1}' matches a protected path")]
    ProtectedScope(String, String),
    #[error("roles '{0}' and '{1}' have overlapping scope patterns ('{2}' / '{3}') with no declared sharedScopes entry")]
    UndeclaredOverlap(String, String, String, String),
    #[error("phase '{0}' output boundary '{1}' is not covered by any actor's effective scope")]
    UncoveredOutputBoundary(String, String),
    #[error("phase graph is not a DAG (cycle reachable from '{0}')")]
    PhaseCycle(String),
    #[error("no phase has indegree 0 (no entry point)")]
    NoEntryPhase,
    #[error("no terminal phase is reachable from the entry point(s)")]
    NoReachableTerminal,
    #[error("phase '{0}' successor '{1}' references unknown phase '{2}'")]
    UnknownSuccessor(String, String, String),
    #[error("gate '{0}' is missing outcome '{1}'")]
    MissingGateOutcome(String, &'static str),
    #[error("no gate has audience \"PO\"")]
    NoPoGate,
    #[error("planning PO gate '{0}' is missing required input '{1}'")]
    MissingPlanningInput(String, &'static str),
    #[error("planning PO gate '{0}' has empty business or functional content")]
    EmptyPlanningContent(String),
    #[error("globalLifetime is missing")]
    MissingGlobalLifetime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationTarget {
    Terminate,
    Role(String),
}

// `EscalationTarget` is written as either the literal string "terminate"
// or a role id in YAML; the untagged derive above matches a bare string
// either way, but we want "terminate" to always resolve to the
// `Terminate` variant rather than `Role("terminate")`. Implement by hand.
impl Serialize for EscalationTarget {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            EscalationTarget::Terminate => serializer.serialize_str("terminate"),
            EscalationTarget::Role(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for EscalationTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(if s == "terminate" {
            EscalationTarget::Terminate
        } else {
            EscalationTarget::Role(s)
        })
    }
}

impl Default for EscalationTarget {
    fn default() -> Self {
        EscalationTarget::Terminate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Budget {
    pub max_iterations: u32,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default)]
    pub max_diff_lines: Option<u64>,
    #[serde(default = "default_escalation")]
    pub exhaustion_escalation: EscalationTarget,
}

fn default_escalation() -> EscalationTarget {
    EscalationTarget::Terminate
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Authority {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Role {
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub authority: Authority,
    #[serde(default)]
    pub verification_method: String,
    pub budget: Budget,
}

impl Role {
    /// Scope patterns plus `authority.allowedPaths` — everything this
    /// role may write to on its own, before folding in shared scopes.
    pub fn directly_writable(&self) -> Vec<String> {
        let mut v = self.scope.clone();
        v.extend(self.authority.allowed_paths.clone());
        v
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletionCriterion {
    ArtifactExists {
        pattern: String,
    },
    MarkdownHasHeadings {
        path: String,
        required_headings: Vec<String>,
        #[serde(default)]
        min_chars: Option<usize>,
    },
    CommandSucceeds {
        command: String,
    },
    CommandFails {
        command: String,
    },
    DiffNonEmpty,
    DiffWithinBudget {
        #[serde(default)]
        max_files: Option<usize>,
        #[serde(default)]
        max_lines: Option<usize>,
    },
    DelegationCoverage {
        #[serde(default = "default_true")]
        require_all_tasks: bool,
        #[serde(default = "default_true")]
        require_scope_hints: bool,
    },
    LocalHttpSmoke {
        start_command: String,
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        request_timeout_ms: Option<u64>,
    },
    Custom {
        script: String,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Successor {
    pub on: String,
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub id: String,
    pub actors: Vec<String>,
    #[serde(default)]
    pub input_boundaries: Vec<String>,
    #[serde(default)]
    pub output_boundaries: Vec<String>,
    #[serde(default)]
    pub completion_criteria: Vec<CompletionCriterion>,
    #[serde(default)]
    pub successors: Vec<Successor>,
    #[serde(default)]
    pub is_terminal: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    BuildRequirements,
    PhaseOutput,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequiredInput {
    pub name: String,
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateOutcomes {
    pub approve: String,
    pub reject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gate {
    pub trigger: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    pub approval_scope: ApprovalScope,
    #[serde(default)]
    pub approval_expectations: Vec<String>,
    #[serde(default)]
    pub business_outcomes: Vec<String>,
    #[serde(default)]
    pub functional_scope: Vec<String>,
    #[serde(default)]
    pub out_of_scope: Vec<String>,
    #[serde(default)]
    pub required_inputs: Vec<RequiredInput>,
    pub outcomes: GateOutcomes,
}

fn default_audience() -> String {
    "PO".into()
}

impl Gate {
    pub fn from_phase(&self) -> &str {
        self.trigger.split("->").next().unwrap_or_default()
    }

    pub fn to_phase(&self) -> &str {
        self.trigger.split("->").nth(1).unwrap_or_default()
    }

    pub fn is_planning_po_gate(&self) -> bool {
        self.audience == "PO"
            && matches!(
                self.approval_scope,
                ApprovalScope::BuildRequirements | ApprovalScope::Both
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedScope {
    pub roles: Vec<String>,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalLifetime {
    pub max_time_ms: u64,
    #[serde(default = "default_escalation")]
    pub exhaustion_escalation: EscalationTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub roles: BTreeMap<String, Role>,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub gates: BTreeMap<String, Gate>,
    #[serde(default)]
    pub shared_scopes: Vec<SharedScope>,
    pub global_lifetime: GlobalLifetime,
}

impl Contract {
    pub fn load(repo_root: &Path) -> Result<Self, ContractError> {
        let team_path = repo_root.join(".nibbler/contract/team.yaml");
        let phases_path = repo_root.join(".nibbler/contract/phases.yaml");

        let team_raw = std::fs::read_to_string(&team_path)
            .map_err(|e| ContractError::Io(team_path.display().to_string(), e))?;
        let phases_raw = std::fs::read_to_string(&phases_path)
            .map_err(|e| ContractError::Io(phases_path.display().to_string(), e))?;

        #[derive(Deserialize)]
        struct TeamFile {
            roles: BTreeMap<String, Role>,
            #[serde(default)]
            shared_scopes: Vec<SharedScope>,
            global_lifetime: GlobalLifetime,
        }
        #[derive(Deserialize)]
        struct PhasesFile {
            phases: Vec<Phase>,
            #[serde(default)]
            gates: BTreeMap<String, Gate>,
        }

        let team: TeamFile = serde_yaml::from_str(&team_raw)
            .map_err(|e| ContractError::Parse(team_path.display().to_string(), e))?;
        let phases: PhasesFile = serde_yaml::from_str(&phases_raw)
            .map_err(|e| ContractError::Parse(phases_path.display().to_string(), e))?;

        Ok(Contract {
            roles: team.roles,
            phases: phases.phases,
            gates: phases.gates,
            shared_scopes: team.shared_scopes,
            global_lifetime: team.global_lifetime,
        })
    }

    pub fn role(&self, id: &str) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn gate_for_trigger(&self, trigger: &str) -> Option<(&String, &Gate)> {
        self.gates.iter().find(|(_, g)| g.trigger == trigger)
    }

    /// A role's effective scope as plain patterns: its own scope plus any
    /// sharedScopes entry that lists it. Does not include `allowedPaths`
    /// (those are authority, not scope, per the data model) or session
    /// scope overrides (folded in separately by the scope mediator).
    pub fn effective_scope_patterns(&self, role_id: &str) -> Vec<String> {
        let mut v = Vec::new();
        if let Some(role) = self.role(role_id) {
            v.extend(role.scope.clone());
            v.extend(role.authority.allowed_paths.clone());
        }
        for shared in &self.shared_scopes {
            if shared.roles.iter().any(|r| r == role_id) {
                v.extend(shared.patterns.clone());
            }
        }
        v
    }
}

pub struct ContractValidator;

impl ContractValidator {
    pub fn validate(contract: &Contract) -> Result<(), Vec<ContractError>> {
        let mut errors = Vec::new();

        Self::check_scopes(contract, &mut errors);
        Self::check_overlap(contract, &mut errors);
        Self::check_output_boundaries(contract, &mut errors);
        Self::check_phase_graph(contract, &mut errors);
        Self::check_gates(contract, &mut errors);
        if contract.global_lifetime.max_time_ms == 0 {
            errors.push(ContractError::MissingGlobalLifetime);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_scopes(contract: &Contract, errors: &mut Vec<ContractError>) {
        for (role_id, role) in &contract.roles {
            if role.scope.is_empty() {
                errors.push(ContractError::EmptyScope(role_id.clone()));
                continue;
            }
            for pattern in &role.scope {
                if pattern_hits_protected(pattern) {
                    errors.push(ContractError::ProtectedScope(
                        role_id.clone(),
                        pattern.clone(),
                    ));
                }
            }
        }
    }

    fn check_overlap(contract: &Contract, errors: &mut Vec<ContractError>) {
        let ids: Vec<&String> = contract.roles.keys().collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let a_id = ids[i];
                let b_id = ids[j];
                let a_role = &contract.roles[a_id];
                let b_role = &contract.roles[b_id];
                for pa in &a_role.scope {
                    for pb in &b_role.scope {
                        if globmatch::patterns_may_overlap(pa, pb)
                            && !Self::declared_shared(contract, a_id, b_id, pa, pb)
                        {
                            errors.push(ContractError::UndeclaredOverlap(
                                a_id.clone(),
                                b_id.clone(),
                                pa.clone(),
                                pb.clone(),
                            ));
                        }
                    }
                }
            }
        }
    }

    fn declared_shared(contract: &Contract, a: &str, b: &str, pa: &str, pb: &str) -> bool {
        contract.shared_scopes.iter().any(|s| {
            s.roles.iter().any(|r| r == a)
                && s.roles.iter().any(|r| r == b)
                && s.patterns.iter().any(|p| p == pa || p == pb)
        })
    }

    fn check_output_boundaries(contract: &Contract, errors: &mut Vec<ContractError>) {
        for phase in &contract.phases {
            for boundary in &phase.output_boundaries {
                if globmatch::is_engine_managed(boundary) {
                    continue;
                }
                let covered = phase.actors.iter().any(|actor| {
                    let patterns = contract.effective_scope_patterns(actor);
                    globmatch::matches_any(&patterns, boundary)
                });
                if !covered {
                    errors.push(ContractError::UncoveredOutputBoundary(
                        phase.id.clone(),
                        boundary.clone(),
                    ));
                }
            }
        }
    }

    fn check_phase_graph(contract: &Contract, errors: &mut Vec<ContractError>) {
        let phase_ids: BTreeSet<&str> = contract.phases.iter().map(|p| p.id.as_str()).collect();
        let mut indegree: BTreeMap<&str, usize> =
            contract.phases.iter().map(|p| (p.id.as_str(), 0)).collect();

        for phase in &contract.phases {
            for succ in &phase.successors {
                if succ.next == "__END__" {
                    continue;
                }
                if !phase_ids.contains(succ.next.as_str()) {
                    errors.push(ContractError::UnknownSuccessor(
                        phase.id.clone(),
                        succ.on.clone(),
                        succ.next.clone(),
                    ));
                    continue;
                }
                *indegree.entry(succ.next.as_str()).or_insert(0) += 1;
            }
        }

        let entries: Vec<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| *id)
            .collect();
        if entries.is_empty() {
            errors.push(ContractError::NoEntryPhase);
            return;
        }

        // BFS reachability + cycle check via Kahn's algorithm.
        let mut remaining = indegree.clone();
        let mut queue: VecDeque<&str> = entries.iter().copied().collect();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut reached_terminal = false;

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(phase) = contract.phase(id) else {
                continue;
            };
            if phase.is_terminal || phase.successors.is_empty() {
                reached_terminal = true;
            }
            for succ in &phase.successors {
                if succ.next == "__END__" {
                    reached_terminal = true;
                    continue;
                }
                if let Some(d) = remaining.get_mut(succ.next.as_str()) {
                    *d = d.saturating_sub(1);
                }
                queue.push_back(succ.next.as_str());
            }
        }

        if visited.len() < phase_ids.len() {
            let unreached = phase_ids.difference(&visited).next().cloned().unwrap_or("");
            errors.push(ContractError::PhaseCycle(unreached.to_string()));
        }
        if !reached_terminal {
            errors.push(ContractError::NoReachableTerminal);
        }
    }

    fn check_gates(contract: &Contract, errors: &mut Vec<ContractError>) {
        let mut any_po = false;
        for (id, gate) in &contract.gates {
            if gate.outcomes.approve.is_empty() {
                errors.push(ContractError::MissingGateOutcome(id.clone(), "approve"));
            }
            if gate.outcomes.reject.is_empty() {
                errors.push(ContractError::MissingGateOutcome(id.clone(), "reject"));
            }
            if gate.audience == "PO" {
                any_po = true;
            }
            if gate.is_planning_po_gate() {
                let has_input = |name: &str| {
                    gate.required_inputs.iter().any(|i| i.value.contains(name))
                };
                if !has_input("vision.md") {
                    errors.push(ContractError::MissingPlanningInput(id.clone(), "vision.md"));
                }
                if !has_input("architecture.md") {
                    errors.push(ContractError::MissingPlanningInput(
                        id.clone(),
                        "architecture.md",
                    ));
                }
                if gate.business_outcomes.is_empty() || gate.functional_scope.is_empty() {
                    errors.push(ContractError::EmptyPlanningContent(id.clone()));
                }
            }
        }
        if !any_po {
            errors.push(ContractError::NoPoGate);
        }
    }
}

fn pattern_hits_protected(pattern: &str) -> bool {
    globmatch::PROTECTED_PATH_PATTERNS
        .iter()
        .any(|protected| globmatch::patterns_may_overlap(pattern, protected))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_contract() -> Contract {
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
                business_outcomes: vec!["ship feature".into()],
                functional_scope: vec!["worker writes src/**".into()],
                out_of_scope: vec![],
                required_inputs: vec![
                    RequiredInput { name: "vision".into(), kind: "path".into(), value: "vision.md".into() },
                    RequiredInput { name: "architecture".into(), kind: "path".into(), value: "architecture.md".into() },
                    RequiredInput { name: "acceptance".into(), kind: "path".into(), value: ".nibbler/jobs/<id>/plan/acceptance.md".into() },
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
            global_lifetime: GlobalLifetime {
                max_time_ms: 3_600_000,
                exhaustion_escalation: EscalationTarget::Terminate,
            },
        }
    }

    #[test]
    fn minimal_contract_validates() {
        let contract = minimal_contract();
        assert!(ContractValidator::validate(&contract).is_ok());
    }

    #[test]
    fn empty_scope_rejected() {
        let mut contract = minimal_contract();
        contract.roles.get_mut("worker").unwrap().scope.clear();
        let errs = ContractValidator::validate(&contract).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ContractError::EmptyScope(r) if r == "worker")));
    }

    #[test]
    fn protected_scope_rejected() {
        let mut contract = minimal_contract();
        contract
            .roles
            .get_mut("worker")
            .unwrap()
            .scope
            .push(".nibbler/jobs/**".into());
        let errs = ContractValidator::validate(&contract).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ContractError::ProtectedScope(..))));
    }

    #[test]
    fn undeclared_overlap_rejected() {
        let mut contract = minimal_contract();
        contract
            .roles
            .get_mut("architect")
            .unwrap()
            .scope
            .push("src/**".into());
        let errs = ContractValidator::validate(&contract).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ContractError::UndeclaredOverlap(..))));
    }

    #[test]
    fn declared_shared_scope_allows_overlap() {
        let mut contract = minimal_contract();
        contract
            .roles
            .get_mut("architect")
            .unwrap()
            .scope
            .push("src/shared/**".into());
        contract
            .roles
            .get_mut("worker")
            .unwrap()
            .scope
            .push("src/shared/**".into());
        contract.shared_scopes.push(SharedScope {
            roles: vec!["architect".into(), "worker".into()],
            patterns: vec!["src/shared/**".into()],
        });
        assert!(ContractValidator::validate(&contract).is_ok());
    }

    #[test]
    fn no_po_gate_rejected() {
        let mut contract = minimal_contract();
        contract.gates.get_mut("plan").unwrap().audience = "engineer".into();
        let errs = ContractValidator::validate(&contract).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ContractError::NoPoGate)));
    }

    #[test]
    fn cycle_rejected() {
        // planning (real indegree-0 entry) feeds into an execution<->review
        // loop that never reaches a terminal phase.
        let mut contract = minimal_contract();
        contract.phases[1].is_terminal = false;
        contract.phases[1].successors =
            vec![Successor { on: "done".into(), next: "review".into() }];
        contract.phases.push(Phase {
            id: "review".into(),
            actors: vec!["architect".into()],
            input_boundaries: vec![],
            output_boundaries: vec![],
            completion_criteria: vec![],
            successors: vec![Successor { on: "done".into(), next: "execution".into() }],
            is_terminal: false,
        });
        let errs = ContractValidator::validate(&contract).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ContractError::NoReachableTerminal)));
    }

    #[test]
    fn escalation_target_round_trips() {
        let t: EscalationTarget = serde_yaml::from_str("terminate").unwrap();
        assert_eq!(t, EscalationTarget::Terminate);
        let r: EscalationTarget = serde_yaml::from_str("architect").unwrap();
        assert_eq!(r, EscalationTarget::Role("architect".into()));
    }
}
