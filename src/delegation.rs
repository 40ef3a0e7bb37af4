//! Delegation Planner (C10). Parses a delegation plan YAML file into
//! typed tasks, validates it against the contract, and resolves a
//! deterministic role execution order via Kahn's algorithm.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contract::Contract;
use crate::globmatch;

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("failed to read delegation plan at {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to parse delegation plan: {0}")]
    Parse(serde_yaml::Error),
    #[error("delegation plan is missing a version")]
    MissingVersion,
    #[error("task at index {0} has an empty {1}")]
    EmptyField(usize, &'static str),
    #[error("task '{0}' references unknown role '{1}'")]
    UnknownRole(String, String),
    #[error("task '{0}' scope hint '{1}' lies outside role '{2}''s effective scope")]
    ScopeHintOutOfBounds(String, String, String),
    #[error("task '{0}' depends on unknown task '{1}'")]
    UnknownDependency(String, String),
    #[error("delegation plan dependency graph has a cycle")]
    Cycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub task_id: String,
    pub role_id: String,
    pub description: String,
    #[serde(default)]
    pub scope_hints: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationPlan {
    pub version: String,
    pub tasks: Vec<PlanTask>,
}

impl DelegationPlan {
    pub fn load(path: &Path) -> Result<Self, DelegationError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DelegationError::Io(path.to_path_buf(), e))?;
        let plan: DelegationPlan = serde_yaml::from_str(&raw).map_err(DelegationError::Parse)?;
        if plan.version.is_empty() {
            return Err(DelegationError::MissingVersion);
        }
        Ok(plan)
    }

    pub fn validate(&self, contract: &Contract) -> Result<(), Vec<DelegationError>> {
        let mut errors = Vec::new();
        let task_ids: BTreeSet<&str> = self.tasks.iter().map(|t| t.task_id.as_str()).collect();

        for (i, task) in self.tasks.iter().enumerate() {
            if task.task_id.is_empty() {
                errors.push(DelegationError::EmptyField(i, "taskId"));
            }
            if task.role_id.is_empty() {
                errors.push(DelegationError::EmptyField(i, "roleId"));
            }
            if task.description.is_empty() {
                errors.push(DelegationError::EmptyField(i, "description"));
            }
            if task.scope_hints.is_empty() {
                errors.push(DelegationError::EmptyField(i, "scopeHints"));
            }

            if !task.role_id.is_empty() && contract.role(&task.role_id).is_none() {
                errors.push(DelegationError::UnknownRole(
                    task.task_id.clone(),
                    task.role_id.clone(),
                ));
                continue;
            }

            let effective = contract.effective_scope_patterns(&task.role_id);
            for hint in &task.scope_hints {
                let within = effective.iter().any(|p| {
                    globmatch::matches(p, hint) || globmatch::patterns_may_overlap(p, hint)
                });
                if !within {
                    errors.push(DelegationError::ScopeHintOutOfBounds(
                        task.task_id.clone(),
                        hint.clone(),
                        task.role_id.clone(),
                    ));
                }
            }

            for dep in &task.depends_on {
                if !task_ids.contains(dep.as_str()) {
                    errors.push(DelegationError::UnknownDependency(
                        task.task_id.clone(),
                        dep.clone(),
                    ));
                }
            }
        }

        if errors.is_empty() && has_cycle(&self.tasks) {
            errors.push(DelegationError::Cycle);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn has_cycle(tasks: &[PlanTask]) -> bool {
    let task_ids: BTreeSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    let mut indegree: BTreeMap<&str, usize> = task_ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for task in tasks {
        for dep in &task.depends_on {
            if task_ids.contains(dep.as_str()) {
                *indegree.entry(task.task_id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(task.task_id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> =
        indegree.iter().filter(|(_, &d)| d == 0).map(|(id, _)| *id).collect();
    let mut remaining = indegree.clone();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for &child in children {
                if let Some(d) = remaining.get_mut(child) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }
    }

    visited < tasks.len()
}

#[derive(Debug, Clone)]
pub struct ResolvedDelegation {
    pub role_order: Vec<String>,
    pub tasks_by_role: BTreeMap<String, Vec<PlanTask>>,
}

/// Kahn's topological sort over `dependsOn`, breaking ties between
/// simultaneously-ready tasks by ascending priority then lexicographic
/// `taskId` so the resolved order is fully deterministic. Role order is
/// each role's first appearance in the resolved task sequence.
pub fn resolve_delegation(tasks: &[PlanTask]) -> ResolvedDelegation {
    let by_id: BTreeMap<&str, &PlanTask> =
        tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
    let mut indegree: BTreeMap<&str, usize> = by_id.keys().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for task in tasks {
        for dep in &task.depends_on {
            if by_id.contains_key(dep.as_str()) {
                *indegree.entry(task.task_id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(task.task_id.as_str());
            }
        }
    }

    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut remaining = indegree.clone();
    let mut ordered: Vec<&PlanTask> = Vec::new();

    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            let ta = by_id[a];
            let tb = by_id[b];
            ta.priority.cmp(&tb.priority).then_with(|| ta.task_id.cmp(&tb.task_id))
        });
        let next = ready.remove(0);
        ordered.push(by_id[next]);

        if let Some(children) = dependents.get(next) {
            for &child in children {
                if let Some(d) = remaining.get_mut(child) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        ready.push(child);
                    }
                }
            }
        }
    }

    let mut role_order = Vec::new();
    let mut tasks_by_role: BTreeMap<String, Vec<PlanTask>> = BTreeMap::new();
    for task in ordered {
        if !role_order.contains(&task.role_id) {
            role_order.push(task.role_id.clone());
        }
        tasks_by_role.entry(task.role_id.clone()).or_default().push(task.clone());
    }

    ResolvedDelegation { role_order, tasks_by_role }
}
