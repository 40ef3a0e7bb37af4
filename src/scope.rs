//! Scope-Override Mediator (C9). Folds active, non-expired scope
//! overrides into a per-session effective contract, and judges whether
//! a set of out-of-scope diff paths amounts to a structural violation
//! worth escalating to the architect rather than a simple retry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contract::{Contract, SharedScope};
use crate::globmatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    SharedScope,
    ExtraScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeOverride {
    pub patterns: Vec<String>,
    pub kind: OverrideKind,
    /// The attempt number after which this override no longer applies,
    /// or `None` for the remainder of the job.
    #[serde(default)]
    pub expires_after_attempt: Option<u32>,
    pub granted_at_attempt: u32,
    pub granted_at_iso: DateTime<Utc>,
}

impl ScopeOverride {
    pub fn is_active_at(&self, attempt: u32) -> bool {
        match self.expires_after_attempt {
            Some(limit) => attempt <= limit,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeOverridesByRole(pub BTreeMap<String, Vec<ScopeOverride>>);

impl ScopeOverridesByRole {
    pub fn push(&mut self, role_id: &str, over: ScopeOverride) {
        self.0.entry(role_id.to_string()).or_default().push(over);
    }
}

#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub phase_id: String,
    pub attempt: u32,
}

/// Clones `contract` and, for every override still active against
/// `role` at `ctx.attempt`, folds its patterns in either as a
/// shared-scope entry naming `role` (kind `SharedScope`) or into the
/// role's `authority.allowedPaths` (kind `ExtraScope`).
pub fn build_effective_contract_for_session(
    contract: &Contract,
    overrides: &ScopeOverridesByRole,
    role_id: &str,
    ctx: &AttemptContext,
) -> Contract {
    let mut effective = contract.clone();

    let Some(active) = overrides.0.get(role_id) else {
        return effective;
    };

    for over in active {
        if !over.is_active_at(ctx.attempt) {
            continue;
        }
        match over.kind {
            OverrideKind::SharedScope => {
                effective.shared_scopes.push(SharedScope {
                    roles: vec![role_id.to_string()],
                    patterns: over.patterns.clone(),
                });
            }
            OverrideKind::ExtraScope => {
                if let Some(role) = effective.roles.get_mut(role_id) {
                    role.authority.allowed_paths.extend(over.patterns.clone());
                }
            }
        }
    }

    effective
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnerHint {
    pub file: String,
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutOfScopeAssessment {
    pub structural: bool,
    pub owner_hints: Vec<OwnerHint>,
}

/// A violation is structural when the out-of-scope set exceeds
/// `many_threshold`, or when it concentrates in directories another
/// role's scope owns by best-match glob — either signals this role
/// needs a broader grant or the work belongs elsewhere, rather than a
/// one-off retry fixing it.
pub fn is_structural_out_of_scope_violation(
    paths: &[String],
    role_id: &str,
    contract: &Contract,
    many_threshold: usize,
) -> OutOfScopeAssessment {
    let owner_hints: Vec<OwnerHint> = paths
        .iter()
        .map(|path| OwnerHint {
            file: path.clone(),
            owners: best_match_owners(path, role_id, contract),
        })
        .collect();

    let concentrated = owner_hints.iter().any(|h| !h.owners.is_empty());
    let structural = paths.len() > many_threshold || concentrated;

    OutOfScopeAssessment { structural, owner_hints }
}

/// Every other role whose effective scope contains a pattern matching
/// `path`, ranked by nothing in particular beyond contract iteration
/// order (roles stored in a `BTreeMap`, so this is deterministic).
fn best_match_owners(path: &str, exclude_role: &str, contract: &Contract) -> Vec<String> {
    contract
        .roles
        .keys()
        .filter(|id| id.as_str() != exclude_role)
        .filter(|id| {
            let patterns = contract.effective_scope_patterns(id);
            patterns.iter().any(|p| globmatch::matches(p, path))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Authority, Budget, EscalationTarget, GlobalLifetime, Role};

    fn sample_contract() -> Contract {
        let mut roles = BTreeMap::new();
        roles.insert(
            "worker".to_string(),
            Role {
                scope: vec!["src/app/**".into()],
                authority: Authority::default(),
                verification_method: "automated".into(),
                budget: Budget {
                    max_iterations: 3,
                    exhaustion_escalation: EscalationTarget::Terminate,
                    ..Default::default()
                },
            },
        );
        roles.insert(
            "infra".to_string(),
            Role {
                scope: vec!["deploy/**".into()],
                authority: Authority::default(),
                verification_method: "automated".into(),
                budget: Budget {
                    max_iterations: 3,
                    exhaustion_escalation: EscalationTarget::Terminate,
                    ..Default::default()
                },
            },
        );
        Contract {
            roles,
            phases: vec![],
            gates: BTreeMap::new(),
            shared_scopes: vec![],
            global_lifetime: GlobalLifetime {
                max_time_ms: 1000,
                exhaustion_escalation: EscalationTarget::Terminate,
            },
        }
    }

    #[test]
    fn expired_override_is_not_folded_in() {
        let contract = sample_contract();
        let mut overrides = ScopeOverridesByRole::default();
        overrides.push(
            "worker",
            ScopeOverride {
                patterns: vec!["deploy/**".into()],
                kind: OverrideKind::ExtraScope,
                expires_after_attempt: Some(1),
                granted_at_attempt: 1,
                granted_at_iso: Utc::now(),
            },
        );

        let ctx = AttemptContext { phase_id: "execution".into(), attempt: 2 };
        let effective = build_effective_contract_for_session(&contract, &overrides, "worker", &ctx);
        assert!(effective.roles["worker"].authority.allowed_paths.is_empty());
    }

    #[test]
    fn active_allowed_path_override_is_folded_in() {
        let contract = sample_contract();
        let mut overrides = ScopeOverridesByRole::default();
        overrides.push(
            "worker",
            ScopeOverride {
                patterns: vec!["deploy/**".into()],
                kind: OverrideKind::ExtraScope,
                expires_after_attempt: None,
                granted_at_attempt: 1,
                granted_at_iso: Utc::now(),
            },
        );

        let ctx = AttemptContext { phase_id: "execution".into(), attempt: 2 };
        let effective = build_effective_contract_for_session(&contract, &overrides, "worker", &ctx);
        assert_eq!(
            effective.roles["worker"].authority.allowed_paths,
            vec!["deploy/**".to_string()]
        );
    }

    #[test]
    fn shared_scope_override_adds_entry() {
        let contract = sample_contract();
        let mut overrides = ScopeOverridesByRole::default();
        overrides.push(
            "worker",
            ScopeOverride {
                patterns: vec!["deploy/**".into()],
                kind: OverrideKind::SharedScope,
                expires_after_attempt: None,
                granted_at_attempt: 1,
                granted_at_iso: Utc::now(),
            },
        );
        let ctx = AttemptContext { phase_id: "execution".into(), attempt: 1 };
        let effective = build_effective_contract_for_session(&contract, &overrides, "worker", &ctx);
        assert_eq!(effective.shared_scopes.len(), 1);
        assert_eq!(effective.shared_scopes[0].roles, vec!["worker".to_string()]);
    }

    #[test]
    fn structural_when_over_threshold() {
        let contract = sample_contract();
        let paths = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let assessment = is_structural_out_of_scope_violation(&paths, "worker", &contract, 2);
        assert!(assessment.structural);
    }

    #[test]
    fn structural_when_owned_by_another_role() {
        let contract = sample_contract();
        let paths = vec!["deploy/prod.yaml".to_string()];
        let assessment = is_structural_out_of_scope_violation(&paths, "worker", &contract, 10);
        assert!(assessment.structural);
        assert_eq!(assessment.owner_hints[0].owners, vec!["infra".to_string()]);
    }

    #[test]
    fn not_structural_when_small_and_unowned() {
        let contract = sample_contract();
        let paths = vec!["random/file.txt".to_string()];
        let assessment = is_structural_out_of_scope_violation(&paths, "worker", &contract, 10);
        assert!(!assessment.structural);
        assert!(assessment.owner_hints[0].owners.is_empty());
    }
}
