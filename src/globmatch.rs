//! Shared glob-pattern matching used by the contract validator, policy
//! engine and scope-override mediator. One `globset::GlobMatcher` per
//! pattern, built lazily — patterns come from YAML contracts and are
//! re-matched many times per attempt.

use globset::{Glob, GlobMatcher};

/// The engine-reserved tree that no role may ever write to.
pub const PROTECTED_PATH_PATTERNS: &[&str] = &[".nibbler/**", ".cursor/rules/20-role-*.mdc"];

/// Paths excluded from merge/diff/commit bookkeeping because the engine
/// itself owns them.
pub const ENGINE_MANAGED_PREFIXES: &[&str] = &[
    ".nibbler/jobs/",
    ".nibbler/config/cursor-profiles/",
    ".nibbler-staging/",
];

/// Build a matcher for a single glob pattern. Patterns come from trusted
/// contract YAML, not untrusted input, so a malformed pattern is a
/// validation-time error rather than a panic.
pub fn compile(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

/// True if `path` matches `pattern`. Malformed patterns never match
/// (callers validate patterns up front via [`compile`]).
pub fn matches(pattern: &str, path: &str) -> bool {
    compile(pattern)
        .map(|m| m.is_match(path))
        .unwrap_or(false)
}

pub fn matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| matches(p, path))
}

/// A literal protected-path pattern, with `**` collapsed to a single `*`
/// so a standard glob matcher treats it the same way a naive path-prefix
/// check would.
fn collapse_double_star(pattern: &str) -> String {
    pattern.replace("**", "*")
}

pub fn is_protected(path: &str) -> bool {
    PROTECTED_PATH_PATTERNS
        .iter()
        .any(|p| matches(p, path) || matches(&collapse_double_star(p), path))
}

pub fn is_engine_managed(path: &str) -> bool {
    ENGINE_MANAGED_PREFIXES.iter().any(|p| path.starts_with(p)) || is_cursor_overlay(path)
}

fn is_cursor_overlay(path: &str) -> bool {
    matches(".cursor/rules/20-role-*.mdc", path)
}

/// The literal portion of a glob pattern up to its first metacharacter.
/// Used by the overlap heuristic and by owner-hint best-match scoring.
pub fn static_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '[', '{'])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// A pattern is "broad" when it carries essentially no static prefix —
/// `**/*`, `*`, or an empty prefix before the first metacharacter.
pub fn is_broad(pattern: &str) -> bool {
    pattern == "**/*" || pattern == "*" || static_prefix(pattern).is_empty()
}

/// Conservative overlap heuristic (§4.4): two patterns *may* overlap
/// when their static prefixes share a common prefix, or either pattern
/// is broad. This never claims two clearly-disjoint patterns overlap
/// less often than they might in practice — it is deliberately
/// over-inclusive, since a false "may overlap" only forces a contract
/// author to declare a `sharedScopes` entry, while a false negative
/// would let an undeclared write collision through.
pub fn patterns_may_overlap(a: &str, b: &str) -> bool {
    if is_broad(a) || is_broad(b) {
        return true;
    }
    let pa = static_prefix(a);
    let pb = static_prefix(b);
    pa.starts_with(pb) || pb.starts_with(pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_basic_glob() {
        assert!(matches("src/**", "src/foo/bar.rs"));
        assert!(!matches("src/**", "docs/readme.md"));
    }

    #[test]
    fn protected_path_detects_engine_tree() {
        assert!(is_protected(".nibbler/jobs/j-20260101-001/status.json"));
        assert!(is_protected(".cursor/rules/20-role-worker.mdc"));
        assert!(!is_protected("src/lib.rs"));
    }

    #[test]
    fn engine_managed_prefixes() {
        assert!(is_engine_managed(".nibbler-staging/plan/x.md"));
        assert!(is_engine_managed(".cursor/rules/20-role-architect.mdc"));
        assert!(!is_engine_managed("src/main.rs"));
    }

    #[test]
    fn static_prefix_stops_at_metachar() {
        assert_eq!(static_prefix("src/auth/**"), "src/auth/");
        assert_eq!(static_prefix("*.md"), "");
        assert_eq!(static_prefix("README.md"), "README.md");
    }

    #[test]
    fn broad_patterns_detected() {
        assert!(is_broad("**/*"));
        assert!(is_broad("*"));
        assert!(!is_broad("src/**"));
    }

    #[test]
    fn overlap_heuristic() {
        assert!(patterns_may_overlap("src/auth/**", "src/auth/login.rs"));
        assert!(!patterns_may_overlap("src/auth/**", "docs/**"));
        assert!(patterns_may_overlap("**/*", "docs/**"));
    }
}
