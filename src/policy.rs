//! Policy Engine (C5). Pure (or near-pure) evaluation functions: scope
//! checking, completion-criterion evaluation, role and global budget
//! checks, and gate-trigger lookup. Nothing here mutates job state —
//! callers fold the results into the next attempt.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::contract::{CompletionCriterion, Contract, Gate, Phase, Role};
use crate::git::DiffResult;
use crate::globmatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeViolationReason {
    ProtectedPath,
    OutOfScope,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeViolation {
    pub file: String,
    pub reason: ScopeViolationReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScopeResult {
    pub passed: bool,
    pub violations: Vec<ScopeViolation>,
}

impl ScopeResult {
    pub fn violation_paths(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.file.clone()).collect()
    }
}

/// Checks every changed path against (in order): protected-path
/// literals, the role's direct scope, `authority.allowedPaths`, then
/// any `sharedScopes` entry naming the role. The first matching
/// category wins; anything left over is `out_of_scope`.
pub fn verify_scope(changed_paths: &[String], role_id: &str, contract: &Contract) -> ScopeResult {
    let Some(role) = contract.role(role_id) else {
        return ScopeResult {
            passed: false,
            violations: changed_paths
                .iter()
                .map(|p| ScopeViolation { file: p.clone(), reason: ScopeViolationReason::OutOfScope })
                .collect(),
        };
    };

    let shared_patterns: Vec<String> = contract
        .shared_scopes
        .iter()
        .filter(|s| s.roles.iter().any(|r| r == role_id))
        .flat_map(|s| s.patterns.clone())
        .collect();

    let mut violations = Vec::new();
    for path in changed_paths {
        if globmatch::is_protected(path) {
            violations.push(ScopeViolation {
                file: path.clone(),
                reason: ScopeViolationReason::ProtectedPath,
            });
            continue;
        }
        if globmatch::matches_any(&role.scope, path) {
            continue;
        }
        if globmatch::matches_any(&role.authority.allowed_paths, path) {
            continue;
        }
        if globmatch::matches_any(&shared_patterns, path) {
            continue;
        }
        violations.push(ScopeViolation {
            file: path.clone(),
            reason: ScopeViolationReason::OutOfScope,
        });
    }

    ScopeResult { passed: violations.is_empty(), violations }
}

#[derive(Debug, Clone, Serialize)]
pub struct CriterionResult {
    pub label: String,
    pub passed: bool,
    pub deferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    pub passed: bool,
    pub failed_criteria: Vec<String>,
    pub results: Vec<CriterionResult>,
}

#[derive(Debug, Clone)]
pub struct DelegatedTask {
    pub task_id: String,
    pub scope_hints: Vec<String>,
}

pub struct CompletionContext<'a> {
    pub job_id: &'a str,
    pub repo_root: &'a Path,
    pub worktree_path: &'a Path,
    pub is_planning: bool,
    pub role_id: &'a str,
    pub effective_scope_patterns: &'a [String],
    pub diff: &'a DiffResult,
    pub delegated_tasks: &'a [DelegatedTask],
}

fn substitute_job_id(pattern: &str, job_id: &str) -> String {
    pattern.replace("<id>", job_id)
}

/// The set of roots searched for a referenced artifact, in priority
/// order: planning-mode staging locations first, then the worktree and
/// repo roots.
fn search_roots(ctx: &CompletionContext) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if ctx.is_planning {
        roots.push(
            ctx.worktree_path
                .join(".nibbler-staging/plan")
                .join(ctx.job_id),
        );
        roots.push(ctx.repo_root.join(".nibbler/jobs").join(ctx.job_id).join("plan"));
    }
    roots.push(ctx.worktree_path.to_path_buf());
    roots.push(ctx.repo_root.to_path_buf());
    roots
}

fn first_existing_path(ctx: &CompletionContext, relative: &str) -> Option<PathBuf> {
    for root in search_roots(ctx) {
        let candidate = root.join(relative);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

fn glob_exists_under_any_root(ctx: &CompletionContext, pattern: &str) -> bool {
    for root in search_roots(ctx) {
        if !root.exists() {
            continue;
        }
        if let Ok(matcher) = globmatch::compile(pattern) {
            let walked = walk_relative(&root);
            if walked.iter().any(|rel| matcher.is_match(rel)) {
                return true;
            }
        }
    }
    false
}

fn walk_relative(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    walk_relative_into(root, root, &mut out);
    out
}

fn walk_relative_into(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                continue;
            }
            walk_relative_into(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
}

/// Heading extraction: lines matching `#{1,6}\s+...`.
fn extract_headings(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let hashes = trimmed.chars().take_while(|&c| c == '#').count();
            if hashes == 0 || hashes > 6 {
                return None;
            }
            let after_hashes = &trimmed[hashes..];
            if !after_hashes.starts_with(char::is_whitespace) {
                return None;
            }
            let rest = after_hashes.trim_start();
            if rest.is_empty() {
                return None;
            }
            Some(rest.to_string())
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// NFKD-normalize/lower-case/collapse-non-alphanumeric-runs comparison
/// without pulling in a dedicated Unicode-normalization crate: ASCII-range
/// normalization covers every contract-authored heading we've seen in
/// practice.
fn normalize_heading(s: &str) -> String {
    let mut out = String::new();
    let mut last_was_space = false;
    for ch in s.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

fn heading_matches(required: &str, extracted: &[String]) -> bool {
    let required_norm = normalize_heading(required);
    extracted.iter().any(|h| {
        let norm = normalize_heading(h);
        norm == required_norm || norm.starts_with(&required_norm)
    })
}

/// Extracts path-like tokens (containing '/' or a file extension) from
/// a shell command string, for the role-scope deferral heuristic.
fn path_like_tokens(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .filter(|tok| tok.contains('/') || tok.contains('.'))
        .map(|tok| tok.trim_matches(|c: char| "\"'();&|".contains(c)).to_string())
        .filter(|tok| !tok.is_empty())
        .collect()
}

/// True when every path-like token in `command` lies outside both the
/// role's effective scope and any delegated scope hint — in which case
/// the criterion should be deferred rather than judged against files
/// this role cannot touch.
fn should_defer(command: &str, ctx: &CompletionContext) -> bool {
    let tokens = path_like_tokens(command);
    if tokens.is_empty() {
        return false;
    }
    let hint_patterns: Vec<String> = ctx
        .delegated_tasks
        .iter()
        .flat_map(|t| t.scope_hints.clone())
        .collect();
    tokens.iter().all(|tok| {
        !globmatch::matches_any(ctx.effective_scope_patterns, tok)
            && !globmatch::matches_any(&hint_patterns, tok)
    })
}

async fn run_shell(workspace: &Path, command: &str) -> std::io::Result<std::process::ExitStatus> {
    Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
}

/// Starts `start_command` detached in its own process group, polls
/// `url` until it answers 2xx/3xx or `timeout_ms` elapses, gives a
/// short settle delay, then checks captured logs for known-fatal
/// module-resolution patterns before tearing the process group down.
async fn local_http_smoke(
    workspace: &Path,
    start_command: &str,
    url: &str,
    timeout_ms: u64,
    request_timeout_ms: u64,
) -> (bool, String) {
    #[cfg(unix)]
    let mut cmd = {
        use std::os::unix::process::CommandExt as _;
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(start_command).current_dir(workspace);
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
        cmd
    };
    #[cfg(not(unix))]
    let mut cmd = {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(start_command).current_dir(workspace);
        cmd
    };

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    let Ok(mut child) = cmd.spawn() else {
        return (false, "failed to spawn start command".to_string());
    };
    let pid = child.id();

    let captured = std::sync::Arc::new(tokio::sync::Mutex::new(String::new()));
    if let Some(stdout) = child.stdout.take() {
        let captured = captured.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.lock().await.push_str(&line);
                captured.lock().await.push('\n');
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let captured = captured.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                captured.lock().await.push_str(&line);
                captured.lock().await.push('\n');
            }
        });
    }

    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let client_timeout = Duration::from_millis(request_timeout_ms);
    let mut reached = false;
    while tokio::time::Instant::now() < deadline {
        if probe_once(url, client_timeout).await {
            reached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if reached {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let logs = captured.lock().await.clone();
    let fatal_patterns = ["Cannot find module", "Module not found", "ModuleNotFoundError"];
    let fatal_seen = fatal_patterns.iter().any(|p| logs.contains(p));

    if let Some(pid) = pid {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    if let Some(pid) = pid {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    (reached && !fatal_seen, logs)
}

async fn probe_once(url: &str, timeout: Duration) -> bool {
    let Some((host, port, path)) = parse_http_url(url) else { return false };
    let addrs = [format!("{host}:{port}"), format!("127.0.0.1:{port}"), format!("[::1]:{port}")];
    for addr in addrs {
        if let Ok(Ok(mut stream)) =
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await
        {
            use tokio::io::AsyncWriteExt;
            let request = format!("GET {path} HTTP/1.0\r\nHost: {host}\r\n\r\n");
            if stream.write_all(request.as_bytes()).await.is_err() {
                continue;
            }
            let mut buf = Vec::new();
            let _ = tokio::time::timeout(timeout, stream.read_to_end(&mut buf)).await;
            let text = String::from_utf8_lossy(&buf);
            if let Some(status_line) = text.lines().next() {
                if let Some(code) = status_line.split_whitespace().nth(1) {
                    if let Ok(code) = code.parse::<u16>() {
                        if (200..400).contains(&code) {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

fn parse_http_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://").or_else(|| url.strip_prefix("https://"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    Some((host, port, path.to_string()))
}

/// Evaluates every completion criterion of `phase` in order; overall
/// pass is their conjunction.
pub async fn verify_completion(phase: &Phase, ctx: &CompletionContext<'_>) -> CompletionResult {
    let mut results = Vec::new();

    for criterion in &phase.completion_criteria {
        let result = evaluate_criterion(criterion, ctx).await;
        results.push(result);
    }

    let failed_criteria: Vec<String> =
        results.iter().filter(|r| !r.passed).map(|r| r.label.clone()).collect();

    CompletionResult { passed: failed_criteria.is_empty(), failed_criteria, results }
}

async fn evaluate_criterion(criterion: &CompletionCriterion, ctx: &CompletionContext<'_>) -> CriterionResult {
    match criterion {
        CompletionCriterion::ArtifactExists { pattern } => {
            let substituted = substitute_job_id(pattern, ctx.job_id);
            let exists = first_existing_path(ctx, &substituted).is_some()
                || glob_exists_under_any_root(ctx, &substituted);
            CriterionResult {
                label: format!("artifact_exists({substituted})"),
                passed: exists,
                deferred: false,
                detail: None,
            }
        }
        CompletionCriterion::MarkdownHasHeadings { path, required_headings, min_chars } => {
            let substituted = substitute_job_id(path, ctx.job_id);
            let Some(found_path) = first_existing_path(ctx, &substituted) else {
                return CriterionResult {
                    label: format!("markdown_has_headings({substituted})"),
                    passed: false,
                    deferred: false,
                    detail: Some("file not found".to_string()),
                };
            };
            let content = std::fs::read_to_string(&found_path).unwrap_or_default();
            let headings = extract_headings(&content);
            let missing: Vec<&String> = required_headings
                .iter()
                .filter(|req| !heading_matches(req, &headings))
                .collect();
            let length_ok = min_chars.map(|m| content.chars().count() >= m).unwrap_or(true);
            let passed = missing.is_empty() && length_ok;
            CriterionResult {
                label: format!("markdown_has_headings({substituted})"),
                passed,
                deferred: false,
                detail: if passed {
                    None
                } else {
                    Some(format!("missing headings: {missing:?}, length_ok={length_ok}"))
                },
            }
        }
        CompletionCriterion::CommandSucceeds { command } => {
            if should_defer(command, ctx) {
                return CriterionResult {
                    label: format!("command_succeeds({command})"),
                    passed: true,
                    deferred: true,
                    detail: Some("deferred: command references paths outside this role's scope".into()),
                };
            }
            let status = run_shell(ctx.worktree_path, command).await;
            let passed = status.map(|s| s.success()).unwrap_or(false);
            CriterionResult {
                label: format!("command_succeeds({command})"),
                passed,
                deferred: false,
                detail: None,
            }
        }
        CompletionCriterion::CommandFails { command } => {
            if should_defer(command, ctx) {
                return CriterionResult {
                    label: format!("command_fails({command})"),
                    passed: true,
                    deferred: true,
                    detail: Some("deferred: command references paths outside this role's scope".into()),
                };
            }
            let status = run_shell(ctx.worktree_path, command).await;
            let passed = status.map(|s| !s.success()).unwrap_or(false);
            CriterionResult {
                label: format!("command_fails({command})"),
                passed,
                deferred: false,
                detail: None,
            }
        }
        CompletionCriterion::DiffNonEmpty => {
            let passed = ctx.diff.summary.files_changed >= 1;
            CriterionResult { label: "diff_non_empty".into(), passed, deferred: false, detail: None }
        }
        CompletionCriterion::DiffWithinBudget { max_files, max_lines } => {
            let files_ok = max_files.map(|m| ctx.diff.summary.files_changed <= m).unwrap_or(true);
            let lines = ctx.diff.summary.additions + ctx.diff.summary.deletions;
            let lines_ok = max_lines.map(|m| lines <= m as u64).unwrap_or(true);
            CriterionResult {
                label: "diff_within_budget".into(),
                passed: files_ok && lines_ok,
                deferred: false,
                detail: None,
            }
        }
        CompletionCriterion::DelegationCoverage { require_all_tasks, require_scope_hints } => {
            let changed: BTreeSet<&str> = ctx.diff.files.iter().map(|f| f.path.as_str()).collect();
            let existing = walk_relative(ctx.worktree_path);
            let mut uncovered = Vec::new();
            for task in ctx.delegated_tasks {
                if *require_scope_hints && task.scope_hints.is_empty() {
                    uncovered.push(task.task_id.clone());
                    continue;
                }
                let covered = changed.iter().any(|p| globmatch::matches_any(&task.scope_hints, p))
                    || existing.iter().any(|p| globmatch::matches_any(&task.scope_hints, p));
                if !covered {
                    uncovered.push(task.task_id.clone());
                    if !require_all_tasks {
                        break;
                    }
                }
            }
            let passed = uncovered.is_empty();
            CriterionResult {
                label: "delegation_coverage".into(),
                passed,
                deferred: false,
                detail: if passed { None } else { Some(format!("uncovered tasks: {uncovered:?}")) },
            }
        }
        CompletionCriterion::LocalHttpSmoke { start_command, url, timeout_ms, request_timeout_ms } => {
            if should_defer(start_command, ctx) {
                return CriterionResult {
                    label: format!("local_http_smoke({url})"),
                    passed: true,
                    deferred: true,
                    detail: Some("deferred: start command references paths outside this role's scope".into()),
                };
            }
            let (passed, logs) = local_http_smoke(
                ctx.worktree_path,
                start_command,
                url,
                timeout_ms.unwrap_or(20_000),
                request_timeout_ms.unwrap_or(2_000),
            )
            .await;
            CriterionResult {
                label: format!("local_http_smoke({url})"),
                passed,
                deferred: false,
                detail: if passed { None } else { Some(truncate(&logs, 2_000)) },
            }
        }
        CompletionCriterion::Custom { script } => {
            if should_defer(script, ctx) {
                return CriterionResult {
                    label: "custom".into(),
                    passed: true,
                    deferred: true,
                    detail: Some("deferred: script references paths outside this role's scope".into()),
                };
            }
            let status = run_shell(ctx.worktree_path, script).await;
            let passed = status.map(|s| s.success()).unwrap_or(false);
            CriterionResult { label: "custom".into(), passed, deferred: false, detail: None }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}... (truncated)", &s[..max])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetUsage {
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub diff_lines: u64,
}

pub fn check_budget(usage: BudgetUsage, role: &Role) -> bool {
    if usage.iterations > role.budget.max_iterations {
        return true;
    }
    if let Some(max) = role.budget.max_time_ms {
        if usage.elapsed_ms > max {
            return true;
        }
    }
    if let Some(max) = role.budget.max_diff_lines {
        if usage.diff_lines > max {
            return true;
        }
    }
    false
}

pub fn check_global_budget(elapsed_ms: u64, contract: &Contract) -> bool {
    elapsed_ms > contract.global_lifetime.max_time_ms
}

pub fn should_enforce_gate<'a>(transition: &str, contract: &'a Contract) -> Option<(&'a String, &'a Gate)> {
    contract.gate_for_trigger(transition)
}
