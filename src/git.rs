//! Diff & Git Adapter (C1). Wraps the `git` CLI: branch/worktree
//! create/remove, commit, reset, clean, merge, and parses `git diff`
//! into a structured result with additions/deletions/change-type per
//! path. Untracked files are treated as `added`; engine-managed and
//! conventional build-artifact paths are filtered as noise.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::globmatch;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git {0:?}: {1}")]
    Spawn(Vec<String>, std::io::Error),
    #[error("git {0:?} failed: {1}")]
    Command(Vec<String>, String),
}

/// Untracked-file prefixes filtered out of `ls-files --others`. The
/// spec notes the exact list is an open question (§9) — this is
/// operational guidance, not a contract, and may be overridden via
/// `GitAdapter::with_noise_prefixes`.
pub const DEFAULT_NOISE_PREFIXES: &[&str] = &[
    "node_modules/",
    "dist/",
    "out/",
    "coverage/",
    "target/",
    ".next/",
    ".turbo/",
    ".vercel/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub change_type: ChangeType,
    pub additions: u64,
    pub deletions: u64,
    pub old_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiffSummary {
    pub additions: u64,
    pub deletions: u64,
    pub files_changed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub files: Vec<FileDiff>,
    pub summary: DiffSummary,
    pub raw: String,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Diff filtered to paths that are not engine-managed — used
    /// everywhere scope/completion verification reads `lastDiff`.
    pub fn filtered_non_engine(&self) -> DiffResult {
        let files: Vec<FileDiff> = self
            .files
            .iter()
            .filter(|f| !globmatch::is_engine_managed(&f.path))
            .cloned()
            .collect();
        let summary = DiffSummary {
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
            files_changed: files.len(),
        };
        DiffResult {
            files,
            summary,
            raw: self.raw.clone(),
        }
    }
}

pub struct MergeOptions {
    pub ff_only: bool,
    pub allow_no_ff: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IsCleanOptions {
    pub ignore_nibbler_engine_artifacts: bool,
}

pub struct GitAdapter {
    repo_root: PathBuf,
    noise_prefixes: Vec<String>,
}

impl GitAdapter {
    pub fn new(repo_root: &Path) -> Self {
        GitAdapter {
            repo_root: repo_root.to_path_buf(),
            noise_prefixes: DEFAULT_NOISE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_noise_prefixes(repo_root: &Path, prefixes: Vec<String>) -> Self {
        GitAdapter {
            repo_root: repo_root.to_path_buf(),
            noise_prefixes: prefixes,
        }
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| GitError::Spawn(owned.clone(), e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(GitError::Command(owned, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_in(&self, args: &[&str]) -> Result<String, GitError> {
        self.run(&self.repo_root, args)
    }

    pub fn get_current_commit(&self) -> Result<String, GitError> {
        Ok(self.run_in(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn get_current_branch(&self) -> Result<String, GitError> {
        Ok(self
            .run_in(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    pub fn create_branch_at(&self, name: &str, at_ref: &str) -> Result<(), GitError> {
        self.run_in(&["branch", name, at_ref])?;
        Ok(())
    }

    pub fn add_worktree(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        self.run_in(&["worktree", "add", &path.to_string_lossy(), branch])?;
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run_in(&args)?;
        Ok(())
    }

    pub fn delete_branch(&self, name: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run_in(&["branch", flag, name])?;
        Ok(())
    }

    pub fn merge_branch(&self, name: &str, opts: &MergeOptions) -> Result<(), GitError> {
        let mut args = vec!["merge"];
        if opts.ff_only {
            args.push("--ff-only");
        } else if opts.allow_no_ff {
            args.push("--no-ff");
            args.push("--no-edit");
        }
        args.push(name);
        self.run_in(&args)?;
        Ok(())
    }

    pub fn reset_hard(&self, commit: &str) -> Result<(), GitError> {
        self.run_in(&["reset", "--hard", commit])?;
        Ok(())
    }

    pub fn clean(&self) -> Result<(), GitError> {
        self.run_in(&["clean", "-fd"])?;
        Ok(())
    }

    pub fn ls_files(&self) -> Result<Vec<String>, GitError> {
        Ok(self
            .run_in(&["ls-files"])?
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    fn untracked_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_in(&["ls-files", "--others", "--exclude-standard"])?;
        Ok(out
            .lines()
            .map(|l| l.to_string())
            .filter(|p| !self.noise_prefixes.iter().any(|n| p.starts_with(n.as_str())))
            .collect())
    }

    /// Porcelain-based cleanliness check. With
    /// `ignore_nibbler_engine_artifacts`, a status line counts as clean
    /// only if every path it mentions is engine-managed or a
    /// conventional build/cache artifact.
    pub fn is_clean(&self, opts: &IsCleanOptions) -> Result<bool, GitError> {
        let status = self.run_in(&["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(true);
        }
        if !opts.ignore_nibbler_engine_artifacts {
            return Ok(false);
        }
        for line in status.lines() {
            if line.len() < 4 {
                continue;
            }
            let path = line[3..].trim();
            let ignorable = globmatch::is_engine_managed(path)
                || self.noise_prefixes.iter().any(|n| path.starts_with(n.as_str()));
            if !ignorable {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Stages everything, unstages engine-artifact paths (unless
    /// `include_engine_artifacts`), then commits only if something
    /// remains staged. Returns `true` if a commit was made.
    pub fn commit(&self, message: &str, include_engine_artifacts: bool) -> Result<bool, GitError> {
        self.run_in(&["add", "-A"])?;

        if !include_engine_artifacts {
            let staged = self.run_in(&["diff", "--cached", "--name-only"])?;
            for path in staged.lines() {
                if globmatch::is_engine_managed(path) {
                    let _ = self.run_in(&["reset", "--", path]);
                }
            }
        }

        let nothing_staged = self
            .run(&self.repo_root, &["diff", "--cached", "--quiet"])
            .is_ok();
        if nothing_staged {
            return Ok(false);
        }

        self.run_in(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Parses `git diff --name-status <from>..<to>` plus `--numstat`,
    /// combined with untracked files (as `added`, 0/0 counts).
    pub fn diff(&self, from: &str, to: Option<&str>) -> Result<DiffResult, GitError> {
        let range = match to {
            Some(to) => format!("{from}..{to}"),
            None => from.to_string(),
        };

        let name_status = self.run_in(&["diff", "--name-status", &range])?;
        let numstat = self.run_in(&["diff", "--numstat", &range])?;

        let mut numstat_map = std::collections::HashMap::new();
        for line in numstat.lines() {
            let mut parts = line.splitn(3, '\t');
            let additions = parts.next().unwrap_or("0");
            let deletions = parts.next().unwrap_or("0");
            let path = parts.next().unwrap_or("").to_string();
            let additions = additions.parse::<u64>().unwrap_or(0);
            let deletions = deletions.parse::<u64>().unwrap_or(0);
            numstat_map.insert(path, (additions, deletions));
        }

        let mut files = Vec::new();
        for line in name_status.lines() {
            let mut parts = line.split('\t');
            let Some(status) = parts.next() else { continue };
            let first_path = parts.next().unwrap_or("").to_string();

            let (change_type, path, old_path) = if let Some(tag) = status.chars().next() {
                match tag {
                    'A' => (ChangeType::Added, first_path, None),
                    'M' => (ChangeType::Modified, first_path, None),
                    'D' => (ChangeType::Deleted, first_path, None),
                    'R' => {
                        let new_path = parts.next().unwrap_or("").to_string();
                        (ChangeType::Renamed, new_path, Some(first_path))
                    }
                    _ => (ChangeType::Modified, first_path, None),
                }
            } else {
                continue;
            };

            let (additions, deletions) = numstat_map.get(&path).copied().unwrap_or((0, 0));
            files.push(FileDiff {
                path,
                change_type,
                additions,
                deletions,
                old_path,
            });
        }

        for untracked in self.untracked_files()? {
            if files.iter().any(|f| f.path == untracked) {
                continue;
            }
            files.push(FileDiff {
                path: untracked,
                change_type: ChangeType::Added,
                additions: 0,
                deletions: 0,
                old_path: None,
            });
        }

        let summary = DiffSummary {
            additions: files.iter().map(|f| f.additions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
            files_changed: files.len(),
        };

        Ok(DiffResult {
            files,
            summary,
            raw: name_status,
        })
    }
}
