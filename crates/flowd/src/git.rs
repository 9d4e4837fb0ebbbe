//! Git and CI host collaborators.
//!
//! The orchestrator shells out to `git`, `gh`, and `glab` and interprets
//! only exit codes; stderr is surfaced verbatim for the journal.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::cli_available;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed ({code}): {stderr}")]
    CommandFailed { code: i32, stderr: String },
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    if !output.status.success() {
        return Err(GitError::CommandFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Ensure a worktree for the protocol branch exists next to the clone
/// (`<repo_parent>/worktrees/<protocol_name>`), creating branch and tree
/// from `origin/<base_branch>` on first use.
pub fn ensure_worktree(repo_root: &Path, protocol_name: &str, base_branch: &str) -> Result<PathBuf> {
    let worktrees_root = repo_root
        .parent()
        .map_or_else(|| PathBuf::from("worktrees"), |p| p.join("worktrees"));
    let worktree = worktrees_root.join(protocol_name);
    if worktree.exists() {
        return Ok(worktree);
    }

    info!(protocol = protocol_name, base_branch, "creating worktree");
    let worktree_str = worktree.display().to_string();
    run_git(
        &[
            "worktree",
            "add",
            "--checkout",
            "-b",
            protocol_name,
            &worktree_str,
            &format!("origin/{base_branch}"),
        ],
        repo_root,
    )?;
    Ok(worktree)
}

/// Commit and push the protocol branch, then best-effort open a PR/MR
/// with whichever host CLI is installed. Returns whether the push
/// succeeded; PR/MR creation failures are swallowed.
pub fn push_and_open_pr(worktree: &Path, protocol_name: &str, base_branch: &str) -> bool {
    let pushed = (|| -> Result<()> {
        run_git(&["add", "."], worktree)?;
        run_git(
            &["commit", "-m", &format!("chore: sync protocol {protocol_name}")],
            worktree,
        )?;
        run_git(
            &["push", "--set-upstream", "origin", protocol_name],
            worktree,
        )?;
        Ok(())
    })();

    if let Err(e) = pushed {
        warn!(protocol = protocol_name, error = %e, "failed to push branch");
        return false;
    }

    if cli_available("gh") {
        let result = Command::new("gh")
            .args([
                "pr",
                "create",
                "--title",
                &format!("WIP: {protocol_name}"),
                "--body",
                &format!("Protocol {protocol_name} in progress"),
                "--base",
                base_branch,
            ])
            .current_dir(worktree)
            .output();
        if let Err(e) = result {
            warn!(protocol = protocol_name, error = %e, "gh pr create failed");
        }
    } else if cli_available("glab") {
        let result = Command::new("glab")
            .args([
                "mr",
                "create",
                "--title",
                &format!("WIP: {protocol_name}"),
                "--description",
                &format!("Protocol {protocol_name} in progress"),
                "--target-branch",
                base_branch,
            ])
            .current_dir(worktree)
            .output();
        if let Err(e) = result {
            warn!(protocol = protocol_name, error = %e, "glab mr create failed");
        }
    }

    true
}

/// Best-effort CI trigger after a push. Unknown providers are a no-op.
pub fn trigger_ci(provider: Option<&str>, repo_root: &Path, branch: &str) -> bool {
    let provider = provider.unwrap_or("github").to_lowercase();
    let triggered = match provider.as_str() {
        "github" => {
            if !cli_available("gh") {
                warn!("gh not available; cannot trigger GitHub workflow");
                return false;
            }
            Command::new("gh")
                .args(["workflow", "run", "--ref", branch])
                .current_dir(repo_root)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }
        "gitlab" => {
            if !cli_available("glab") {
                warn!("glab not available; cannot trigger GitLab pipeline");
                return false;
            }
            Command::new("glab")
                .args(["pipeline", "run", "--ref", branch])
                .current_dir(repo_root)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }
        other => {
            warn!(provider = other, "unsupported CI provider");
            false
        }
    };
    info!(provider, branch, triggered, "CI trigger");
    triggered
}

/// Porcelain status of the working tree, empty on any failure.
pub fn status_porcelain(cwd: &Path) -> String {
    run_git(&["status", "--porcelain"], cwd).unwrap_or_default()
}

/// Subject line of the latest commit.
pub fn last_commit_message(cwd: &Path) -> String {
    run_git(&["log", "-1", "--pretty=format:%s"], cwd)
        .unwrap_or_else(|_| "(no commits yet)".to_string())
}

/// The local repository path for a project, when its `git_url` points at
/// an existing directory.
pub fn local_repo_path(git_url: &str) -> Option<PathBuf> {
    let path = PathBuf::from(git_url);
    path.is_dir().then_some(path)
}
