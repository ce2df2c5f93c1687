//! Per-mission sandboxes: an isolated git worktree on a dedicated branch.
//!
//! Every sandbox is either referenced by the active execution that created it
//! or eligible for deletion; the manager tracks active paths in-process and
//! the janitor prunes whatever is left behind (preserved failures, crashes).
//! Branches follow the `mission/<issue-id>-<slug>` pattern.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{TimeZone, Utc};
use tokio::process::Command;

use crate::error::{OverseerError, Result};

pub const BRANCH_PREFIX: &str = "mission/";

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub issue_id: String,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub root: PathBuf,
    pub parent_repo: PathBuf,
    pub default_branch: String,
    pub preserve_on_failure: bool,
    pub keep_branches: bool,
}

pub struct SandboxManager {
    settings: SandboxSettings,
    active: Mutex<HashSet<PathBuf>>,
}

impl SandboxManager {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Create a fresh worktree for `issue_id` branched from `base_branch`
    /// (falling back to the configured default branch).
    pub async fn create(
        &self,
        issue_id: &str,
        title: &str,
        base_branch: Option<&str>,
    ) -> Result<Sandbox> {
        let base = base_branch.unwrap_or(&self.settings.default_branch);
        let branch = branch_name(issue_id, title);
        let path = self.settings.root.join(format!("mission-{issue_id}"));

        std::fs::create_dir_all(&self.settings.root)?;
        if path.exists() {
            // Leftover from a previous attempt on the same issue.
            self.remove_worktree(&path).await.ok();
        }

        self.git(&[
            "worktree",
            "add",
            "-B",
            &branch,
            &path.to_string_lossy(),
            base,
        ])
        .await?;

        self.active_paths().insert(path.clone());
        tracing::info!(issue_id, branch = %branch, path = %path.display(), "Sandbox created");

        Ok(Sandbox {
            issue_id: issue_id.to_string(),
            path,
            branch,
        })
    }

    /// Tear the sandbox down. Failed missions keep their worktree when
    /// `preserve_on_failure` is set; the janitor prunes them later.
    pub async fn cleanup(&self, sandbox: &Sandbox, failed: bool) -> Result<()> {
        self.active_paths().remove(&sandbox.path);

        if failed && self.settings.preserve_on_failure {
            tracing::info!(
                issue_id = %sandbox.issue_id,
                path = %sandbox.path.display(),
                "Preserving failed sandbox for debugging"
            );
            return Ok(());
        }

        self.remove_worktree(&sandbox.path).await?;
        if !self.settings.keep_branches {
            if let Err(e) = self.git(&["branch", "-D", &sandbox.branch]).await {
                tracing::warn!(branch = %sandbox.branch, error = %e, "Failed to delete mission branch");
            }
        }
        Ok(())
    }

    /// Prune leftover sandbox directories beyond `keep`, oldest first.
    /// Directories referenced by an active execution are never touched.
    pub async fn prune_stale(&self, keep: usize) -> Result<usize> {
        let root = &self.settings.root;
        if !root.exists() {
            return Ok(0);
        }

        let active = self.active_paths().clone();
        let mut stale: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || active.contains(&path) {
                continue;
            }
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("mission-") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            stale.push((modified, path));
        }

        if stale.len() <= keep {
            return Ok(0);
        }
        stale.sort_by_key(|(modified, _)| *modified);
        let excess = stale.len() - keep;

        let mut pruned = 0usize;
        for (_, path) in stale.into_iter().take(excess) {
            match self.remove_worktree(&path).await {
                Ok(()) => pruned += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to prune sandbox")
                }
            }
        }
        Ok(pruned)
    }

    /// Delete mission branches with no backing worktree that are older than
    /// `retention_days`. Individual failures are logged, never fatal.
    pub async fn cleanup_orphaned_branches(&self, retention_days: u32) -> Result<usize> {
        let refs = self
            .git(&[
                "for-each-ref",
                "--format=%(refname:short) %(committerdate:unix)",
                &format!("refs/heads/{BRANCH_PREFIX}"),
            ])
            .await?;

        let worktree_branches = self.worktree_branches().await?;
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

        let mut deleted = 0usize;
        for line in refs.lines() {
            let mut parts = line.split_whitespace();
            let (Some(branch), Some(epoch)) = (parts.next(), parts.next()) else {
                continue;
            };
            if worktree_branches.contains(branch) {
                continue;
            }
            let committed = epoch
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            let Some(committed) = committed else { continue };
            if committed >= cutoff {
                continue;
            }
            match self.git(&["branch", "-D", branch]).await {
                Ok(_) => {
                    tracing::info!(branch, "Deleted orphaned mission branch");
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!(branch, error = %e, "Failed to delete orphaned branch")
                }
            }
        }
        Ok(deleted)
    }

    async fn worktree_branches(&self) -> Result<HashSet<String>> {
        let output = self.git(&["worktree", "list", "--porcelain"]).await?;
        let mut branches = HashSet::new();
        for line in output.lines() {
            if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                branches.insert(branch.to_string());
            }
        }
        Ok(branches)
    }

    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        self.git(&["worktree", "remove", "--force", &path.to_string_lossy()])
            .await?;
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.settings.parent_repo)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                format!("exit status {:?}", output.status.code())
            } else {
                stderr
            };
            return Err(OverseerError::Sandbox(format!(
                "git {} failed: {detail}",
                args.join(" ")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn active_paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `mission/<issue-id>-<slug>`, slug derived from the title.
pub fn branch_name(issue_id: &str, title: &str) -> String {
    let slug = slugify(title, 24);
    if slug.is_empty() {
        format!("{BRANCH_PREFIX}{issue_id}")
    } else {
        format!("{BRANCH_PREFIX}{issue_id}-{slug}")
    }
}

fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if slug.len() >= max_len {
            break;
        }
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_names_are_slugged() {
        assert_eq!(
            branch_name("ov-12", "Add retry to fetch"),
            "mission/ov-12-add-retry-to-fetch"
        );
        assert_eq!(branch_name("ov-12", "!!!"), "mission/ov-12");
        assert_eq!(
            branch_name("ov-3", "Fix: crash in login handler (intermittent)"),
            "mission/ov-3-fix-crash-in-login-handl"
        );
    }

    #[test]
    fn slug_is_bounded_and_clean() {
        let slug = slugify("A very long title that should be truncated somewhere", 24);
        assert!(slug.len() <= 24);
        assert!(!slug.starts_with('-') && !slug.ends_with('-'));
    }
}
