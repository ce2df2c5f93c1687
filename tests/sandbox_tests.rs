//! Sandbox manager tests against a real throwaway git repository.

mod test_harness;

use std::path::Path;
use std::process::Command;

use overseer::sandbox::{SandboxManager, SandboxSettings};
use tempfile::TempDir;

fn git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A parent repo with one commit on `main`.
fn seed_repo() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let repo = dir.path().join("parent");
    std::fs::create_dir_all(&repo).expect("mkdir");
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "seed\n").expect("write");
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "seed"]);
    (dir, repo)
}

fn manager(dir: &TempDir, repo: &Path, preserve_on_failure: bool) -> SandboxManager {
    SandboxManager::new(SandboxSettings {
        root: dir.path().join("sandboxes"),
        parent_repo: repo.to_path_buf(),
        default_branch: "main".into(),
        preserve_on_failure,
        keep_branches: false,
    })
}

#[tokio::test]
async fn create_and_cleanup_round_trip() {
    let (dir, repo) = seed_repo();
    let manager = manager(&dir, &repo, false);

    let sandbox = manager
        .create("ov-7", "Add retry to fetch", None)
        .await
        .expect("create sandbox");
    assert!(sandbox.path.join("README.md").exists());
    assert_eq!(sandbox.branch, "mission/ov-7-add-retry-to-fetch");

    manager.cleanup(&sandbox, false).await.expect("cleanup");
    assert!(!sandbox.path.exists());

    // Branch was deleted along with the worktree.
    let output = Command::new("git")
        .args(["branch", "--list", &sandbox.branch])
        .current_dir(&repo)
        .output()
        .expect("git branch");
    assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
}

#[tokio::test]
async fn failed_sandbox_is_preserved_then_pruned() {
    let (dir, repo) = seed_repo();
    let manager = manager(&dir, &repo, true);

    let sandbox = manager
        .create("ov-8", "Broken mission", None)
        .await
        .expect("create sandbox");
    manager.cleanup(&sandbox, true).await.expect("cleanup");
    assert!(
        sandbox.path.exists(),
        "failed sandbox should be preserved for debugging"
    );

    // Retention 0 prunes every non-active leftover.
    let pruned = manager.prune_stale(0).await.expect("prune");
    assert_eq!(pruned, 1);
    assert!(!sandbox.path.exists());
}

#[tokio::test]
async fn recreate_after_crash_reuses_the_slot() {
    let (dir, repo) = seed_repo();
    let manager = manager(&dir, &repo, true);

    let first = manager
        .create("ov-9", "Interrupted mission", None)
        .await
        .expect("create first");
    manager.cleanup(&first, true).await.expect("cleanup");
    assert!(first.path.exists());

    // A retry on the same issue replaces the leftover worktree.
    let second = manager
        .create("ov-9", "Interrupted mission", None)
        .await
        .expect("create second");
    assert_eq!(first.path, second.path);
    assert!(second.path.join("README.md").exists());
    manager.cleanup(&second, false).await.expect("cleanup second");
}

#[tokio::test]
async fn orphaned_branch_cleanup_spares_young_and_checked_out_branches() {
    let (dir, repo) = seed_repo();
    let manager = manager(&dir, &repo, false);

    // A live sandbox: its branch is backed by a worktree.
    let live = manager
        .create("ov-10", "Live mission", None)
        .await
        .expect("create live");

    // An orphaned mission branch with a fresh commit date.
    git(&repo, &["branch", "mission/ov-11-orphan", "main"]);

    let deleted = manager
        .cleanup_orphaned_branches(7)
        .await
        .expect("cleanup orphans");
    // Both branches survive: one is checked out, the other is too young.
    assert_eq!(deleted, 0);

    // With a zero-day retention the orphan goes, the live one stays.
    let deleted = manager
        .cleanup_orphaned_branches(0)
        .await
        .expect("cleanup orphans");
    assert_eq!(deleted, 1);

    let output = Command::new("git")
        .args(["branch", "--list", "mission/*"])
        .current_dir(&repo)
        .output()
        .expect("git branch");
    let branches = String::from_utf8_lossy(&output.stdout);
    assert!(branches.contains(&live.branch));
    assert!(!branches.contains("mission/ov-11-orphan"));

    manager.cleanup(&live, false).await.expect("cleanup live");
}
