//! Shared fixtures for executor integration tests.
//!
//! Provides temp-backed stores, scripted agent binaries (shell scripts that
//! stand in for a real coding agent), a scripted oracle, and polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use overseer::config::{AgentConfig, ExecutorConfig};
use overseer::error::Result;
use overseer::executor::Executor;
use overseer::issue::{DiscoveredIssue, Issue};
use overseer::oracle::{
    AnomalyReport, AnomalySeverity, Assessment, DuplicateVerdict, Supervisor,
};
use overseer::store::Store;
use overseer::watchdog::ExecutionSnapshot;

pub struct TestEnv {
    pub dir: TempDir,
    pub store: Arc<Store>,
}

pub fn test_env() -> TestEnv {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(Store::open(dir.path().join("overseer.db")).expect("open store"));
    TestEnv { dir, store }
}

impl TestEnv {
    pub fn seed_issue(&self, title: &str, priority: i32) -> Issue {
        let mut issue = Issue::new(title);
        issue.priority = priority;
        self.store.create_issue(&mut issue, "test").expect("create issue");
        issue
    }

    /// Open a second store handle on the same database, as a peer executor
    /// process would.
    pub fn peer_store(&self) -> Arc<Store> {
        Arc::new(Store::open(self.dir.path().join("overseer.db")).expect("open peer store"))
    }
}

/// Write an executable shell script that stands in for the coding agent.
/// The script receives the prompt on stdin and `--stream-json` as an arg.
pub fn write_agent_script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-agent.sh");
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).expect("write agent script");
    let mut perms = std::fs::metadata(&path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// An agent that immediately succeeds, emitting a progress event and a
/// successful terminal result.
pub fn succeeding_agent(dir: &Path) -> PathBuf {
    write_agent_script(
        dir,
        r#"cat > /dev/null
echo '{"type": "agent_progress", "message": "working"}'
echo '{"type": "result", "success": true, "summary": "done"}'
exit 0"#,
    )
}

/// An agent that always fails with a non-zero exit.
pub fn failing_agent(dir: &Path) -> PathBuf {
    write_agent_script(
        dir,
        r#"cat > /dev/null
echo '{"type": "agent_progress", "message": "trying"}'
exit 1"#,
    )
}

/// Fast-interval executor config with AI, sandboxes, and gates disabled.
pub fn test_config(workdir: &Path, agent_program: &Path) -> ExecutorConfig {
    ExecutorConfig {
        poll_interval: Duration::from_millis(50),
        enable_ai_supervision: false,
        enable_quality_gates: false,
        enable_sandboxes: false,
        working_dir: workdir.to_path_buf(),
        agent: AgentConfig {
            program: agent_program.to_string_lossy().to_string(),
            args: Vec::new(),
            stream_json: true,
            timeout: Duration::from_secs(30),
        },
        ..Default::default()
    }
}

/// Stop the executor with a wall-clock deadline.
pub async fn stop_with_timeout(executor: &Executor, timeout: Duration) -> Result<()> {
    let deadline = CancellationToken::new();
    let deadline_clone = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        deadline_clone.cancel();
    });
    executor.stop(&deadline).await
}

/// How the scripted oracle answers anomaly checks.
#[derive(Debug, Clone)]
pub enum AnomalyMode {
    None,
    /// Flag this issue whenever it appears in the telemetry snapshot.
    FlagIssue {
        issue_id: String,
        severity: AnomalySeverity,
        confidence: f64,
    },
}

/// How the scripted oracle answers duplicate checks.
#[derive(Debug, Clone)]
pub enum DuplicateMode {
    NoneDuplicate,
    /// Every call errors, to exercise retry and fail-open/closed policy.
    Fail,
    /// A candidate duplicates an existing issue or an earlier candidate when
    /// one title is a prefix of the other.
    PrefixMatch { confidence: f64 },
    /// Exact title equality; deterministic across runs.
    TitleEquality { confidence: f64 },
}

pub struct ScriptedSupervisor {
    pub anomaly_mode: AnomalyMode,
    pub duplicate_mode: DuplicateMode,
}

impl ScriptedSupervisor {
    pub fn quiet() -> Arc<dyn Supervisor> {
        Self::new(AnomalyMode::None, DuplicateMode::NoneDuplicate)
    }

    pub fn new(anomaly_mode: AnomalyMode, duplicate_mode: DuplicateMode) -> Arc<dyn Supervisor> {
        Arc::new(Self {
            anomaly_mode,
            duplicate_mode,
        })
    }
}

#[async_trait]
impl Supervisor for ScriptedSupervisor {
    async fn assess_issue(&self, issue: &Issue, _context: &str) -> Result<Assessment> {
        Ok(Assessment {
            strategy: format!("scripted strategy for {}", issue.id),
            confidence: 0.9,
            estimated_effort: "short".into(),
            steps: vec!["do the thing".into()],
            risks: Vec::new(),
        })
    }

    async fn detect_anomalies(&self, snapshots: &[ExecutionSnapshot]) -> Result<AnomalyReport> {
        match &self.anomaly_mode {
            AnomalyMode::None => Ok(AnomalyReport::none()),
            AnomalyMode::FlagIssue {
                issue_id,
                severity,
                confidence,
            } => {
                if snapshots.iter().any(|s| &s.issue_id == issue_id) {
                    Ok(AnomalyReport {
                        detected: true,
                        anomaly_type: "scripted_anomaly".into(),
                        severity: *severity,
                        confidence: *confidence,
                        recommended_action: "abort".into(),
                        rationale: "scripted".into(),
                        issue_id: Some(issue_id.clone()),
                    })
                } else {
                    Ok(AnomalyReport::none())
                }
            }
        }
    }

    async fn judge_duplicates(
        &self,
        candidates: &[DiscoveredIssue],
        existing: &[Issue],
    ) -> Result<Vec<DuplicateVerdict>> {
        match &self.duplicate_mode {
            DuplicateMode::NoneDuplicate => Ok(Vec::new()),
            DuplicateMode::Fail => Err(overseer::OverseerError::Oracle(
                "scripted oracle failure".into(),
            )),
            DuplicateMode::PrefixMatch { confidence } => {
                Ok(match_candidates(candidates, existing, *confidence, |a, b| {
                    a.starts_with(b) || b.starts_with(a)
                }))
            }
            DuplicateMode::TitleEquality { confidence } => {
                Ok(match_candidates(candidates, existing, *confidence, |a, b| {
                    a == b
                }))
            }
        }
    }
}

fn match_candidates(
    candidates: &[DiscoveredIssue],
    existing: &[Issue],
    confidence: f64,
    matches: impl Fn(&str, &str) -> bool,
) -> Vec<DuplicateVerdict> {
    let mut verdicts = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(hit) = existing.iter().find(|i| matches(&candidate.title, &i.title)) {
            verdicts.push(DuplicateVerdict {
                candidate_index: index,
                duplicate_of: Some(hit.id.clone()),
                duplicate_of_candidate: None,
                confidence,
            });
            continue;
        }
        if let Some(earlier) = candidates[..index]
            .iter()
            .position(|c| matches(&candidate.title, &c.title))
        {
            verdicts.push(DuplicateVerdict {
                candidate_index: index,
                duplicate_of: None,
                duplicate_of_candidate: Some(earlier),
                confidence,
            });
        }
    }
    verdicts
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}
