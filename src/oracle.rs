//! Oracle seam: structured judgments from an external AI service.
//!
//! The executor never inspects how a judgment was produced; it consumes
//! [`Assessment`], [`AnomalyReport`], and [`DuplicateVerdict`] values through
//! the [`Supervisor`] trait. Tests substitute scripted implementations.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{OverseerError, Result};
use crate::issue::{DiscoveredIssue, Issue};
use crate::watchdog::monitor::ExecutionSnapshot;

/// Pre-execution assessment of how to approach an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub strategy: String,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub estimated_effort: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "low",
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }

    /// Escalation issues inherit priority from the anomaly severity.
    pub fn escalation_priority(&self) -> i32 {
        match self {
            AnomalySeverity::Critical => 0,
            AnomalySeverity::High => 1,
            AnomalySeverity::Medium => 2,
            AnomalySeverity::Low => 3,
        }
    }
}

impl std::fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict from one watchdog anomaly check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub detected: bool,
    #[serde(default)]
    pub anomaly_type: String,
    #[serde(default)]
    pub severity: AnomalySeverity,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub recommended_action: String,
    #[serde(default)]
    pub rationale: String,
    /// The execution the anomaly was observed on.
    #[serde(default)]
    pub issue_id: Option<String>,
}

impl AnomalyReport {
    pub fn none() -> Self {
        Self {
            detected: false,
            anomaly_type: String::new(),
            severity: AnomalySeverity::Low,
            confidence: 0.0,
            recommended_action: String::new(),
            rationale: String::new(),
            issue_id: None,
        }
    }
}

/// Per-candidate duplicate judgment.
///
/// `duplicate_of` names an existing issue; `duplicate_of_candidate` points at
/// an earlier candidate index in the same batch (within-batch suppression).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateVerdict {
    pub candidate_index: usize,
    #[serde(default)]
    pub duplicate_of: Option<String>,
    #[serde(default)]
    pub duplicate_of_candidate: Option<usize>,
    #[serde(default)]
    pub confidence: f64,
}

/// Request/response oracle returning structured judgments.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn assess_issue(&self, issue: &Issue, context: &str) -> Result<Assessment>;

    /// Judge the current telemetry snapshots for anomalies.
    async fn detect_anomalies(&self, snapshots: &[ExecutionSnapshot]) -> Result<AnomalyReport>;

    /// Judge each candidate against the comparison set.
    async fn judge_duplicates(
        &self,
        candidates: &[DiscoveredIssue],
        existing: &[Issue],
    ) -> Result<Vec<DuplicateVerdict>>;
}

/// Supervisor backed by an external command.
///
/// The command is invoked as `<program> <verb>` with a JSON request on stdin
/// and must print a JSON response on stdout. Verbs: `assess`, `anomalies`,
/// `duplicates`.
pub struct CommandSupervisor {
    program: String,
    timeout: Duration,
}

impl CommandSupervisor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn call(&self, verb: &str, request: serde_json::Value) -> Result<serde_json::Value> {
        let mut child = Command::new(&self.program)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OverseerError::Oracle(format!("spawn {}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OverseerError::Oracle("oracle stdin was not piped".into()))?;
        let body = serde_json::to_vec(&request)?;
        stdin
            .write_all(&body)
            .await
            .map_err(|e| OverseerError::Oracle(format!("write request: {e}")))?;
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OverseerError::Oracle(format!("oracle {verb} timed out")))?
            .map_err(|e| OverseerError::Oracle(format!("wait: {e}")))?;

        if !output.status.success() {
            return Err(OverseerError::Oracle(format!(
                "oracle {verb} exited with {:?}",
                output.status.code()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| OverseerError::Oracle(format!("parse {verb} response: {e}")))
    }
}

#[async_trait]
impl Supervisor for CommandSupervisor {
    async fn assess_issue(&self, issue: &Issue, context: &str) -> Result<Assessment> {
        let response = self
            .call("assess", json!({ "issue": issue, "context": context }))
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn detect_anomalies(&self, snapshots: &[ExecutionSnapshot]) -> Result<AnomalyReport> {
        let response = self
            .call("anomalies", json!({ "executions": snapshots }))
            .await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn judge_duplicates(
        &self,
        candidates: &[DiscoveredIssue],
        existing: &[Issue],
    ) -> Result<Vec<DuplicateVerdict>> {
        let response = self
            .call(
                "duplicates",
                json!({ "candidates": candidates, "existing": existing }),
            )
            .await?;
        Ok(serde_json::from_value(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_escalation() {
        assert!(AnomalySeverity::Critical > AnomalySeverity::High);
        assert!(AnomalySeverity::High > AnomalySeverity::Medium);
        assert!(AnomalySeverity::Medium > AnomalySeverity::Low);
        assert_eq!(AnomalySeverity::Critical.escalation_priority(), 0);
        assert_eq!(AnomalySeverity::Low.escalation_priority(), 3);
    }

    #[test]
    fn anomaly_report_deserializes_with_defaults() {
        let report: AnomalyReport = serde_json::from_str(r#"{"detected": false}"#).unwrap();
        assert!(!report.detected);
        assert_eq!(report.severity, AnomalySeverity::Low);
        assert!(report.issue_id.is_none());
    }
}
