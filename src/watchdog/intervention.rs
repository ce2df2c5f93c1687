//! Intervention: aborting a live agent and escalating to the tracker.
//!
//! The agent-token map entry lives exactly as long as one agent invocation;
//! the pipeline registers the token before spawning and clears it in its
//! teardown path, so a stale entry can never cancel a future agent that
//! happens to reuse the same issue ID.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{AgentEvent, EventSeverity, EventType};
use crate::issue::Issue;
use crate::oracle::AnomalyReport;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct InterventionRecord {
    pub issue_id: Option<String>,
    pub anomaly_type: String,
    pub at: DateTime<Utc>,
    pub escalation_issue_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InterventionOutcome {
    pub cancelled_agent: bool,
    pub escalation_issue_id: Option<String>,
    pub dampened: bool,
    pub message: String,
}

pub struct InterventionController {
    store: Arc<Store>,
    executor_id: String,
    max_history_size: usize,
    agent_tokens: Mutex<HashMap<String, CancellationToken>>,
    history: Mutex<VecDeque<InterventionRecord>>,
}

impl InterventionController {
    pub fn new(store: Arc<Store>, executor_id: impl Into<String>, max_history_size: usize) -> Self {
        Self {
            store,
            executor_id: executor_id.into(),
            max_history_size: max_history_size.max(1),
            agent_tokens: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the cancellation token for a live agent invocation.
    pub fn register_agent(&self, issue_id: &str, token: CancellationToken) {
        self.tokens().insert(issue_id.to_string(), token);
    }

    /// Remove the registration; must run in the invocation's teardown path.
    pub fn clear_agent(&self, issue_id: &str) {
        self.tokens().remove(issue_id);
    }

    pub fn registered_agents(&self) -> Vec<String> {
        self.tokens().keys().cloned().collect()
    }

    /// Act on an anomaly that met the intervention threshold: cancel the
    /// affected agent, file an escalation issue, record the intervention.
    /// Repeats of the same (issue, anomaly type) signature in the bounded
    /// history are dampened to a no-op.
    pub async fn intervene(&self, report: &AnomalyReport) -> Result<InterventionOutcome> {
        if self.is_repeat(report) {
            return Ok(InterventionOutcome {
                cancelled_agent: false,
                escalation_issue_id: None,
                dampened: true,
                message: format!(
                    "intervention dampened: {} already handled recently",
                    report.anomaly_type
                ),
            });
        }

        let cancelled = match report.issue_id.as_deref() {
            Some(issue_id) => {
                let token = self.tokens().get(issue_id).cloned();
                match token {
                    Some(token) => {
                        token.cancel();
                        tracing::warn!(
                            issue_id,
                            anomaly_type = %report.anomaly_type,
                            severity = %report.severity,
                            "Watchdog cancelled agent"
                        );
                        true
                    }
                    None => {
                        // The agent is not registered (yet, or anymore);
                        // there is nothing to abort. Leave the signature out
                        // of the history so the next tick can act.
                        tracing::warn!(issue_id, "Watchdog found no live agent to cancel");
                        return Ok(InterventionOutcome {
                            cancelled_agent: false,
                            escalation_issue_id: None,
                            dampened: false,
                            message: format!("no live agent for {issue_id}"),
                        });
                    }
                }
            }
            None => false,
        };

        let escalation_id = match self.file_escalation(report) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create escalation issue");
                None
            }
        };

        let event = AgentEvent::new(
            EventType::WatchdogIntervention,
            EventSeverity::Warning,
            format!(
                "Watchdog intervened: {} (severity={}, confidence={:.2})",
                report.anomaly_type, report.severity, report.confidence
            ),
        )
        .from_executor(self.executor_id.clone())
        .with_data(json!({
            "anomaly_type": report.anomaly_type,
            "severity": report.severity,
            "confidence": report.confidence,
            "recommended_action": report.recommended_action,
            "cancelled_agent": cancelled,
            "escalation_issue_id": escalation_id,
        }));
        let event = match &report.issue_id {
            Some(id) => event.for_issue(id.clone()),
            None => event,
        };
        if let Err(e) = self.store.store_agent_event(&event) {
            tracing::warn!(error = %e, "Failed to store intervention event");
        }

        self.record(InterventionRecord {
            issue_id: report.issue_id.clone(),
            anomaly_type: report.anomaly_type.clone(),
            at: Utc::now(),
            escalation_issue_id: escalation_id.clone(),
        });

        Ok(InterventionOutcome {
            cancelled_agent: cancelled,
            escalation_issue_id: escalation_id,
            dampened: false,
            message: format!("intervened on {}", report.anomaly_type),
        })
    }

    fn file_escalation(&self, report: &AnomalyReport) -> Result<String> {
        let subject = report
            .issue_id
            .clone()
            .unwrap_or_else(|| "system".to_string());
        let mut issue = Issue::new(format!(
            "Watchdog escalation: {} on {}",
            report.anomaly_type, subject
        ));
        issue.description = format!(
            "The watchdog aborted execution of {subject}.\n\n\
             Anomaly: {}\nSeverity: {}\nConfidence: {:.2}\n\
             Recommended action: {}\n\nRationale: {}",
            report.anomaly_type,
            report.severity,
            report.confidence,
            report.recommended_action,
            report.rationale,
        );
        issue.priority = report.severity.escalation_priority();
        self.store.create_issue(&mut issue, "watchdog")?;
        self.store.add_label(&issue.id, "watchdog-escalation")?;
        Ok(issue.id)
    }

    fn is_repeat(&self, report: &AnomalyReport) -> bool {
        let history = self.history();
        history.iter().any(|record| {
            record.anomaly_type == report.anomaly_type && record.issue_id == report.issue_id
        })
    }

    fn record(&self, record: InterventionRecord) {
        let mut history = self.history();
        history.push_back(record);
        while history.len() > self.max_history_size {
            history.pop_front();
        }
    }

    pub fn history_snapshot(&self) -> Vec<InterventionRecord> {
        self.history().iter().cloned().collect()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.agent_tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<InterventionRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::AnomalySeverity;
    use tempfile::TempDir;

    fn controller() -> (TempDir, Arc<Store>, InterventionController) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("overseer.db")).unwrap());
        let controller = InterventionController::new(store.clone(), "exec-1", 10);
        (dir, store, controller)
    }

    fn report_for(issue_id: &str) -> AnomalyReport {
        AnomalyReport {
            detected: true,
            anomaly_type: "stuck_agent".into(),
            severity: AnomalySeverity::High,
            confidence: 0.95,
            recommended_action: "abort".into(),
            rationale: "no progress events for 20 minutes".into(),
            issue_id: Some(issue_id.into()),
        }
    }

    #[tokio::test]
    async fn intervene_cancels_only_the_target() {
        let (_dir, store, controller) = controller();
        let mut target = Issue::new("stuck issue");
        store.create_issue(&mut target, "test").unwrap();

        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        controller.register_agent(&target.id, token_a.clone());
        controller.register_agent("ov-other", token_b.clone());

        let outcome = controller.intervene(&report_for(&target.id)).await.unwrap();
        assert!(outcome.cancelled_agent);
        assert!(token_a.is_cancelled());
        assert!(!token_b.is_cancelled());

        let escalation_id = outcome.escalation_issue_id.unwrap();
        let escalation = store.get_issue(&escalation_id).unwrap();
        assert!(escalation.description.contains(&target.id));
        assert_eq!(escalation.priority, 1);
    }

    #[tokio::test]
    async fn repeated_signature_is_dampened() {
        let (_dir, store, controller) = controller();
        let mut target = Issue::new("flapping issue");
        store.create_issue(&mut target, "test").unwrap();
        controller.register_agent(&target.id, CancellationToken::new());

        let first = controller.intervene(&report_for(&target.id)).await.unwrap();
        assert!(!first.dampened);
        let second = controller.intervene(&report_for(&target.id)).await.unwrap();
        assert!(second.dampened);
        assert!(second.escalation_issue_id.is_none());
    }

    #[tokio::test]
    async fn cleared_registration_cannot_be_cancelled() {
        let (_dir, store, controller) = controller();
        let mut target = Issue::new("finished issue");
        store.create_issue(&mut target, "test").unwrap();

        let token = CancellationToken::new();
        controller.register_agent(&target.id, token.clone());
        controller.clear_agent(&target.id);

        let outcome = controller.intervene(&report_for(&target.id)).await.unwrap();
        assert!(!outcome.cancelled_agent);
        assert!(!token.is_cancelled());
    }
}
