//! In-process telemetry for live executions.
//!
//! The work loop registers a descriptor when it claims an issue and feeds it
//! state transitions and event counts as the agent runs. The watchdog loop
//! snapshots all descriptors each tick; the map never leaves this process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::issue::ExecutionState;

#[derive(Debug)]
struct ExecutionTelemetry {
    executor_id: String,
    started: Instant,
    state: ExecutionState,
    event_counts: HashMap<String, u64>,
    last_progress_at: DateTime<Utc>,
}

/// Point-in-time view of one live execution, handed to the anomaly oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub issue_id: String,
    pub executor_id: String,
    pub state: ExecutionState,
    pub elapsed_secs: u64,
    pub event_counts: HashMap<String, u64>,
    pub last_progress_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    executions: Mutex<HashMap<String, ExecutionTelemetry>>,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_execution(&self, issue_id: &str, executor_id: &str) {
        let mut executions = self.lock();
        executions.insert(
            issue_id.to_string(),
            ExecutionTelemetry {
                executor_id: executor_id.to_string(),
                started: Instant::now(),
                state: ExecutionState::Claimed,
                event_counts: HashMap::new(),
                last_progress_at: Utc::now(),
            },
        );
    }

    pub fn record_event(&self, issue_id: &str, event_type: &str) {
        let mut executions = self.lock();
        if let Some(telemetry) = executions.get_mut(issue_id) {
            *telemetry
                .event_counts
                .entry(event_type.to_string())
                .or_insert(0) += 1;
            telemetry.last_progress_at = Utc::now();
        }
    }

    pub fn record_state(&self, issue_id: &str, state: ExecutionState) {
        let mut executions = self.lock();
        if let Some(telemetry) = executions.get_mut(issue_id) {
            telemetry.state = state;
            telemetry.last_progress_at = Utc::now();
        }
    }

    pub fn end_execution(&self, issue_id: &str) {
        let mut executions = self.lock();
        executions.remove(issue_id);
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<ExecutionSnapshot> {
        let executions = self.lock();
        executions
            .iter()
            .map(|(issue_id, t)| ExecutionSnapshot {
                issue_id: issue_id.clone(),
                executor_id: t.executor_id.clone(),
                state: t.state,
                elapsed_secs: t.started.elapsed().as_secs(),
                event_counts: t.event_counts.clone(),
                last_progress_at: t.last_progress_at,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ExecutionTelemetry>> {
        self.executions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_of_a_descriptor() {
        let monitor = ExecutionMonitor::new();
        monitor.start_execution("ov-1", "exec-1");
        monitor.record_event("ov-1", "agent_progress");
        monitor.record_event("ov-1", "agent_progress");
        monitor.record_state("ov-1", ExecutionState::Executing);

        let snapshots = monitor.snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].issue_id, "ov-1");
        assert_eq!(snapshots[0].state, ExecutionState::Executing);
        assert_eq!(snapshots[0].event_counts.get("agent_progress"), Some(&2));

        monitor.end_execution("ov-1");
        assert_eq!(monitor.active_count(), 0);
    }

    #[test]
    fn events_for_unknown_issue_are_ignored() {
        let monitor = ExecutionMonitor::new();
        monitor.record_event("ov-9", "agent_progress");
        assert!(monitor.snapshot().is_empty());
    }
}
