use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventSeverity::Info),
            "warning" => Some(EventSeverity::Warning),
            "error" => Some(EventSeverity::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    IssueClaimed,
    AssessmentStarted,
    AssessmentCompleted,
    AgentSpawned,
    AgentProgress,
    AgentCompleted,
    ResultsProcessingStarted,
    ResultsProcessingCompleted,
    GatesCompleted,
    DedupDecision,
    WatchdogAlert,
    WatchdogIntervention,
    EventCleanupCompleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::IssueClaimed => "issue_claimed",
            EventType::AssessmentStarted => "assessment_started",
            EventType::AssessmentCompleted => "assessment_completed",
            EventType::AgentSpawned => "agent_spawned",
            EventType::AgentProgress => "agent_progress",
            EventType::AgentCompleted => "agent_completed",
            EventType::ResultsProcessingStarted => "results_processing_started",
            EventType::ResultsProcessingCompleted => "results_processing_completed",
            EventType::GatesCompleted => "gates_completed",
            EventType::DedupDecision => "dedup_decision",
            EventType::WatchdogAlert => "watchdog_alert",
            EventType::WatchdogIntervention => "watchdog_intervention",
            EventType::EventCleanupCompleted => "event_cleanup_completed",
            EventType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issue_claimed" => Some(EventType::IssueClaimed),
            "assessment_started" => Some(EventType::AssessmentStarted),
            "assessment_completed" => Some(EventType::AssessmentCompleted),
            "agent_spawned" => Some(EventType::AgentSpawned),
            "agent_progress" => Some(EventType::AgentProgress),
            "agent_completed" => Some(EventType::AgentCompleted),
            "results_processing_started" => Some(EventType::ResultsProcessingStarted),
            "results_processing_completed" => Some(EventType::ResultsProcessingCompleted),
            "gates_completed" => Some(EventType::GatesCompleted),
            "dedup_decision" => Some(EventType::DedupDecision),
            "watchdog_alert" => Some(EventType::WatchdogAlert),
            "watchdog_intervention" => Some(EventType::WatchdogIntervention),
            "event_cleanup_completed" => Some(EventType::EventCleanupCompleted),
            "error" => Some(EventType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured event extracted from executor activity or agent output.
///
/// `issue_id` is `None` for system-wide events (e.g. retention summaries);
/// the column is nullable rather than pointing at a sentinel issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub issue_id: Option<String>,
    pub executor_id: Option<String>,
    pub agent_id: Option<String>,
    pub event_type: EventType,
    pub severity: EventSeverity,
    pub message: String,
    pub data: Value,
    /// Line number in the agent output stream, 0 when not applicable.
    pub source_line: i64,
}

impl AgentEvent {
    pub fn new(event_type: EventType, severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            issue_id: None,
            executor_id: None,
            agent_id: None,
            event_type,
            severity,
            message: message.into(),
            data: Value::Null,
            source_line: 0,
        }
    }

    pub fn for_issue(mut self, issue_id: impl Into<String>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }

    pub fn from_executor(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = Some(executor_id.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub issue_id: Option<String>,
    pub event_type: Option<EventType>,
    pub severity: Option<EventSeverity>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct EventCounts {
    pub total: i64,
    pub by_type: HashMap<String, i64>,
}
