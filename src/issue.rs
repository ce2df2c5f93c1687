use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Blocked => "blocked",
            Status::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Status::Open),
            "in_progress" => Some(Status::InProgress),
            "blocked" => Some(Status::Blocked),
            "closed" => Some(Status::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Task => "task",
            IssueType::Epic => "epic",
            IssueType::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bug" => Some(IssueType::Bug),
            "feature" => Some(IssueType::Feature),
            "task" => Some(IssueType::Task),
            "epic" => Some(IssueType::Epic),
            "chore" => Some(IssueType::Chore),
            _ => None,
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of tracked work. Status is authoritative in the store; in-process
/// copies are read-mostly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
    pub design: String,
    pub acceptance_criteria: String,
    /// 0 is highest, 4 is lowest.
    pub priority: i32,
    pub status: Status,
    pub issue_type: IssueType,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: title.into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            priority: 2,
            status: Status::Open,
            issue_type: IssueType::Task,
            assignee: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }
}

/// Field-wise update for an issue. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct IssueUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub design: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub priority: Option<i32>,
    pub status: Option<Status>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,
}

impl IssueUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
    }
}

/// Directed edge `issue -> depends_on`. The store refuses cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,
    pub depends_on: String,
}

#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<Status>,
    pub priority: Option<i32>,
    pub assignee: Option<String>,
    pub issue_type: Option<IssueType>,
    pub label: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filter for the ready-work query: open issues with no open dependencies.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Crashed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(InstanceStatus::Running),
            "stopped" => Some(InstanceStatus::Stopped),
            "crashed" => Some(InstanceStatus::Crashed),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row per executor process start, keyed by a fresh UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInstance {
    pub id: String,
    pub hostname: String,
    pub pid: i32,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

/// Per-issue execution state machine states, persisted in the claim row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Claimed,
    Assessing,
    Executing,
    Analyzing,
    Gates,
    Committing,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Claimed => "claimed",
            ExecutionState::Assessing => "assessing",
            ExecutionState::Executing => "executing",
            ExecutionState::Analyzing => "analyzing",
            ExecutionState::Gates => "gates",
            ExecutionState::Committing => "committing",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionState::Pending),
            "claimed" => Some(ExecutionState::Claimed),
            "assessing" => Some(ExecutionState::Assessing),
            "executing" => Some(ExecutionState::Executing),
            "analyzing" => Some(ExecutionState::Analyzing),
            "gates" => Some(ExecutionState::Gates),
            "committing" => Some(ExecutionState::Committing),
            "completed" => Some(ExecutionState::Completed),
            "failed" => Some(ExecutionState::Failed),
            _ => None,
        }
    }

    /// Terminal states carry no live claim.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Pending | ExecutionState::Completed | ExecutionState::Failed
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The claim row: at most one non-terminal execution state per issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueExecutionState {
    pub issue_id: String,
    pub executor_instance_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    pub checkpoint_data: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row for one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub id: i64,
    pub issue_id: String,
    pub executor_instance_id: Option<String>,
    pub attempt_number: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub exit_code: Option<i32>,
    pub summary: Option<String>,
}

/// A candidate issue surfaced by an agent run, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredIssue {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_discovery_priority")]
    pub priority: i32,
    #[serde(default)]
    pub issue_type: IssueType,
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_discovery_priority() -> i32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub issue_id: String,
    pub actor: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub open: i64,
    pub in_progress: i64,
    pub blocked: i64,
    pub closed: i64,
    pub total: i64,
}
