use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverseerError {
    #[error("Issue not found: {0}")]
    IssueNotFound(String),

    #[error("Issue {issue_id} already claimed")]
    ClaimRaceLost { issue_id: String },

    #[error("Dependency cycle: {issue_id} -> {depends_on}")]
    DependencyCycle { issue_id: String, depends_on: String },

    #[error("Executor is already running")]
    AlreadyRunning,

    #[error("Executor is not running")]
    NotRunning,

    #[error("Shutdown deadline exceeded while waiting for loops to drain")]
    ShutdownDeadline,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OverseerError>;
