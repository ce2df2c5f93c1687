use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OverseerError, Result};
use crate::oracle::AnomalySeverity;

/// Top-level executor configuration, consumed once at process start.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub version: String,
    /// Work-loop tick; also the heartbeat cadence.
    pub poll_interval: Duration,
    /// Stale-instance janitor cadence.
    pub cleanup_interval: Duration,
    /// How long without a heartbeat before a peer is declared stale.
    pub stale_threshold: Duration,
    /// How old stopped instance rows must be before deletion.
    pub instance_cleanup_age: Duration,
    /// How many stopped instance rows to keep regardless of age (0 = keep none).
    pub instance_cleanup_keep: usize,
    /// Consecutive failed attempts before an issue is blocked instead of reopened.
    pub max_consecutive_failures: usize,
    pub enable_ai_supervision: bool,
    pub enable_quality_gates: bool,
    pub enable_sandboxes: bool,
    pub enable_health_monitoring: bool,
    pub keep_sandbox_on_failure: bool,
    pub keep_branches: bool,
    /// Number of failed sandboxes to retain (0 = keep all).
    pub sandbox_retention_count: usize,
    pub working_dir: PathBuf,
    pub sandbox_root: PathBuf,
    pub parent_repo: PathBuf,
    pub default_branch: String,
    pub agent: AgentConfig,
    pub gates: Vec<GateSpec>,
    pub watchdog: WatchdogConfig,
    pub deduplication: DeduplicationConfig,
    pub event_retention: EventRetentionConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(5 * 60),
            stale_threshold: Duration::from_secs(5 * 60),
            instance_cleanup_age: Duration::from_secs(24 * 60 * 60),
            instance_cleanup_keep: 10,
            max_consecutive_failures: 3,
            enable_ai_supervision: true,
            enable_quality_gates: true,
            enable_sandboxes: true,
            enable_health_monitoring: false,
            keep_sandbox_on_failure: false,
            keep_branches: false,
            sandbox_retention_count: 3,
            working_dir: PathBuf::from("."),
            sandbox_root: PathBuf::from(".sandboxes"),
            parent_repo: PathBuf::from("."),
            default_branch: "main".to_string(),
            agent: AgentConfig::default(),
            gates: Vec::new(),
            watchdog: WatchdogConfig::default(),
            deduplication: DeduplicationConfig::default(),
            event_retention: EventRetentionConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Fail fast on configurations the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(OverseerError::InvalidConfig(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(OverseerError::InvalidConfig(
                "cleanup_interval must be greater than zero".into(),
            ));
        }
        if self.stale_threshold.is_zero() {
            return Err(OverseerError::InvalidConfig(
                "stale_threshold must be greater than zero".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(OverseerError::InvalidConfig(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.agent.program.is_empty() {
            return Err(OverseerError::InvalidConfig(
                "agent.program must not be empty".into(),
            ));
        }
        if self.agent.timeout.is_zero() {
            return Err(OverseerError::InvalidConfig(
                "agent.timeout must be greater than zero".into(),
            ));
        }
        self.watchdog.validate()?;
        self.deduplication.validate()?;
        self.event_retention.validate()?;
        Ok(())
    }
}

/// How the coding-agent subprocess is invoked.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent binary. Receives the prompt on stdin and must write structured
    /// JSON events to stdout when `stream_json` is set.
    pub program: String,
    /// Extra arguments placed before the streaming flag.
    pub args: Vec<String>,
    pub stream_json: bool,
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "amp".to_string(),
            args: Vec::new(),
            stream_json: true,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// A pass/fail check run in the working directory after the agent exits.
#[derive(Debug, Clone)]
pub struct GateSpec {
    pub name: String,
    /// Shell command, run via `sh -c`.
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Minimum oracle confidence before intervening.
    pub min_confidence: f64,
    /// Minimum anomaly severity before intervening.
    pub min_severity: AnomalySeverity,
    /// Bounded in-memory intervention history, used to damp repeats.
    pub max_history_size: usize,
    /// Emit `watchdog_alert` events for anomalies below threshold.
    pub enable_anomaly_logging: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            min_confidence: 0.8,
            min_severity: AnomalySeverity::High,
            max_history_size: 100,
            enable_anomaly_logging: true,
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            return Err(OverseerError::InvalidConfig(
                "watchdog.check_interval must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(OverseerError::InvalidConfig(
                "watchdog.min_confidence must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeduplicationConfig {
    /// Oracle confidence at or above which a candidate is a duplicate.
    pub confidence_threshold: f64,
    /// How far back to look for comparison issues.
    pub lookback_days: u32,
    /// Cap on comparison issues fetched per run.
    pub max_candidates: usize,
    /// Candidates per oracle call.
    pub batch_size: usize,
    /// Also suppress candidates duplicating an earlier candidate in the batch.
    pub within_batch: bool,
    /// On persistent oracle failure: file anyway (true) or block creation.
    pub fail_open: bool,
    pub include_closed: bool,
    /// Titles shorter than this are too generic to compare; they are filed as-is.
    pub min_title_length: usize,
    pub max_retries: usize,
    pub timeout: Duration,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            lookback_days: 30,
            max_candidates: 50,
            batch_size: 10,
            within_batch: true,
            fail_open: true,
            include_closed: false,
            min_title_length: 10,
            max_retries: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DeduplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(OverseerError::InvalidConfig(
                "deduplication.confidence_threshold must be in [0, 1]".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(OverseerError::InvalidConfig(
                "deduplication.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EventRetentionConfig {
    pub enabled: bool,
    /// Events older than this are deleted.
    pub retention_days: u32,
    /// Error-severity events are kept this long instead.
    pub retention_critical_days: u32,
    /// Per-issue event cap enforced each cycle.
    pub per_issue_limit: usize,
    /// Global event cap; cleanup triggers at 95% of this.
    pub global_limit: usize,
    pub cleanup_interval_hours: u32,
    /// Rows deleted per statement.
    pub batch_size: usize,
    /// Compact storage after a cycle that deleted anything.
    pub vacuum: bool,
}

impl Default for EventRetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            retention_critical_days: 90,
            per_issue_limit: 1000,
            global_limit: 100_000,
            cleanup_interval_hours: 6,
            batch_size: 500,
            vacuum: false,
        }
    }
}

impl EventRetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(OverseerError::InvalidConfig(
                "event_retention.retention_days must be at least 1".into(),
            ));
        }
        if self.retention_critical_days < self.retention_days {
            return Err(OverseerError::InvalidConfig(
                "event_retention.retention_critical_days must be >= retention_days".into(),
            ));
        }
        if self.per_issue_limit == 0 || self.global_limit == 0 {
            return Err(OverseerError::InvalidConfig(
                "event_retention limits must be at least 1".into(),
            ));
        }
        if self.cleanup_interval_hours == 0 {
            return Err(OverseerError::InvalidConfig(
                "event_retention.cleanup_interval_hours must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(OverseerError::InvalidConfig(
                "event_retention.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
