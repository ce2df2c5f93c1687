//! The executor runtime: instance registration, the work loop, and the
//! watchdog loop, plus the janitor loops in [`janitor`] and the per-issue
//! pipeline in [`pipeline`].
//!
//! One executor process runs four long-lived loops over a shared store. The
//! store's atomic claim is the only cross-executor synchronization; losing a
//! claim race is routine. Cancellation flows root -> loop -> execution ->
//! agent, and `stop` waits for all loop done-signals concurrently under the
//! caller's deadline.

pub mod context;
pub mod janitor;
pub mod pipeline;

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::dedup::Deduplicator;
use crate::error::{OverseerError, Result};
use crate::events::{AgentEvent, EventSeverity, EventType};
use crate::gates::GateRunner;
use crate::issue::{ExecutorInstance, InstanceStatus, WorkFilter};
use crate::oracle::Supervisor;
use crate::sandbox::{SandboxManager, SandboxSettings};
use crate::store::Store;
use crate::watchdog::{self, Analyzer, ExecutionMonitor, InterventionController};

const ORPHANED_BRANCH_RETENTION_DAYS: u32 = 7;

struct LoopSet {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Executor {
    pub(crate) store: Arc<Store>,
    pub(crate) config: ExecutorConfig,
    pub(crate) supervisor: Option<Arc<dyn Supervisor>>,
    pub(crate) monitor: Arc<ExecutionMonitor>,
    pub(crate) intervention: Arc<InterventionController>,
    pub(crate) analyzer: Option<Arc<Analyzer>>,
    pub(crate) sandboxes: Option<Arc<SandboxManager>>,
    pub(crate) dedup: Option<Arc<Deduplicator>>,
    pub(crate) gates: GateRunner,
    pub(crate) instance_id: String,
    hostname: String,
    pid: i32,
    running: RwLock<bool>,
    loops: Mutex<Option<LoopSet>>,
}

impl Executor {
    /// Wire up an executor from configuration. The supervisor is injected by
    /// the caller; when AI supervision is enabled but no supervisor is
    /// available, supervision is disabled with a warning rather than failing.
    pub fn new(
        config: ExecutorConfig,
        store: Arc<Store>,
        supervisor: Option<Arc<dyn Supervisor>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let instance_id = Uuid::new_v4().to_string();
        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let supervisor = if config.enable_ai_supervision {
            if supervisor.is_none() {
                tracing::warn!(
                    "AI supervision enabled but no supervisor configured (continuing without)"
                );
            }
            supervisor
        } else {
            None
        };

        let monitor = Arc::new(ExecutionMonitor::new());
        let intervention = Arc::new(InterventionController::new(
            store.clone(),
            instance_id.clone(),
            config.watchdog.max_history_size,
        ));
        let analyzer = supervisor
            .clone()
            .map(|s| Arc::new(Analyzer::new(monitor.clone(), s)));
        let sandboxes = config.enable_sandboxes.then(|| {
            Arc::new(SandboxManager::new(SandboxSettings {
                root: config.sandbox_root.clone(),
                parent_repo: config.parent_repo.clone(),
                default_branch: config.default_branch.clone(),
                preserve_on_failure: config.keep_sandbox_on_failure,
                keep_branches: config.keep_branches,
            }))
        });
        let dedup = supervisor.clone().map(|s| {
            Arc::new(Deduplicator::new(
                s,
                store.clone(),
                config.deduplication.clone(),
                instance_id.clone(),
            ))
        });
        let gates = GateRunner::new(config.gates.clone());

        if config.enable_health_monitoring {
            // Health monitors are registered by embedders; the runtime only
            // carries the flag.
            tracing::info!("Health monitoring enabled (no monitors registered)");
        }

        Ok(Arc::new(Self {
            store,
            config,
            supervisor,
            monitor,
            intervention,
            analyzer,
            sandboxes,
            dedup,
            gates,
            instance_id,
            hostname,
            pid: std::process::id() as i32,
            running: RwLock::new(false),
            loops: Mutex::new(None),
        }))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_running(&self) -> bool {
        *self.running.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register this instance, reclaim work from dead peers, then start the
    /// loops. Reclamation runs synchronously before the first claim so a new
    /// instance never passes over work that only appears held.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.write().unwrap_or_else(|e| e.into_inner());
            if *running {
                return Err(OverseerError::AlreadyRunning);
            }
            *running = true;
        }

        let now = Utc::now();
        let instance = ExecutorInstance {
            id: self.instance_id.clone(),
            hostname: self.hostname.clone(),
            pid: self.pid,
            version: self.config.version.clone(),
            started_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Running,
        };
        if let Err(e) = self.store.register_instance(&instance) {
            let mut running = self.running.write().unwrap_or_else(|p| p.into_inner());
            *running = false;
            return Err(e);
        }

        match self.store.cleanup_stale_instances(self.config.stale_threshold) {
            Ok(0) => {}
            Ok(cleaned) => {
                tracing::info!(cleaned, "Reclaimed stale instances on startup");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reclaim stale instances on startup");
            }
        }

        if let Some(sandboxes) = &self.sandboxes {
            if !self.config.keep_branches {
                match sandboxes
                    .cleanup_orphaned_branches(ORPHANED_BRANCH_RETENTION_DAYS)
                    .await
                {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "Deleted orphaned mission branches"),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to clean orphaned mission branches")
                    }
                }
            }
        }

        let stop = CancellationToken::new();
        let mut handles = Vec::new();

        let this = self.clone();
        let loop_stop = stop.child_token();
        handles.push(tokio::spawn(async move { this.work_loop(loop_stop).await }));

        if self.config.watchdog.enabled && self.analyzer.is_some() {
            let this = self.clone();
            let loop_stop = stop.child_token();
            handles.push(tokio::spawn(async move {
                this.watchdog_loop(loop_stop).await;
            }));
            tracing::info!(
                check_interval_secs = self.config.watchdog.check_interval.as_secs(),
                min_confidence = self.config.watchdog.min_confidence,
                min_severity = %self.config.watchdog.min_severity,
                "Watchdog monitoring started"
            );
        }

        let this = self.clone();
        let loop_stop = stop.child_token();
        handles.push(tokio::spawn(async move {
            this.stale_cleanup_loop(loop_stop).await;
        }));

        let this = self.clone();
        let loop_stop = stop.child_token();
        handles.push(tokio::spawn(async move {
            this.event_retention_loop(loop_stop).await;
        }));

        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        *loops = Some(LoopSet { stop, handles });

        tracing::info!(
            instance_id = %self.instance_id,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Executor started"
        );
        Ok(())
    }

    /// Signal every loop to stop and wait for their done-signals. All loops
    /// drain concurrently; if `deadline` fires first, the deadline error is
    /// returned even though stragglers are still draining.
    pub async fn stop(&self, deadline: &CancellationToken) -> Result<()> {
        let loop_set = {
            let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            loops.take()
        };
        let Some(LoopSet { stop, handles }) = loop_set else {
            return Err(OverseerError::NotRunning);
        };

        stop.cancel();

        for handle in handles {
            tokio::select! {
                _ = handle => {}
                _ = deadline.cancelled() => {
                    return Err(OverseerError::ShutdownDeadline);
                }
            }
        }

        if let Err(e) = self.store.mark_instance_stopped(&self.instance_id) {
            tracing::warn!(error = %e, "Failed to mark instance stopped");
        }
        match self
            .store
            .delete_old_stopped_instances(self.config.instance_cleanup_age, self.config.instance_cleanup_keep)
        {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "Deleted old stopped executor instances"),
            Err(e) => tracing::warn!(error = %e, "Failed to delete old stopped instances"),
        }

        let mut running = self.running.write().unwrap_or_else(|e| e.into_inner());
        *running = false;
        tracing::info!(instance_id = %self.instance_id, "Executor stopped");
        Ok(())
    }

    /// Work loop: heartbeat, poll for ready work, claim, execute.
    async fn work_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {
                    // Re-check: the tick may race a stop that fired while an
                    // execution was draining.
                    if stop.is_cancelled() {
                        return;
                    }
                    if let Err(e) = self.store.update_heartbeat(&self.instance_id) {
                        tracing::error!(error = %e, "Failed to update heartbeat");
                    }
                    if let Err(e) = self.process_next_issue(&stop).await {
                        tracing::error!(error = %e, "Error processing issue");
                    }
                }
            }
        }
    }

    async fn process_next_issue(self: &Arc<Self>, stop: &CancellationToken) -> Result<()> {
        let issues = self.store.get_ready_work(&WorkFilter { limit: 1 })?;
        let Some(issue) = issues.into_iter().next() else {
            return Ok(());
        };

        match self.store.claim_issue(&issue.id, &self.instance_id) {
            Ok(()) => {}
            // Another executor won the race; routine in a fleet.
            Err(OverseerError::ClaimRaceLost { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        self.execute_issue(issue, stop).await
    }

    /// Watchdog loop. The oracle check runs on a throwaway task so a slow
    /// call never blocks shutdown; the stop signal abandons it mid-flight.
    async fn watchdog_loop(self: Arc<Self>, stop: CancellationToken) {
        let Some(analyzer) = self.analyzer.clone() else {
            return;
        };
        let mut interval = tokio::time::interval(self.config.watchdog.check_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {
                    if stop.is_cancelled() {
                        return;
                    }
                    let this = self.clone();
                    let analyzer = analyzer.clone();
                    let check = tokio::spawn(async move {
                        this.check_for_anomalies(&analyzer).await
                    });
                    tokio::select! {
                        result = check => {
                            if let Ok(Err(e)) = result {
                                tracing::warn!(error = %e, "Watchdog anomaly check failed");
                            }
                        }
                        _ = stop.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn check_for_anomalies(&self, analyzer: &Analyzer) -> Result<()> {
        let report = analyzer.detect_anomalies().await?;
        if !report.detected {
            return Ok(());
        }

        if !watchdog::should_intervene(&self.config.watchdog, &report) {
            if self.config.watchdog.enable_anomaly_logging {
                tracing::info!(
                    anomaly_type = %report.anomaly_type,
                    severity = %report.severity,
                    confidence = report.confidence,
                    "Anomaly below intervention threshold"
                );
                let event = AgentEvent::new(
                    EventType::WatchdogAlert,
                    EventSeverity::Warning,
                    format!(
                        "Anomaly below threshold: {} (severity={}, confidence={:.2})",
                        report.anomaly_type, report.severity, report.confidence
                    ),
                )
                .from_executor(self.instance_id.clone())
                .with_data(serde_json::json!({
                    "anomaly_type": report.anomaly_type,
                    "severity": report.severity,
                    "confidence": report.confidence,
                }));
                let event = match &report.issue_id {
                    Some(id) => event.for_issue(id.clone()),
                    None => event,
                };
                if let Err(e) = self.store.store_agent_event(&event) {
                    tracing::warn!(error = %e, "Failed to store watchdog alert");
                }
            }
            return Ok(());
        }

        let outcome = self.intervention.intervene(&report).await?;
        if !outcome.dampened {
            tracing::warn!(
                anomaly_type = %report.anomaly_type,
                escalation = ?outcome.escalation_issue_id,
                cancelled_agent = outcome.cancelled_agent,
                "Watchdog intervention completed"
            );
        }
        Ok(())
    }
}
