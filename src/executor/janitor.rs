//! Janitor loops: stale-instance reclamation and event retention.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::EventRetentionConfig;
use crate::error::Result;
use crate::events::{AgentEvent, EventSeverity, EventType};
use crate::executor::Executor;

impl Executor {
    /// Stale-instance janitor: repeat the startup reclamation sweep, prune
    /// preserved failed sandboxes, and delete old stopped instance rows.
    /// The sweep runs on a throwaway task so shutdown is never blocked.
    pub(crate) async fn stale_cleanup_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        // The startup path already swept once; skip the immediate tick.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {
                    if stop.is_cancelled() {
                        return;
                    }
                    let this = self.clone();
                    let sweep = tokio::spawn(async move { this.run_stale_cleanup().await });
                    tokio::select! {
                        result = sweep => {
                            if let Ok(Err(e)) = result {
                                tracing::warn!(error = %e, "Stale-instance cleanup failed");
                            }
                        }
                        _ = stop.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn run_stale_cleanup(self: Arc<Self>) -> Result<()> {
        let cleaned = self
            .store
            .cleanup_stale_instances(self.config.stale_threshold)?;
        if cleaned > 0 {
            tracing::info!(
                cleaned,
                "Marked stale instances as crashed and released their claims"
            );
        }

        if let Some(sandboxes) = &self.sandboxes {
            if self.config.sandbox_retention_count > 0 {
                match sandboxes.prune_stale(self.config.sandbox_retention_count).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "Pruned stale sandboxes"),
                    Err(e) => tracing::warn!(error = %e, "Failed to prune stale sandboxes"),
                }
            }
        }

        match self.store.delete_old_stopped_instances(
            self.config.instance_cleanup_age,
            self.config.instance_cleanup_keep,
        ) {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, "Deleted old stopped executor instances"),
            Err(e) => tracing::warn!(error = %e, "Failed to delete old stopped instances"),
        }

        Ok(())
    }

    /// Event-retention janitor. Runs once immediately, then on its own
    /// (hour-scale) cadence. Disabled or invalid configuration stops the
    /// loop without affecting the rest of the executor.
    pub(crate) async fn event_retention_loop(self: Arc<Self>, stop: CancellationToken) {
        let retention = self.config.event_retention.clone();
        if let Err(e) = retention.validate() {
            tracing::error!(error = %e, "Invalid event retention config (cleanup disabled)");
            return;
        }
        if !retention.enabled {
            tracing::info!("Event retention cleanup disabled via configuration");
            return;
        }

        let cleanup_interval =
            Duration::from_secs(u64::from(retention.cleanup_interval_hours) * 3600);
        tracing::info!(
            interval_hours = retention.cleanup_interval_hours,
            retention_days = retention.retention_days,
            per_issue_limit = retention.per_issue_limit,
            global_limit = retention.global_limit,
            "Event retention cleanup started"
        );

        if let Err(e) = self.run_event_cleanup(&retention) {
            tracing::warn!(error = %e, "Initial event cleanup failed");
        }

        let mut interval = tokio::time::interval(cleanup_interval);
        interval.tick().await; // immediate run already happened
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {
                    if stop.is_cancelled() {
                        return;
                    }
                    if let Err(e) = self.run_event_cleanup(&retention) {
                        tracing::warn!(error = %e, "Event cleanup failed");
                    }
                }
            }
        }
    }

    /// One retention cycle: age-based, per-issue cap, then global cap, each
    /// batched, followed by optional compaction and a summary event.
    pub fn run_event_cleanup(&self, cfg: &EventRetentionConfig) -> Result<()> {
        let started = std::time::Instant::now();

        let time_based = match self.store.cleanup_events_by_age(
            cfg.retention_days,
            cfg.retention_critical_days,
            cfg.batch_size,
        ) {
            Ok(deleted) => deleted,
            Err(e) => {
                self.log_cleanup_summary(0, 0, 0, started, false, 0, Some(&e.to_string()));
                return Err(e);
            }
        };

        let per_issue = match self
            .store
            .cleanup_events_by_issue_limit(cfg.per_issue_limit, cfg.batch_size)
        {
            Ok(deleted) => deleted,
            Err(e) => {
                self.log_cleanup_summary(time_based, 0, 0, started, false, 0, Some(&e.to_string()));
                return Err(e);
            }
        };

        // Trigger the aggressive global sweep at 95% of the configured cap.
        let trigger = (cfg.global_limit as f64 * 0.95) as usize;
        let global = match self
            .store
            .cleanup_events_by_global_limit(trigger, cfg.batch_size)
        {
            Ok(deleted) => deleted,
            Err(e) => {
                self.log_cleanup_summary(
                    time_based,
                    per_issue,
                    0,
                    started,
                    false,
                    0,
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        };

        let total = time_based + per_issue + global;
        let mut vacuum_ran = false;
        if cfg.vacuum && total > 0 {
            match self.store.vacuum() {
                Ok(()) => vacuum_ran = true,
                Err(e) => tracing::warn!(error = %e, "VACUUM failed"),
            }
        }

        let remaining = match self.store.get_event_counts() {
            Ok(counts) => counts.total,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read event counts");
                0
            }
        };

        self.log_cleanup_summary(time_based, per_issue, global, started, vacuum_ran, remaining, None);

        if total > 0 || vacuum_ran {
            tracing::info!(
                total,
                time_based,
                per_issue,
                global,
                vacuum_ran,
                remaining,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Event cleanup cycle finished"
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_cleanup_summary(
        &self,
        time_based: usize,
        per_issue: usize,
        global: usize,
        started: std::time::Instant,
        vacuum_ran: bool,
        remaining: i64,
        error: Option<&str>,
    ) {
        let total = time_based + per_issue + global;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let success = error.is_none();

        let mut data = json!({
            "events_deleted": total,
            "time_based_deleted": time_based,
            "per_issue_deleted": per_issue,
            "global_limit_deleted": global,
            "processing_time_ms": elapsed_ms,
            "vacuum_ran": vacuum_ran,
            "events_remaining": remaining,
            "success": success,
        });
        if let Some(error) = error {
            data["error"] = json!(error);
        }

        let message = match error {
            None => format!("Event cleanup completed: deleted {total} events in {elapsed_ms}ms"),
            Some(error) => format!("Event cleanup failed: {error}"),
        };
        let severity = if success {
            EventSeverity::Info
        } else {
            EventSeverity::Error
        };

        // System-wide event: no parent issue.
        let event = AgentEvent::new(EventType::EventCleanupCompleted, severity, message)
            .from_executor(self.instance_id.clone())
            .with_data(data);
        if let Err(e) = self.store.store_agent_event(&event) {
            tracing::warn!(error = %e, "Failed to store cleanup summary event");
        }
    }
}
