//! Anomaly detection: telemetry snapshot in, oracle verdict out.

use std::sync::Arc;

use crate::error::Result;
use crate::oracle::{AnomalyReport, Supervisor};
use crate::watchdog::monitor::ExecutionMonitor;

pub struct Analyzer {
    monitor: Arc<ExecutionMonitor>,
    supervisor: Arc<dyn Supervisor>,
}

impl Analyzer {
    pub fn new(monitor: Arc<ExecutionMonitor>, supervisor: Arc<dyn Supervisor>) -> Self {
        Self { monitor, supervisor }
    }

    /// One detection cycle. With no live executions there is nothing to
    /// judge, so the oracle is not consulted.
    pub async fn detect_anomalies(&self) -> Result<AnomalyReport> {
        let snapshots = self.monitor.snapshot();
        if snapshots.is_empty() {
            return Ok(AnomalyReport::none());
        }
        self.supervisor.detect_anomalies(&snapshots).await
    }
}
