//! Anomaly detection and intervention.
//!
//! Three pieces cooperate: the [`monitor`] keeps per-execution telemetry in
//! process, the [`analyzer`] turns a telemetry snapshot into an oracle
//! verdict, and the [`intervention`] controller reaches into a live
//! execution's cancellation tree when a verdict crosses the configured
//! threshold. The loop that drives them lives with the executor.

pub mod analyzer;
pub mod intervention;
pub mod monitor;

pub use analyzer::Analyzer;
pub use intervention::{InterventionController, InterventionOutcome, InterventionRecord};
pub use monitor::{ExecutionMonitor, ExecutionSnapshot};

use crate::config::WatchdogConfig;
use crate::oracle::AnomalyReport;

/// Threshold check: intervene only when both confidence and severity clear
/// the configured floor.
pub fn should_intervene(config: &WatchdogConfig, report: &AnomalyReport) -> bool {
    report.detected
        && report.confidence >= config.min_confidence
        && report.severity >= config.min_severity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::AnomalySeverity;

    fn report(severity: AnomalySeverity, confidence: f64) -> AnomalyReport {
        AnomalyReport {
            detected: true,
            anomaly_type: "test".into(),
            severity,
            confidence,
            recommended_action: String::new(),
            rationale: String::new(),
            issue_id: None,
        }
    }

    #[test]
    fn both_thresholds_must_clear() {
        let config = WatchdogConfig::default(); // min 0.8 confidence, high severity
        assert!(should_intervene(&config, &report(AnomalySeverity::High, 0.9)));
        assert!(should_intervene(&config, &report(AnomalySeverity::Critical, 0.8)));
        assert!(!should_intervene(&config, &report(AnomalySeverity::High, 0.5)));
        assert!(!should_intervene(&config, &report(AnomalySeverity::Medium, 0.99)));
        let mut undetected = report(AnomalySeverity::Critical, 1.0);
        undetected.detected = false;
        assert!(!should_intervene(&config, &undetected));
    }
}
