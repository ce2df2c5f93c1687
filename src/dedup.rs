//! Deduplication of discovered issues.
//!
//! Candidates from one agent run are compared against recent tracker issues
//! by the oracle, in batches. Persistent oracle failure falls back to the
//! configured fail-open/fail-closed policy. Every decision is logged as a
//! `[DEDUP]` event so suppressions can be audited later.

use std::sync::Arc;

use serde_json::json;

use crate::config::DeduplicationConfig;
use crate::error::{OverseerError, Result};
use crate::events::{AgentEvent, EventSeverity, EventType};
use crate::issue::{DiscoveredIssue, Issue, IssueFilter, Status};
use crate::oracle::{DuplicateVerdict, Supervisor};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Not a duplicate; file it.
    Create,
    /// Duplicate of an existing issue.
    DuplicateOf(String),
    /// Duplicate of an earlier candidate in the same batch.
    DuplicateOfCandidate(usize),
    /// Title too short to compare reliably; filed as-is.
    SkippedShortTitle,
    /// Oracle kept failing; policy decided.
    FailOpen,
    FailClosed,
}

pub struct Deduplicator {
    supervisor: Arc<dyn Supervisor>,
    store: Arc<Store>,
    config: DeduplicationConfig,
    executor_id: String,
}

impl Deduplicator {
    pub fn new(
        supervisor: Arc<dyn Supervisor>,
        store: Arc<Store>,
        config: DeduplicationConfig,
        executor_id: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            store,
            config,
            executor_id: executor_id.into(),
        }
    }

    /// Filter one run's candidates down to the ones that should be created.
    /// `source_issue` is the issue whose execution discovered them, used for
    /// decision logging only.
    pub async fn filter_new(
        &self,
        source_issue: &str,
        candidates: Vec<DiscoveredIssue>,
    ) -> Result<Vec<DiscoveredIssue>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let existing = self.comparison_set()?;
        let mut kept: Vec<DiscoveredIssue> = Vec::new();

        // Short titles bypass comparison entirely.
        let mut comparable: Vec<DiscoveredIssue> = Vec::new();
        for candidate in candidates {
            if candidate.title.len() < self.config.min_title_length {
                self.log_decision(source_issue, &candidate, &DedupDecision::SkippedShortTitle);
                kept.push(candidate);
            } else {
                comparable.push(candidate);
            }
        }

        for batch in comparable.chunks(self.config.batch_size) {
            match self.judge_with_retries(batch, &existing).await {
                Ok(verdicts) => {
                    let decisions = apply_verdicts(batch, &verdicts, &self.config);
                    for (candidate, decision) in batch.iter().zip(decisions) {
                        self.log_decision(source_issue, candidate, &decision);
                        if decision == DedupDecision::Create {
                            kept.push(candidate.clone());
                        }
                    }
                }
                Err(e) => {
                    let decision = if self.config.fail_open {
                        DedupDecision::FailOpen
                    } else {
                        DedupDecision::FailClosed
                    };
                    tracing::warn!(
                        error = %e,
                        fail_open = self.config.fail_open,
                        "Dedup oracle failed after retries"
                    );
                    for candidate in batch {
                        self.log_decision(source_issue, candidate, &decision);
                        if self.config.fail_open {
                            kept.push(candidate.clone());
                        }
                    }
                }
            }
        }

        Ok(kept)
    }

    fn comparison_set(&self) -> Result<Vec<Issue>> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(self.config.lookback_days as i64);
        let issues = self.store.search_issues(
            "",
            &IssueFilter {
                created_after: Some(cutoff),
                limit: Some(self.config.max_candidates),
                ..Default::default()
            },
        )?;
        Ok(if self.config.include_closed {
            issues
        } else {
            issues
                .into_iter()
                .filter(|i| i.status != Status::Closed)
                .collect()
        })
    }

    async fn judge_with_retries(
        &self,
        batch: &[DiscoveredIssue],
        existing: &[Issue],
    ) -> Result<Vec<DuplicateVerdict>> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            let call = self.supervisor.judge_duplicates(batch, existing);
            match tokio::time::timeout(self.config.timeout, call).await {
                Ok(Ok(verdicts)) => return Ok(verdicts),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "Dedup oracle call failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::warn!(attempt, "Dedup oracle call timed out");
                    last_err = Some(OverseerError::Oracle("dedup oracle timed out".into()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| OverseerError::Oracle("dedup oracle failed".into())))
    }

    fn log_decision(&self, source_issue: &str, candidate: &DiscoveredIssue, decision: &DedupDecision) {
        let (verdict, detail) = match decision {
            DedupDecision::Create => ("create", String::new()),
            DedupDecision::DuplicateOf(id) => ("duplicate", format!(" of {id}")),
            DedupDecision::DuplicateOfCandidate(idx) => {
                ("duplicate", format!(" of batch candidate #{idx}"))
            }
            DedupDecision::SkippedShortTitle => ("create", " (title too short to compare)".into()),
            DedupDecision::FailOpen => ("create", " (oracle failed, fail-open)".into()),
            DedupDecision::FailClosed => ("suppressed", " (oracle failed, fail-closed)".into()),
        };
        let event = AgentEvent::new(
            EventType::DedupDecision,
            EventSeverity::Info,
            format!("[DEDUP] {verdict}: \"{}\"{detail}", candidate.title),
        )
        .for_issue(source_issue.to_string())
        .from_executor(self.executor_id.clone())
        .with_data(json!({
            "candidate_title": candidate.title,
            "decision": verdict,
            "detail": detail.trim(),
        }));
        if let Err(e) = self.store.store_agent_event(&event) {
            tracing::warn!(error = %e, "Failed to store dedup decision event");
        }
    }
}

/// Turn oracle verdicts into per-candidate decisions. A verdict only counts
/// when its confidence clears the threshold; within-batch references must
/// point at an *earlier* candidate (and the feature must be enabled).
fn apply_verdicts(
    batch: &[DiscoveredIssue],
    verdicts: &[DuplicateVerdict],
    config: &DeduplicationConfig,
) -> Vec<DedupDecision> {
    let mut decisions = vec![DedupDecision::Create; batch.len()];
    for verdict in verdicts {
        let Some(slot) = decisions.get_mut(verdict.candidate_index) else {
            continue;
        };
        if verdict.confidence < config.confidence_threshold {
            continue;
        }
        if let Some(existing_id) = &verdict.duplicate_of {
            *slot = DedupDecision::DuplicateOf(existing_id.clone());
        } else if let Some(earlier) = verdict.duplicate_of_candidate {
            if config.within_batch && earlier < verdict.candidate_index {
                *slot = DedupDecision::DuplicateOfCandidate(earlier);
            }
        }
    }
    decisions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str) -> DiscoveredIssue {
        DiscoveredIssue {
            title: title.to_string(),
            description: String::new(),
            priority: 2,
            issue_type: Default::default(),
            labels: Vec::new(),
        }
    }

    fn verdict(index: usize, confidence: f64) -> DuplicateVerdict {
        DuplicateVerdict {
            candidate_index: index,
            duplicate_of: None,
            duplicate_of_candidate: None,
            confidence,
        }
    }

    #[test]
    fn low_confidence_verdicts_are_ignored() {
        let batch = vec![candidate("Something broke badly")];
        let mut v = verdict(0, 0.5);
        v.duplicate_of = Some("ov-1".into());
        let decisions = apply_verdicts(&batch, &[v], &DeduplicationConfig::default());
        assert_eq!(decisions, vec![DedupDecision::Create]);
    }

    #[test]
    fn within_batch_suppression_requires_earlier_index() {
        let batch = vec![
            candidate("Login 500 on submit"),
            candidate("Login 500 again on submit"),
        ];
        let mut v = verdict(1, 0.9);
        v.duplicate_of_candidate = Some(0);
        let decisions = apply_verdicts(&batch, &[v.clone()], &DeduplicationConfig::default());
        assert_eq!(decisions[1], DedupDecision::DuplicateOfCandidate(0));

        // Disabled feature keeps the candidate.
        let config = DeduplicationConfig {
            within_batch: false,
            ..Default::default()
        };
        let decisions = apply_verdicts(&batch, &[v], &config);
        assert_eq!(decisions[1], DedupDecision::Create);
    }

    #[test]
    fn forward_references_never_suppress() {
        let batch = vec![candidate("First finding here"), candidate("Second finding here")];
        let mut v = verdict(0, 0.95);
        v.duplicate_of_candidate = Some(1);
        let decisions = apply_verdicts(&batch, &[v], &DeduplicationConfig::default());
        assert_eq!(decisions[0], DedupDecision::Create);
    }
}
