//! Per-issue execution pipeline: assess, sandbox, spawn, wait, process.
//!
//! Every phase persists its state transition before the side effect that
//! depends on it, and checks the stop token between suspension points so a
//! shutdown mid-execution still releases the claim. Store writes in the
//! cleanup paths are synchronous, so they complete even when the ambient
//! operation was cancelled.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{self, AgentRequest};
use crate::error::Result;
use crate::events::{AgentEvent, EventSeverity, EventType};
use crate::executor::context::{build_prompt, ContextGatherer};
use crate::executor::Executor;
use crate::issue::{ExecutionState, Issue, IssueUpdate, Status};
use crate::oracle::Assessment;

impl Executor {
    /// Drive one claimed issue through the state machine. Errors inside the
    /// pipeline release the claim and are not propagated to the work loop.
    pub(crate) async fn execute_issue(
        self: &Arc<Self>,
        issue: Issue,
        stop: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(issue_id = %issue.id, title = %issue.title, "Executing issue");

        self.monitor.start_execution(&issue.id, &self.instance_id);
        self.log_event(
            EventType::IssueClaimed,
            EventSeverity::Info,
            Some(&issue.id),
            format!("Issue {} claimed by executor {}", issue.id, self.instance_id),
            json!({ "issue_title": issue.title }),
        );
        self.monitor.record_event(&issue.id, "issue_claimed");

        // Entered unconditionally, even with supervision disabled, so the
        // machine's shape is invariant across configurations.
        if let Err(e) = self
            .store
            .update_execution_state(&issue.id, ExecutionState::Assessing)
        {
            tracing::warn!(error = %e, "Failed to persist assessing state");
        }
        self.monitor.record_state(&issue.id, ExecutionState::Assessing);

        if self.supervisor.is_some() {
            if !self.run_assessment(&issue, stop).await {
                // Cancelled during assessment; claim already released.
                self.monitor.end_execution(&issue.id);
                return Ok(());
            }
        } else {
            tracing::debug!("Skipping assessment (supervision disabled)");
        }

        // Sandbox creation failure is never fatal; fall back to the shared
        // workspace.
        let mut workdir: PathBuf = self.config.working_dir.clone();
        let mut sandbox = None;
        if let Some(manager) = &self.sandboxes {
            match manager
                .create(&issue.id, &issue.title, Some(&self.config.default_branch))
                .await
            {
                Ok(sb) => {
                    workdir = sb.path.clone();
                    sandbox = Some(sb);
                }
                Err(e) => {
                    tracing::warn!(
                        issue_id = %issue.id,
                        error = %e,
                        "Failed to create sandbox (continuing in main workspace)"
                    );
                }
            }
        }

        let completed = if stop.is_cancelled() {
            self.finish_with_error(&issue.id, "Execution cancelled before spawning agent");
            false
        } else {
            if let Err(e) = self
                .store
                .update_execution_state(&issue.id, ExecutionState::Executing)
            {
                tracing::warn!(error = %e, "Failed to persist executing state");
            }
            self.monitor.record_state(&issue.id, ExecutionState::Executing);

            let agent_token = stop.child_token();
            self.intervention.register_agent(&issue.id, agent_token.clone());
            let outcome = self
                .run_agent_and_process(&issue, &workdir, &agent_token)
                .await;
            self.intervention.clear_agent(&issue.id);
            agent_token.cancel();
            outcome
        };

        if let (Some(manager), Some(sb)) = (&self.sandboxes, &sandbox) {
            if let Err(e) = manager.cleanup(sb, !completed).await {
                tracing::warn!(issue_id = %issue.id, error = %e, "Failed to clean up sandbox");
            }
        }
        self.monitor.end_execution(&issue.id);
        Ok(())
    }

    /// Returns false when the executor is shutting down and the claim was
    /// released; oracle failures degrade to "no assessment".
    async fn run_assessment(self: &Arc<Self>, issue: &Issue, stop: &CancellationToken) -> bool {
        let Some(supervisor) = self.supervisor.clone() else {
            return true;
        };

        self.log_event(
            EventType::AssessmentStarted,
            EventSeverity::Info,
            Some(&issue.id),
            format!("Starting assessment for issue {}", issue.id),
            json!({}),
        );

        let assessment = tokio::select! {
            result = supervisor.assess_issue(issue, "") => result,
            _ = stop.cancelled() => {
                self.finish_with_error(&issue.id, "Execution cancelled during assessment");
                return false;
            }
        };

        match assessment {
            Ok(assessment) => {
                if let Err(e) =
                    self.store
                        .add_comment(&issue.id, "supervisor", &format_assessment(&assessment))
                {
                    tracing::warn!(error = %e, "Failed to add assessment comment");
                }
                self.log_event(
                    EventType::AssessmentCompleted,
                    EventSeverity::Info,
                    Some(&issue.id),
                    format!("Assessment completed for issue {}", issue.id),
                    json!({
                        "success": true,
                        "strategy": assessment.strategy,
                        "confidence": assessment.confidence,
                        "estimated_effort": assessment.estimated_effort,
                        "steps_count": assessment.steps.len(),
                        "risks_count": assessment.risks.len(),
                    }),
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Assessment failed (continuing without)");
                self.log_event(
                    EventType::AssessmentCompleted,
                    EventSeverity::Error,
                    Some(&issue.id),
                    format!("Assessment failed: {e}"),
                    json!({ "success": false, "error": e.to_string() }),
                );
            }
        }
        true
    }

    /// Spawn the agent, wait for it, then run results processing. Returns
    /// true only when the issue reached `completed`.
    async fn run_agent_and_process(
        self: &Arc<Self>,
        issue: &Issue,
        workdir: &PathBuf,
        agent_token: &CancellationToken,
    ) -> bool {
        let gatherer = ContextGatherer::new(self.store.clone());
        let prompt_ctx = match gatherer.gather(issue) {
            Ok(ctx) => ctx,
            Err(e) => {
                self.log_event(
                    EventType::AgentSpawned,
                    EventSeverity::Error,
                    Some(&issue.id),
                    format!("Failed to gather context: {e}"),
                    json!({ "success": false, "error": e.to_string() }),
                );
                self.finish_with_error(&issue.id, &format!("Failed to gather context: {e}"));
                return false;
            }
        };
        let prompt = build_prompt(&prompt_ctx);

        let agent_id = Uuid::new_v4().to_string();
        self.log_event(
            EventType::AgentSpawned,
            EventSeverity::Info,
            Some(&issue.id),
            format!("Agent spawned for issue {}", issue.id),
            json!({ "success": true, "agent_id": agent_id, "workdir": workdir.display().to_string() }),
        );
        self.monitor.record_event(&issue.id, "agent_spawned");

        let request = AgentRequest {
            issue,
            prompt: &prompt,
            workdir,
            agent_id: &agent_id,
            executor_id: &self.instance_id,
        };
        let result = match agent::spawn_and_wait(
            &self.config.agent,
            request,
            &self.store,
            &self.monitor,
            agent_token,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                self.log_event(
                    EventType::AgentCompleted,
                    EventSeverity::Error,
                    Some(&issue.id),
                    format!("Agent execution failed: {e}"),
                    json!({ "success": false, "error": e.to_string() }),
                );
                self.finish_with_error(&issue.id, &format!("Agent execution failed: {e}"));
                return false;
            }
        };

        if result.cancelled || result.timed_out {
            let reason = if result.timed_out {
                format!(
                    "Agent timed out after {}s",
                    self.config.agent.timeout.as_secs()
                )
            } else {
                "Agent aborted by cancellation".to_string()
            };
            self.log_event(
                EventType::AgentCompleted,
                EventSeverity::Error,
                Some(&issue.id),
                reason.clone(),
                json!({ "success": false, "cancelled": result.cancelled, "timed_out": result.timed_out }),
            );
            self.finish_with_error(&issue.id, &reason);
            return false;
        }

        self.log_event(
            EventType::AgentCompleted,
            EventSeverity::Info,
            Some(&issue.id),
            format!("Agent completed execution for issue {}", issue.id),
            json!({
                "success": result.success,
                "exit_code": result.exit_code,
                "duration_ms": result.duration.as_millis() as u64,
                "output_lines": result.output_lines,
            }),
        );

        if result.exit_code != Some(0) {
            let message = format!(
                "Agent exited with status {:?}: {}",
                result.exit_code, result.summary
            );
            self.finish_with_error(&issue.id, &message);
            return false;
        }

        self.process_results(issue, workdir, &result).await
    }

    /// Results processing: analyze discoveries, run gates, commit the outcome.
    async fn process_results(
        self: &Arc<Self>,
        issue: &Issue,
        workdir: &PathBuf,
        result: &agent::AgentResult,
    ) -> bool {
        self.log_event(
            EventType::ResultsProcessingStarted,
            EventSeverity::Info,
            Some(&issue.id),
            format!("Starting results processing for issue {}", issue.id),
            json!({}),
        );

        if let Err(e) = self
            .store
            .update_execution_state(&issue.id, ExecutionState::Analyzing)
        {
            tracing::warn!(error = %e, "Failed to persist analyzing state");
        }
        self.monitor.record_state(&issue.id, ExecutionState::Analyzing);

        let discovered = self.file_discoveries(issue, result.discoveries.clone()).await;

        if let Err(e) = self
            .store
            .update_execution_state(&issue.id, ExecutionState::Gates)
        {
            tracing::warn!(error = %e, "Failed to persist gates state");
        }
        self.monitor.record_state(&issue.id, ExecutionState::Gates);

        let gates_passed = if self.config.enable_quality_gates && !self.gates.is_empty() {
            match self.gates.run(workdir).await {
                Ok(outcome) => {
                    let severity = if outcome.passed {
                        EventSeverity::Info
                    } else {
                        EventSeverity::Error
                    };
                    self.log_event(
                        EventType::GatesCompleted,
                        severity,
                        Some(&issue.id),
                        format!(
                            "Quality gates {}",
                            if outcome.passed { "passed" } else { "failed" }
                        ),
                        json!({
                            "passed": outcome.passed,
                            "failed": outcome.failed_names(),
                        }),
                    );
                    outcome.passed
                }
                Err(e) => {
                    self.log_event(
                        EventType::GatesCompleted,
                        EventSeverity::Error,
                        Some(&issue.id),
                        format!("Quality gate run failed: {e}"),
                        json!({ "passed": false, "error": e.to_string() }),
                    );
                    false
                }
            }
        } else {
            true
        };

        if let Err(e) = self
            .store
            .update_execution_state(&issue.id, ExecutionState::Committing)
        {
            tracing::warn!(error = %e, "Failed to persist committing state");
        }
        self.monitor.record_state(&issue.id, ExecutionState::Committing);

        let completed = result.success && gates_passed;
        if completed {
            if let Err(e) = self.store.complete_and_close(
                &issue.id,
                &self.instance_id,
                &result.summary,
                result.exit_code,
            ) {
                tracing::error!(error = %e, "Failed to commit completed issue");
                self.finish_with_error(&issue.id, &format!("Failed to commit outcome: {e}"));
                return false;
            }
            self.monitor.record_state(&issue.id, ExecutionState::Completed);
        }

        let severity = if completed {
            EventSeverity::Info
        } else {
            EventSeverity::Error
        };
        self.log_event(
            EventType::ResultsProcessingCompleted,
            severity,
            Some(&issue.id),
            format!(
                "Results processing completed for issue {} (completed={completed})",
                issue.id
            ),
            json!({
                "success": completed,
                "completed": completed,
                "gates_passed": gates_passed,
                "discovered_issues": discovered,
            }),
        );

        if !completed {
            let reason = if !result.success {
                format!("Agent reported failure: {}", result.summary)
            } else {
                "Quality gates failed".to_string()
            };
            self.finish_with_error(&issue.id, &reason);
        }
        completed
    }

    /// Deduplicate and create discovered issues; returns how many were filed.
    async fn file_discoveries(
        self: &Arc<Self>,
        issue: &Issue,
        discoveries: Vec<crate::issue::DiscoveredIssue>,
    ) -> usize {
        if discoveries.is_empty() {
            return 0;
        }

        let to_create = match &self.dedup {
            Some(dedup) => match dedup.filter_new(&issue.id, discoveries.clone()).await {
                Ok(kept) => kept,
                Err(e) => {
                    tracing::warn!(error = %e, "Deduplication failed (filing all candidates)");
                    discoveries
                }
            },
            None => discoveries,
        };

        let mut created = 0usize;
        for candidate in to_create {
            let mut new_issue = Issue::new(candidate.title.clone());
            new_issue.description = format!(
                "{}\n\nDiscovered while executing {}.",
                candidate.description, issue.id
            );
            new_issue.priority = candidate.priority.clamp(0, 4);
            new_issue.issue_type = candidate.issue_type;
            match self.store.create_issue(&mut new_issue, &self.instance_id) {
                Ok(()) => {
                    for label in &candidate.labels {
                        if let Err(e) = self.store.add_label(&new_issue.id, label) {
                            tracing::warn!(error = %e, "Failed to label discovered issue");
                        }
                    }
                    tracing::info!(
                        issue_id = %new_issue.id,
                        title = %new_issue.title,
                        "Filed discovered issue"
                    );
                    created += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, title = %candidate.title, "Failed to create discovered issue");
                }
            }
        }
        created
    }

    /// Release a failed issue: reopen for retry, or block it once the
    /// consecutive-failure ceiling is reached.
    pub(crate) fn finish_with_error(&self, issue_id: &str, error_text: &str) {
        self.log_event(
            EventType::Error,
            EventSeverity::Error,
            Some(issue_id),
            error_text.to_string(),
            json!({}),
        );

        let consecutive = match self.store.get_execution_history(issue_id) {
            Ok(history) => trailing_failures(&history),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read execution history (reopening)");
                0
            }
        };

        if consecutive >= self.config.max_consecutive_failures {
            tracing::warn!(
                issue_id,
                consecutive,
                "Consecutive failure ceiling reached, blocking issue"
            );
            if let Err(e) = self.store.release_issue(issue_id) {
                tracing::warn!(error = %e, "Failed to release issue");
            }
            if let Err(e) = self.store.update_issue(
                issue_id,
                &IssueUpdate {
                    status: Some(Status::Blocked),
                    ..Default::default()
                },
                &self.instance_id,
            ) {
                tracing::warn!(error = %e, "Failed to block issue");
            }
            let comment = format!(
                "Blocked after {consecutive} consecutive execution failures. Last error: {error_text}"
            );
            if let Err(e) = self.store.add_comment(issue_id, &self.instance_id, &comment) {
                tracing::warn!(error = %e, "Failed to comment on blocked issue");
            }
            return;
        }

        if let Err(e) = self.store.release_and_reopen(issue_id, error_text) {
            tracing::warn!(error = %e, "Failed to release and reopen issue");
        }
    }

    pub(crate) fn log_event(
        &self,
        event_type: EventType,
        severity: EventSeverity,
        issue_id: Option<&str>,
        message: String,
        data: serde_json::Value,
    ) {
        let mut event = AgentEvent::new(event_type, severity, message)
            .from_executor(self.instance_id.clone())
            .with_data(data);
        if let Some(issue_id) = issue_id {
            event.issue_id = Some(issue_id.to_string());
        }
        if let Err(e) = self.store.store_agent_event(&event) {
            tracing::warn!(error = %e, "Failed to store agent event");
        }
    }
}

/// Count trailing completed failures; an intervening success resets the run.
fn trailing_failures(history: &[crate::issue::ExecutionAttempt]) -> usize {
    let mut count = 0;
    for attempt in history.iter().rev() {
        match attempt.success {
            Some(false) => count += 1,
            Some(true) => break,
            None => continue,
        }
    }
    count
}

fn format_assessment(assessment: &Assessment) -> String {
    let mut comment = String::new();
    let _ = writeln!(comment, "**Assessment**");
    let _ = writeln!(comment, "\nStrategy: {}", assessment.strategy);
    let _ = writeln!(comment, "Confidence: {:.0}%", assessment.confidence * 100.0);
    let _ = writeln!(comment, "Estimated effort: {}", assessment.estimated_effort);
    if !assessment.steps.is_empty() {
        let _ = writeln!(comment, "\nSteps:");
        for (i, step) in assessment.steps.iter().enumerate() {
            let _ = writeln!(comment, "{}. {}", i + 1, step);
        }
    }
    if !assessment.risks.is_empty() {
        let _ = writeln!(comment, "\nRisks:");
        for risk in &assessment.risks {
            let _ = writeln!(comment, "- {risk}");
        }
    }
    comment
}
