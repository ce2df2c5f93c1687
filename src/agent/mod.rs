//! Coding-agent subprocess lifecycle.
//!
//! The agent receives the prompt on stdin and a working directory, emits
//! structured JSON events on stdout, and exits. Stream events are persisted
//! as they arrive so the watchdog sees progress in near real time; the
//! per-agent cancellation token (registered with the intervention controller
//! by the pipeline) and the configured timeout both kill the child.

pub mod stream;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{OverseerError, Result};
use crate::events::{AgentEvent, EventSeverity};
use crate::issue::{DiscoveredIssue, Issue};
use crate::store::Store;
use crate::watchdog::ExecutionMonitor;
use stream::StreamItem;

const OUTPUT_SAMPLE_LINES: usize = 50;

#[derive(Debug)]
pub struct AgentRequest<'a> {
    pub issue: &'a Issue,
    pub prompt: &'a str,
    pub workdir: &'a Path,
    pub agent_id: &'a str,
    pub executor_id: &'a str,
}

#[derive(Debug)]
pub struct AgentResult {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
    pub output_lines: usize,
    pub discoveries: Vec<DiscoveredIssue>,
    pub summary: String,
    pub output_sample: Vec<String>,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Spawn the agent and block until it exits, is cancelled, or times out.
pub async fn spawn_and_wait(
    config: &AgentConfig,
    request: AgentRequest<'_>,
    store: &Arc<Store>,
    monitor: &Arc<ExecutionMonitor>,
    cancel: &CancellationToken,
) -> Result<AgentResult> {
    let started = Instant::now();

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);
    if config.stream_json {
        cmd.arg("--stream-json");
    }
    cmd.current_dir(request.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| OverseerError::Agent(format!("spawn {}: {e}", config.program)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| OverseerError::Agent("agent stdin was not piped".into()))?;
    stdin
        .write_all(request.prompt.as_bytes())
        .await
        .map_err(|e| OverseerError::Agent(format!("write prompt: {e}")))?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OverseerError::Agent("agent stdout was not piped".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    let timeout = tokio::time::sleep(config.timeout);
    tokio::pin!(timeout);

    let mut output_lines = 0usize;
    let mut sample: Vec<String> = Vec::new();
    let mut discoveries: Vec<DiscoveredIssue> = Vec::new();
    let mut terminal: Option<(bool, String)> = None;
    let mut cancelled = false;
    let mut timed_out = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::warn!(issue_id = %request.issue.id, "Agent cancelled, killing subprocess");
                let _ = child.start_kill();
                cancelled = true;
                break;
            }
            _ = &mut timeout => {
                tracing::warn!(
                    issue_id = %request.issue.id,
                    timeout_secs = config.timeout.as_secs(),
                    "Agent timed out, killing subprocess"
                );
                let _ = child.start_kill();
                timed_out = true;
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Error reading agent output");
                        break;
                    }
                };
                output_lines += 1;
                if sample.len() >= OUTPUT_SAMPLE_LINES {
                    sample.remove(0);
                }
                sample.push(line.clone());

                match stream::parse_line(&line) {
                    Some(StreamItem::Event { event_type, severity, message, data }) => {
                        monitor.record_event(&request.issue.id, event_type.as_str());
                        let mut event = AgentEvent::new(event_type, severity, message)
                            .for_issue(request.issue.id.clone())
                            .from_executor(request.executor_id.to_string())
                            .with_data(data);
                        event.agent_id = Some(request.agent_id.to_string());
                        event.source_line = output_lines as i64;
                        if let Err(e) = store.store_agent_event(&event) {
                            tracing::warn!(error = %e, "Failed to store agent stream event");
                        }
                    }
                    Some(StreamItem::Discovery(discovery)) => {
                        monitor.record_event(&request.issue.id, "discovery");
                        discoveries.push(discovery);
                    }
                    Some(StreamItem::Terminal { success, summary }) => {
                        terminal = Some((success, summary));
                    }
                    None => {}
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| OverseerError::Agent(format!("wait: {e}")))?;
    let exit_code = status.code();
    let duration = started.elapsed();

    let (terminal_success, summary) = match terminal {
        Some((success, summary)) => (success, summary),
        None => (
            status.success(),
            format!("agent exited with status {exit_code:?}"),
        ),
    };
    let success = !cancelled && !timed_out && status.success() && terminal_success;

    if cancelled || timed_out {
        let reason = if cancelled { "cancelled" } else { "timed out" };
        let event = AgentEvent::new(
            crate::events::EventType::AgentProgress,
            EventSeverity::Warning,
            format!("Agent {reason} after {:.1}s", duration.as_secs_f64()),
        )
        .for_issue(request.issue.id.clone())
        .from_executor(request.executor_id.to_string());
        if let Err(e) = store.store_agent_event(&event) {
            tracing::warn!(error = %e, "Failed to store agent termination event");
        }
    }

    Ok(AgentResult {
        exit_code,
        success,
        duration,
        output_lines,
        discoveries,
        summary,
        output_sample: sample,
        cancelled,
        timed_out,
    })
}
