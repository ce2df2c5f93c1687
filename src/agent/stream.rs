//! Parser for the agent's streaming JSON output.
//!
//! The agent writes one JSON object per stdout line while it works. Three
//! shapes matter: progress events (persisted for the watchdog), `discovery`
//! lines (candidate follow-up issues), and a terminal `result` line that,
//! together with the exit code, decides success. Non-JSON lines are plain
//! log output and are ignored.

use serde_json::Value;

use crate::events::{EventSeverity, EventType};
use crate::issue::DiscoveredIssue;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event {
        event_type: EventType,
        severity: EventSeverity,
        message: String,
        data: Value,
    },
    Discovery(DiscoveredIssue),
    Terminal {
        success: bool,
        summary: String,
    },
}

/// Parse one stdout line. Returns `None` for non-JSON output and for JSON
/// that carries no `type` field.
pub fn parse_line(line: &str) -> Option<StreamItem> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let event_type = value.get("type")?.as_str()?.to_string();

    match event_type.as_str() {
        "discovery" => {
            let discovery: DiscoveredIssue = serde_json::from_value(value).ok()?;
            if discovery.title.is_empty() {
                return None;
            }
            Some(StreamItem::Discovery(discovery))
        }
        "result" => Some(StreamItem::Terminal {
            success: value
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            summary: value
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }),
        other => {
            let severity = value
                .get("severity")
                .and_then(Value::as_str)
                .and_then(EventSeverity::parse)
                .unwrap_or(EventSeverity::Info);
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(other)
                .to_string();
            let mut data = value.get("data").cloned().unwrap_or(Value::Null);
            // Preserve agent-specific types the executor does not enumerate.
            let event_type = EventType::parse(other).unwrap_or_else(|| {
                if data.is_null() {
                    data = serde_json::json!({ "agent_event_type": other });
                } else if let Some(map) = data.as_object_mut() {
                    map.insert(
                        "agent_event_type".to_string(),
                        Value::String(other.to_string()),
                    );
                }
                EventType::AgentProgress
            });
            Some(StreamItem::Event {
                event_type,
                severity,
                message,
                data,
            })
        }
    }
}
