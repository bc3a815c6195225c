//! Wire shapes of the external agent's request/response protocol.
//!
//! One JSON object per line over the agent's stdio.  Requests carry a
//! monotonic numeric `id`; the agent answers with `{"id", "result"}` or
//! `{"id", "error"}` and interleaves notifications (`{"method", "params"}`)
//! while a turn runs.
//!
//! # Known notifications
//!
//! | Method           | Maps to                       |
//! |------------------|-------------------------------|
//! | `turn/event`     | [`TurnEvent::Activity`]       |
//! | `turn/completed` | [`TurnEvent::Completed`]      |
//! | *(any other)*    | Skipped; logged at `DEBUG`    |

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tunnel::protocol::{StructuredMessage, TurnStatus};
use crate::{AppError, Result};

// ── Outbound requests ─────────────────────────────────────────────────────────

/// Request sent to the agent over its stdin.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    /// Monotonic correlation id.
    pub id: i64,
    /// Method name.
    pub method: String,
    /// Method-specific parameters.
    pub params: Value,
}

impl AgentRequest {
    /// The `initialize` handshake request.
    #[must_use]
    pub fn initialize(id: i64) -> Self {
        Self {
            id,
            method: "initialize".into(),
            params: json!({
                "clientInfo": {
                    "name": "agent-relay",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        }
    }

    /// The `session/create` request.
    #[must_use]
    pub fn session_create(id: i64, workspace_root: &Path) -> Self {
        Self {
            id,
            method: "session/create".into(),
            params: json!({ "cwd": workspace_root.to_string_lossy() }),
        }
    }

    /// The `turn/run` request starting one turn within a session.
    #[must_use]
    pub fn turn_run(id: i64, session_id: &str, prompt: &str) -> Self {
        Self {
            id,
            method: "turn/run".into(),
            params: json!({ "sessionId": session_id, "prompt": prompt }),
        }
    }

    /// The `turn/interrupt` request reclaiming an unresponsive turn.
    #[must_use]
    pub fn turn_interrupt(id: i64, session_id: &str, turn_id: &str) -> Self {
        Self {
            id,
            method: "turn/interrupt".into(),
            params: json!({ "sessionId": session_id, "turnId": turn_id }),
        }
    }
}

// ── Inbound classification ────────────────────────────────────────────────────

/// One inbound line from the agent, classified by shape.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// Successful response to a request.
    Response {
        /// Correlation id of the answered request.
        id: i64,
        /// Result payload.
        result: Value,
    },
    /// Error response to a request.
    Error {
        /// Correlation id of the answered request.
        id: i64,
        /// Error description.
        message: String,
    },
    /// Server-initiated notification.
    Notification {
        /// Method name.
        method: String,
        /// Method-specific payload.
        params: Value,
    },
}

/// Classify one raw line from the agent stream.
///
/// # Return value
///
/// - `Ok(Some(message))` — the line is a response, error, or notification.
/// - `Ok(None)` — the line is empty or JSON of an unrecognized shape.
/// - `Err(AppError::Agent("malformed json: …"))` — not valid JSON.
///
/// # Errors
///
/// Returns `AppError::Agent` only for non-JSON lines; unrecognized but valid
/// JSON is skipped, not fatal.
pub fn classify_inbound(line: &str) -> Result<Option<AgentMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| AppError::Agent(format!("malformed json: {e}")))?;

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return Ok(Some(AgentMessage::Notification {
            method: method.to_owned(),
            params,
        }));
    }

    let Some(id) = value.get("id").and_then(Value::as_i64) else {
        return Ok(None);
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), ToOwned::to_owned);
        return Ok(Some(AgentMessage::Error { id, message }));
    }

    let result = value.get("result").cloned().unwrap_or(Value::Null);
    Ok(Some(AgentMessage::Response { id, result }))
}

// ── Turn notifications ────────────────────────────────────────────────────────

/// Terminal report of one turn, carried by `turn/completed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompletion {
    /// Turn identifier assigned by the agent.
    pub turn_id: String,
    /// Terminal status.
    pub status: TurnStatus,
    /// Final result message, when the agent produced one.
    #[serde(default)]
    pub message: Option<String>,
}

/// A turn-scoped notification from the agent.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Progress telemetry to relay onward.
    Activity(StructuredMessage),
    /// The turn reached a terminal status.
    Completed(TurnCompletion),
}

/// Parse a notification into a turn event.
///
/// # Return value
///
/// - `Ok(Some(event))` — a recognized turn notification.
/// - `Ok(None)` — an unrelated method (skipped by the caller).
///
/// # Errors
///
/// Returns `AppError::Agent` when a recognized method carries malformed
/// parameters.
pub fn parse_turn_notification(method: &str, params: Value) -> Result<Option<TurnEvent>> {
    match method {
        "turn/event" => {
            let payload = params.get("message").cloned().ok_or_else(|| {
                AppError::Agent("missing required field: `message` in turn/event params".into())
            })?;
            let message: StructuredMessage = serde_json::from_value(payload)
                .map_err(|e| AppError::Agent(format!("malformed turn/event message: {e}")))?;
            Ok(Some(TurnEvent::Activity(message)))
        }
        "turn/completed" => {
            let completion: TurnCompletion = serde_json::from_value(params)
                .map_err(|e| AppError::Agent(format!("malformed turn/completed params: {e}")))?;
            Ok(Some(TurnEvent::Completed(completion)))
        }
        _ => Ok(None),
    }
}

// ── Response payloads ─────────────────────────────────────────────────────────

/// Result payload of `session/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// Session identifier assigned by the agent.
    pub session_id: String,
}

/// Result payload of `turn/run`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStarted {
    /// Turn identifier assigned by the agent.
    pub turn_id: String,
}
