//! Wire message shapes for the parent↔child tunnel.
//!
//! One JSON object per line, discriminated by a `type` field in both
//! directions:
//!
//! | Direction       | Shape                                                   |
//! |-----------------|---------------------------------------------------------|
//! | child → parent  | `{"type":"log"\|"error"\|"warn"\|"debug","args":[…]}`   |
//! | child → parent  | `{"type":"stdout"\|"stderr","data":"…"}`                |
//! | child → parent  | `{"type":"structured","message":{…}}`                   |
//! | parent → child  | `{"type":"prompt_response","requestId":"…",…}`          |
//!
//! Every dispatch site matches exhaustively over these unions; adding a
//! variant is a compile error until each consumer handles it.  Unknown or
//! malformed inbound lines are dropped at the parsing boundary, never fatal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{AppError, Result};

// ── Console / output tags ─────────────────────────────────────────────────────

/// Console log level tag carried by the `log`/`error`/`warn`/`debug` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Ordinary console output.
    Log,
    /// Error-level output.
    Error,
    /// Warning-level output.
    Warn,
    /// Debug-level output.
    Debug,
}

/// Raw passthrough stream tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Child stdout passthrough.
    Stdout,
    /// Child stderr passthrough.
    Stderr,
}

// ── Client → server messages ──────────────────────────────────────────────────

/// Message sent from a child process to the parent over the tunnel.
///
/// Exactly one variant tag per message.  Inbound lines that do not parse into
/// one of these variants are logged and dropped by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelMessage {
    /// Console record at `log` level.
    Log {
        /// Ordered serializable argument values.
        args: Vec<Value>,
    },
    /// Console record at `error` level.
    Error {
        /// Ordered serializable argument values.
        args: Vec<Value>,
    },
    /// Console record at `warn` level.
    Warn {
        /// Ordered serializable argument values.
        args: Vec<Value>,
    },
    /// Console record at `debug` level.
    Debug {
        /// Ordered serializable argument values.
        args: Vec<Value>,
    },
    /// Raw stdout passthrough.
    Stdout {
        /// Captured output text.
        data: String,
    },
    /// Raw stderr passthrough.
    Stderr {
        /// Captured output text.
        data: String,
    },
    /// Typed structured telemetry envelope.
    Structured {
        /// The telemetry payload.
        message: StructuredMessage,
    },
}

impl TunnelMessage {
    /// Build a console record for `level`.
    #[must_use]
    pub fn console(level: LogLevel, args: Vec<Value>) -> Self {
        match level {
            LogLevel::Log => Self::Log { args },
            LogLevel::Error => Self::Error { args },
            LogLevel::Warn => Self::Warn { args },
            LogLevel::Debug => Self::Debug { args },
        }
    }

    /// Build a raw output passthrough record for `stream`.
    #[must_use]
    pub fn passthrough(stream: OutputStream, data: String) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout { data },
            OutputStream::Stderr => Self::Stderr { data },
        }
    }
}

// ── Structured telemetry ──────────────────────────────────────────────────────

/// Final status of one agent turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// The turn ran to completion.
    Completed,
    /// The turn reported failure.
    Failed,
    /// The turn was interrupted (inactivity or explicit cancel).
    Interrupted,
}

/// Typed telemetry message relayed from child to parent.
///
/// Every identifier field (`session_id`, `turn_id`, `request_id`,
/// `tool_use_id`) is a string; ids generated by this crate are UUID v4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StructuredMessage {
    /// An agent session was created.
    SessionStart {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Session identifier.
        session_id: String,
        /// Agent binary or model name.
        agent: String,
        /// Workspace the session operates in.
        workspace_root: String,
    },
    /// An agent session ended and its resources were released.
    SessionEnd {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Session identifier.
        session_id: String,
    },
    /// A turn started (or restarted on retry).
    TurnStart {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Session identifier.
        session_id: String,
        /// 1-based attempt number within the session.
        attempt: u32,
    },
    /// A turn reached a terminal status.
    TurnCompleted {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Session identifier.
        session_id: String,
        /// Turn identifier assigned by the agent.
        turn_id: String,
        /// Terminal status.
        status: TurnStatus,
        /// Final result message, when the agent produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Assistant-visible response text.
    AssistantMessage {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Message text.
        text: String,
    },
    /// Model reasoning summary.
    Reasoning {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Reasoning text.
        text: String,
    },
    /// A tool invocation began.
    ToolUseStart {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Tool invocation identifier.
        tool_use_id: String,
        /// Tool name.
        tool_name: String,
    },
    /// A tool invocation finished.
    ToolUseEnd {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Tool invocation identifier.
        tool_use_id: String,
        /// Whether the tool reported success.
        ok: bool,
    },
    /// The agent executed a shell command.
    CommandExecution {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Command line as reported by the agent.
        command: String,
        /// Exit code, when the command has finished.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// The agent created, modified, or deleted a file.
    FileEdit {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Path relative to the workspace root.
        path: String,
        /// Edit kind (`create`, `modify`, `delete`).
        kind: String,
    },
    /// Plan/step progress snapshot.
    PlanProgress {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Turn identifier.
        turn_id: String,
        /// Completed step count.
        completed: u32,
        /// Total step count.
        total: u32,
        /// Optional progress note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// The agent reported an error condition.
    AgentError {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Error description.
        message: String,
    },
    /// A retry of the current turn was scheduled.
    RetryScheduled {
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Session identifier.
        session_id: String,
        /// Attempt number about to run.
        attempt: u32,
        /// Why the previous attempt did not count.
        reason: String,
    },
    /// A child asks the parent to show an interactive prompt.
    PromptRequest(PromptRequest),
}

impl StructuredMessage {
    /// The wire tag of this message kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session_start",
            Self::SessionEnd { .. } => "session_end",
            Self::TurnStart { .. } => "turn_start",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolUseStart { .. } => "tool_use_start",
            Self::ToolUseEnd { .. } => "tool_use_end",
            Self::CommandExecution { .. } => "command_execution",
            Self::FileEdit { .. } => "file_edit",
            Self::PlanProgress { .. } => "plan_progress",
            Self::AgentError { .. } => "agent_error",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::PromptRequest(_) => "prompt_request",
        }
    }

    /// Build a `session_start` event stamped now.
    #[must_use]
    pub fn session_start(session_id: &str, agent: &str, workspace_root: &str) -> Self {
        Self::SessionStart {
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
            agent: agent.to_owned(),
            workspace_root: workspace_root.to_owned(),
        }
    }

    /// Build a `session_end` event stamped now.
    #[must_use]
    pub fn session_end(session_id: &str) -> Self {
        Self::SessionEnd {
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
        }
    }

    /// Build a `turn_start` event stamped now.
    #[must_use]
    pub fn turn_start(session_id: &str, attempt: u32) -> Self {
        Self::TurnStart {
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
            attempt,
        }
    }

    /// Build a `turn_completed` event stamped now.
    #[must_use]
    pub fn turn_completed(
        session_id: &str,
        turn_id: &str,
        status: TurnStatus,
        message: Option<String>,
    ) -> Self {
        Self::TurnCompleted {
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
            turn_id: turn_id.to_owned(),
            status,
            message,
        }
    }

    /// Build a `retry_scheduled` event stamped now.
    #[must_use]
    pub fn retry_scheduled(session_id: &str, attempt: u32, reason: &str) -> Self {
        Self::RetryScheduled {
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
            attempt,
            reason: reason.to_owned(),
        }
    }

    /// Build an `agent_error` event stamped now.
    #[must_use]
    pub fn agent_error(message: &str) -> Self {
        Self::AgentError {
            timestamp: Utc::now(),
            message: message.to_owned(),
        }
    }
}

// ── Prompt request ────────────────────────────────────────────────────────────

/// Interactive prompt primitive requested by a child.
///
/// Free-text "editor" and incremental "search" prompts require raw terminal
/// control that cannot be proxied over a message channel; they are
/// unrepresentable here by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptType {
    /// Free-text single-line input.
    Input,
    /// Yes/no confirmation.
    Confirm,
    /// Single selection from an ordered choice list.
    Select,
    /// Multi-selection from an ordered choice list.
    Checkbox,
}

/// One entry of a select/checkbox choice list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptChoice {
    /// Human-readable label.
    pub name: String,
    /// Value returned when this choice is picked.  Constrained to JSON
    /// primitives (string, number, boolean) by [`validate_prompt_request`].
    pub value: Value,
    /// Optional longer description shown alongside the label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the choice starts checked (checkbox prompts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
}

impl PromptChoice {
    /// Build a choice with just a label and a value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
            checked: None,
        }
    }
}

/// Declarative prompt description carried by a [`PromptRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    /// Prompt message text.
    pub message: String,
    /// Optional default value (type depends on the prompt kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Ordered choice list (select/checkbox prompts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<PromptChoice>>,
    /// UI page size hint for long choice lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Human-readable validation hint shown with input prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_hint: Option<String>,
}

/// A child's request for an interactive prompt, immutable once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    /// Opaque unique correlation id, generated per request.
    pub request_id: String,
    /// Which prompt primitive to render.
    pub prompt_type: PromptType,
    /// Declarative prompt description.
    #[serde(rename = "promptConfig")]
    pub config: PromptConfig,
    /// Optional server-side timeout in milliseconds.  Absent means the
    /// prompt waits indefinitely for the human.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PromptRequest {
    /// Build a request with a freshly generated `request_id`.
    #[must_use]
    pub fn new(prompt_type: PromptType, config: PromptConfig, timeout_ms: Option<u64>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            prompt_type,
            config,
            timeout_ms,
        }
    }
}

// ── Server → client messages ──────────────────────────────────────────────────

/// Message sent from the parent back to a child over the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerTunnelMessage {
    /// Result of a previously forwarded [`PromptRequest`], correlated by
    /// `request_id`.  Exactly one of `value`/`error` is meaningful.
    PromptResponse {
        /// Correlation id of the originating request.
        request_id: String,
        /// Prompt result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        /// Failure description (timeout, cancellation, handler error).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Whether `value` is a JSON primitive (string, number, or boolean).
#[must_use]
pub fn is_json_primitive(value: &Value) -> bool {
    value.is_string() || value.is_number() || value.is_boolean()
}

/// Validate an inbound prompt request field-by-field before dispatch.
///
/// The prompt type is already constrained by the [`PromptType`] enum; this
/// checks everything serde cannot express: non-empty correlation id,
/// non-empty message, primitive choice values, a present choice list for
/// select/checkbox prompts, and a positive timeout.
///
/// # Errors
///
/// Returns `AppError::Tunnel` describing the first violation.  Invalid
/// requests are logged and dropped by the dispatcher, never dispatched.
pub fn validate_prompt_request(request: &PromptRequest) -> Result<()> {
    if request.request_id.trim().is_empty() {
        return Err(AppError::Tunnel("prompt request has empty requestId".into()));
    }
    if request.config.message.trim().is_empty() {
        return Err(AppError::Tunnel(format!(
            "prompt request {} has empty message",
            request.request_id
        )));
    }
    if let Some(timeout_ms) = request.timeout_ms {
        if timeout_ms == 0 {
            return Err(AppError::Tunnel(format!(
                "prompt request {} has zero timeoutMs",
                request.request_id
            )));
        }
    }
    if let Some(choices) = &request.config.choices {
        for (index, choice) in choices.iter().enumerate() {
            if choice.name.trim().is_empty() {
                return Err(AppError::Tunnel(format!(
                    "prompt request {}: choice {index} has empty name",
                    request.request_id
                )));
            }
            if !is_json_primitive(&choice.value) {
                return Err(AppError::Tunnel(format!(
                    "prompt request {}: choice {index} value must be a JSON primitive",
                    request.request_id
                )));
            }
        }
    }
    match request.prompt_type {
        PromptType::Select | PromptType::Checkbox => {
            let has_choices = request
                .config
                .choices
                .as_ref()
                .is_some_and(|choices| !choices.is_empty());
            if !has_choices {
                return Err(AppError::Tunnel(format!(
                    "prompt request {}: {:?} prompt requires a non-empty choice list",
                    request.request_id, request.prompt_type
                )));
            }
        }
        PromptType::Input | PromptType::Confirm => {}
    }
    Ok(())
}
