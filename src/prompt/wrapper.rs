//! Call-site facade over interactive prompts.
//!
//! A [`PromptScope`] is the execution context a call site prompts through.
//! It is constructed explicitly and passed explicitly — never a process
//! global — so two unrelated orchestrations in one process cannot cross-talk.
//!
//! Per call the scope picks one of two paths:
//!
//! - **tunnel mode** — a [`TunnelClient`] is attached: the prompt is
//!   serialized as a `prompt_request` and the call suspends until the parent
//!   answers, times out, or the connection is lost;
//! - **direct mode** — no tunnel: the same prompt description is relayed to
//!   the telemetry sink for visibility, then the local frontend renders it.
//!
//! Call sites are written once against this facade and behave identically
//! whether or not they run inside a tunneled subagent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::prompt::frontend::PromptFrontend;
use crate::telemetry::TelemetrySink;
use crate::tunnel::client::TunnelClient;
use crate::tunnel::protocol::{
    PromptChoice, PromptConfig, PromptRequest, PromptType, StructuredMessage,
};
use crate::{AppError, Result};

// ── Per-primitive options ─────────────────────────────────────────────────────

/// Options for a yes/no confirmation prompt.
#[derive(Debug, Clone, Default)]
pub struct ConfirmOptions {
    /// Prompt message text.
    pub message: String,
    /// Default answer taken on empty input.
    pub default: Option<bool>,
    /// Optional timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl ConfirmOptions {
    /// Options with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Options for a free-text input prompt.
#[derive(Debug, Clone, Default)]
pub struct InputOptions {
    /// Prompt message text.
    pub message: String,
    /// Default value taken on empty input.
    pub default: Option<String>,
    /// Human-readable validation hint shown with the prompt.
    pub validation_hint: Option<String>,
    /// Optional timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl InputOptions {
    /// Options with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Options for a single-selection prompt.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Prompt message text.
    pub message: String,
    /// Ordered choice list.
    pub choices: Vec<PromptChoice>,
    /// UI page size hint.
    pub page_size: Option<u32>,
    /// Optional timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl SelectOptions {
    /// Options with a message and choices.
    #[must_use]
    pub fn new(message: impl Into<String>, choices: Vec<PromptChoice>) -> Self {
        Self {
            message: message.into(),
            choices,
            ..Self::default()
        }
    }
}

/// Options for a multi-selection prompt.
#[derive(Debug, Clone, Default)]
pub struct CheckboxOptions {
    /// Prompt message text.
    pub message: String,
    /// Ordered choice list; `checked` entries start selected.
    pub choices: Vec<PromptChoice>,
    /// UI page size hint.
    pub page_size: Option<u32>,
    /// Optional timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl CheckboxOptions {
    /// Options with a message and choices.
    #[must_use]
    pub fn new(message: impl Into<String>, choices: Vec<PromptChoice>) -> Self {
        Self {
            message: message.into(),
            choices,
            ..Self::default()
        }
    }
}

// ── Scope ─────────────────────────────────────────────────────────────────────

/// Execution context for prompting: the ambient transport made explicit.
pub struct PromptScope {
    tunnel: Option<Arc<TunnelClient>>,
    frontend: Arc<dyn PromptFrontend>,
    sink: Arc<dyn TelemetrySink>,
}

impl PromptScope {
    /// Scope for code running inside a tunneled subagent.
    #[must_use]
    pub fn tunneled(
        tunnel: Arc<TunnelClient>,
        frontend: Arc<dyn PromptFrontend>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            tunnel: Some(tunnel),
            frontend,
            sink,
        }
    }

    /// Scope for code running with direct terminal access.
    #[must_use]
    pub fn direct(frontend: Arc<dyn PromptFrontend>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            tunnel: None,
            frontend,
            sink,
        }
    }

    /// Whether prompts from this scope travel over a tunnel.
    #[must_use]
    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Ask a yes/no question.
    ///
    /// # Errors
    ///
    /// Propagates transport, timeout, and frontend errors with their kind
    /// intact; see [`AppError`].
    pub async fn confirm(&self, options: ConfirmOptions) -> Result<bool> {
        let config = PromptConfig {
            message: options.message,
            default: options.default.map(Value::Bool),
            ..PromptConfig::default()
        };
        let request = PromptRequest::new(PromptType::Confirm, config, timeout_ms(options.timeout));
        match &self.tunnel {
            Some(client) => {
                let value = client.send_prompt_request(request, options.timeout).await?;
                value.as_bool().ok_or_else(|| {
                    AppError::PromptFailed(format!("expected boolean prompt response, got {value}"))
                })
            }
            None => {
                self.relay_direct(&request);
                race_timeout(options.timeout, self.frontend.confirm(&request.config)).await
            }
        }
    }

    /// Ask a yes/no question, answering `fallback` on a genuine timeout.
    ///
    /// The fallback applies **only** to [`AppError::PromptTimeout`].  A lost
    /// connection or failed write propagates: silently approving a sensitive
    /// action after a transport failure is a safety hazard, not graceful
    /// degradation.
    ///
    /// # Errors
    ///
    /// Any non-timeout error from [`confirm`](Self::confirm).
    pub async fn confirm_or_default(&self, options: ConfirmOptions, fallback: bool) -> Result<bool> {
        match self.confirm(options).await {
            Ok(answer) => Ok(answer),
            Err(err) if err.is_timeout() => Ok(fallback),
            Err(err) => Err(err),
        }
    }

    /// Ask for a line of free text.
    ///
    /// # Errors
    ///
    /// Propagates transport, timeout, and frontend errors with their kind
    /// intact.
    pub async fn input(&self, options: InputOptions) -> Result<String> {
        let config = PromptConfig {
            message: options.message,
            default: options.default.map(Value::String),
            validation_hint: options.validation_hint,
            ..PromptConfig::default()
        };
        let request = PromptRequest::new(PromptType::Input, config, timeout_ms(options.timeout));
        match &self.tunnel {
            Some(client) => {
                let value = client.send_prompt_request(request, options.timeout).await?;
                value.as_str().map(ToOwned::to_owned).ok_or_else(|| {
                    AppError::PromptFailed(format!("expected string prompt response, got {value}"))
                })
            }
            None => {
                self.relay_direct(&request);
                race_timeout(options.timeout, self.frontend.input(&request.config)).await
            }
        }
    }

    /// Ask for one choice out of an ordered list; resolves to the chosen
    /// choice's value.
    ///
    /// # Errors
    ///
    /// Propagates transport, timeout, and frontend errors with their kind
    /// intact.
    pub async fn select(&self, options: SelectOptions) -> Result<Value> {
        let config = PromptConfig {
            message: options.message,
            choices: Some(options.choices),
            page_size: options.page_size,
            ..PromptConfig::default()
        };
        let request = PromptRequest::new(PromptType::Select, config, timeout_ms(options.timeout));
        match &self.tunnel {
            Some(client) => client.send_prompt_request(request, options.timeout).await,
            None => {
                self.relay_direct(&request);
                race_timeout(options.timeout, self.frontend.select(&request.config)).await
            }
        }
    }

    /// Ask for any subset of an ordered list; resolves to the checked
    /// choices' values.
    ///
    /// # Errors
    ///
    /// Propagates transport, timeout, and frontend errors with their kind
    /// intact.
    pub async fn checkbox(&self, options: CheckboxOptions) -> Result<Vec<Value>> {
        let config = PromptConfig {
            message: options.message,
            choices: Some(options.choices),
            page_size: options.page_size,
            ..PromptConfig::default()
        };
        let request = PromptRequest::new(PromptType::Checkbox, config, timeout_ms(options.timeout));
        match &self.tunnel {
            Some(client) => {
                let value = client.send_prompt_request(request, options.timeout).await?;
                value.as_array().cloned().ok_or_else(|| {
                    AppError::PromptFailed(format!("expected array prompt response, got {value}"))
                })
            }
            None => {
                self.relay_direct(&request);
                race_timeout(options.timeout, self.frontend.checkbox(&request.config)).await
            }
        }
    }

    /// In direct mode the prompt never crosses the tunnel, so relay its
    /// description to the sink for the same visibility a tunneled prompt
    /// gets.
    fn relay_direct(&self, request: &PromptRequest) {
        self.sink
            .structured(&StructuredMessage::PromptRequest(request.clone()));
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Convert an optional timeout to wire milliseconds.
fn timeout_ms(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Race a direct-mode prompt against the caller's timeout, classifying
/// expiry as [`AppError::PromptTimeout`] exactly like the tunneled path.
async fn race_timeout<T>(
    timeout: Option<Duration>,
    prompt: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, prompt).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(AppError::PromptTimeout(format!(
                "prompt timed out after {duration:?}"
            ))),
        },
        None => prompt.await,
    }
}
