//! Parent-side servicing of tunneled prompt requests.
//!
//! Maps a declarative [`PromptRequest`] onto the [`PromptFrontend`]
//! primitives, racing an optional timeout, and reports the outcome through
//! the dispatcher's [`PromptResponder`].  Completion is signaled via the
//! responder rather than a return value so the dispatcher stays free to
//! process other connections while a human decides.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::prompt::frontend::PromptFrontend;
use crate::tunnel::protocol::{PromptConfig, PromptRequest, PromptType};
use crate::tunnel::server::{PromptRequestHandler, PromptResponder};
use crate::Result;

/// Prompt handler backed by an interactive frontend.
///
/// A terminal can only show one prompt at a time, so concurrent requests
/// (possibly from different child connections) queue FIFO on an internal
/// lock; the dispatcher itself stays concurrent.
pub struct InteractivePromptHandler {
    frontend: Arc<dyn PromptFrontend>,
    terminal_gate: Mutex<()>,
}

impl InteractivePromptHandler {
    /// Create a handler rendering prompts through `frontend`.
    #[must_use]
    pub fn new(frontend: Arc<dyn PromptFrontend>) -> Self {
        Self {
            frontend,
            terminal_gate: Mutex::new(()),
        }
    }
}

impl PromptRequestHandler for InteractivePromptHandler {
    fn handle(
        &self,
        request: PromptRequest,
        responder: PromptResponder,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _gate = self.terminal_gate.lock().await;

            let timeout = request.timeout_ms.map(Duration::from_millis);
            let prompt = run_prompt(self.frontend.as_ref(), request.prompt_type, &request.config);

            let outcome = match timeout {
                Some(duration) => match tokio::time::timeout(duration, prompt).await {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        // The prompt future is dropped here, cancelling the
                        // pending UI read.
                        debug!(
                            request_id = %request.request_id,
                            timeout_ms = %duration.as_millis(),
                            "prompt timed out"
                        );
                        return responder
                            .respond_error(format!(
                                "prompt timed out after {}ms",
                                duration.as_millis()
                            ))
                            .await;
                    }
                },
                None => prompt.await,
            };

            match outcome {
                Ok(value) => responder.respond_value(value).await,
                Err(err) => responder.respond_error(err.to_string()).await,
            }
        })
    }
}

/// Invoke the frontend primitive matching `prompt_type` and normalize the
/// result to a JSON value.
async fn run_prompt(
    frontend: &dyn PromptFrontend,
    prompt_type: PromptType,
    config: &PromptConfig,
) -> Result<Value> {
    match prompt_type {
        PromptType::Input => frontend.input(config).await.map(Value::String),
        PromptType::Confirm => frontend.confirm(config).await.map(Value::Bool),
        PromptType::Select => frontend.select(config).await,
        PromptType::Checkbox => frontend.checkbox(config).await.map(Value::Array),
    }
}
