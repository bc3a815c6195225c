//! Parent-side tunnel dispatcher.
//!
//! Accepts child connections on a local socket (or serves any duplex stream
//! directly via [`TunnelServer::serve_connection`]), frames inbound NDJSON
//! lines, and classifies each as telemetry or prompt request:
//!
//! - console/output/structured telemetry is relayed to the [`TelemetrySink`]
//!   unchanged, in strict arrival order per connection;
//! - a valid `prompt_request` is additionally handed to the configured
//!   [`PromptRequestHandler`] together with a [`PromptResponder`] bound to
//!   the originating connection, so a response can never be routed to the
//!   wrong child;
//! - malformed or schema-invalid lines are logged and dropped — they never
//!   kill the connection task.
//!
//! Handler failures are caught and converted into an explicit error
//! `prompt_response`, so the remote caller always receives a settled outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::telemetry::TelemetrySink;
use crate::tunnel::codec::LineCodec;
use crate::tunnel::protocol::{
    validate_prompt_request, LogLevel, OutputStream, PromptRequest, ServerTunnelMessage,
    StructuredMessage, TunnelMessage,
};
use crate::{AppError, Result};

// ── Prompt handler seam ───────────────────────────────────────────────────────

/// Pluggable consumer of validated prompt requests.
///
/// The handler signals completion through the responder, not a return value:
/// the dispatcher stays free to process other connections while a human
/// decides.  Returning `Err` (instead of responding) makes the dispatcher
/// synthesize an error response for the remote caller.
pub trait PromptRequestHandler: Send + Sync {
    /// Service one validated prompt request.
    ///
    /// # Errors
    ///
    /// Returns an error when the prompt could not be shown at all; the
    /// dispatcher converts it into an error `prompt_response`.
    fn handle(
        &self,
        request: PromptRequest,
        responder: PromptResponder,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Response channel bound to the specific connection a prompt request
/// arrived on.
///
/// The binding is carried in the type rather than captured implicitly: the
/// dispatcher may serve many concurrent children, and a response written
/// through this handle can only ever reach the connection that originated
/// the request.
#[derive(Debug, Clone)]
pub struct PromptResponder {
    connection_id: String,
    request_id: String,
    response_tx: mpsc::Sender<ServerTunnelMessage>,
}

impl PromptResponder {
    /// Identifier of the connection this responder is bound to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Correlation id of the request this responder answers.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Answer the request with a success value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tunnel` when the connection closed before the
    /// response could be written.
    pub async fn respond_value(&self, value: Value) -> Result<()> {
        self.respond(Some(value), None).await
    }

    /// Answer the request with an error description.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tunnel` when the connection closed before the
    /// response could be written.
    pub async fn respond_error(&self, message: impl Into<String>) -> Result<()> {
        self.respond(None, Some(message.into())).await
    }

    async fn respond(&self, value: Option<Value>, error: Option<String>) -> Result<()> {
        let message = ServerTunnelMessage::PromptResponse {
            request_id: self.request_id.clone(),
            value,
            error,
        };
        self.response_tx.send(message).await.map_err(|_| {
            AppError::Tunnel(format!(
                "connection {} closed before prompt response could be written",
                self.connection_id
            ))
        })
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Parent-side tunnel dispatcher serving one or more child connections.
pub struct TunnelServer {
    sink: Arc<dyn TelemetrySink>,
    handler: Option<Arc<dyn PromptRequestHandler>>,
}

impl TunnelServer {
    /// Create a dispatcher that relays telemetry into `sink`.
    ///
    /// Without a prompt handler, prompt requests are relayed to telemetry
    /// only (visible but unanswered).
    #[must_use]
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            handler: None,
        }
    }

    /// Attach a prompt-request handler.
    #[must_use]
    pub fn with_prompt_handler(mut self, handler: Arc<dyn PromptRequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Listen on a namespaced local socket, spawning one task per accepted
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tunnel` when the listener cannot be created.
    pub fn listen(
        self: &Arc<Self>,
        socket_name: &str,
        cancel: &CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let listener_name = socket_name
            .to_owned()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| {
                AppError::Tunnel(format!("invalid tunnel socket name '{socket_name}': {err}"))
            })?;
        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Tunnel(format!("failed to create tunnel listener: {err}")))?;

        info!(socket_name, "tunnel server listening");

        let server = Arc::clone(self);
        let cancel = cancel.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("tunnel server shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => {
                            let connection_id = Uuid::new_v4().to_string();
                            let server = Arc::clone(&server);
                            let conn_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                server.serve_connection(connection_id, stream, conn_cancel).await;
                            });
                        }
                        Err(err) => {
                            warn!(%err, "tunnel accept failed");
                        }
                    }
                }
            }
        }))
    }

    /// Serve one duplex connection until it closes or `cancel` fires.
    ///
    /// Lines are dispatched in strict arrival order; prompt handling runs in
    /// spawned tasks so a slow human answer never stalls telemetry arriving
    /// behind it on the same socket.
    pub async fn serve_connection<S>(
        &self,
        connection_id: String,
        stream: S,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let span = info_span!("tunnel_conn", connection_id = %connection_id);
        async {
            let (read_half, write_half) = tokio::io::split(stream);
            let (response_tx, response_rx) = mpsc::channel::<ServerTunnelMessage>(16);
            let writer = tokio::spawn(run_response_writer(write_half, response_rx, cancel.clone()));

            let mut framed = FramedRead::new(read_half, LineCodec::new());
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,

                    item = framed.next() => match item {
                        None => {
                            debug!("tunnel connection closed");
                            break;
                        }
                        Some(Err(AppError::Tunnel(msg))) => {
                            warn!(error = msg.as_str(), "tunnel framing error, skipping line");
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "tunnel read error, closing connection");
                            break;
                        }
                        Some(Ok(line)) => self.dispatch_line(&connection_id, &line, &response_tx),
                    }
                }
            }

            // Close the response channel so the writer drains and exits.
            drop(response_tx);
            let _ = writer.await;
        }
        .instrument(span)
        .await;
    }

    /// Classify and dispatch one inbound line.
    ///
    /// Malformed lines are logged and dropped; the connection survives.
    fn dispatch_line(
        &self,
        connection_id: &str,
        line: &str,
        response_tx: &mpsc::Sender<ServerTunnelMessage>,
    ) {
        if line.trim().is_empty() {
            return;
        }
        let message: TunnelMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id, error = %err, "malformed tunnel message, dropped");
                return;
            }
        };

        match message {
            TunnelMessage::Log { args } => self.sink.console(LogLevel::Log, &args),
            TunnelMessage::Error { args } => self.sink.console(LogLevel::Error, &args),
            TunnelMessage::Warn { args } => self.sink.console(LogLevel::Warn, &args),
            TunnelMessage::Debug { args } => self.sink.console(LogLevel::Debug, &args),
            TunnelMessage::Stdout { data } => self.sink.output(OutputStream::Stdout, &data),
            TunnelMessage::Stderr { data } => self.sink.output(OutputStream::Stderr, &data),
            TunnelMessage::Structured { message } => {
                // Telemetry relay comes first so every prompt request is
                // visible even when a handler later rejects or answers it.
                self.sink.structured(&message);
                if let StructuredMessage::PromptRequest(request) = message {
                    self.dispatch_prompt_request(connection_id, request, response_tx);
                }
            }
        }
    }

    /// Validate and hand a prompt request to the configured handler.
    fn dispatch_prompt_request(
        &self,
        connection_id: &str,
        request: PromptRequest,
        response_tx: &mpsc::Sender<ServerTunnelMessage>,
    ) {
        let Some(handler) = &self.handler else {
            debug!(
                connection_id,
                request_id = %request.request_id,
                "no prompt handler configured, request relayed to telemetry only"
            );
            return;
        };

        if let Err(err) = validate_prompt_request(&request) {
            warn!(connection_id, error = %err, "invalid prompt request, dropped");
            return;
        }

        let handler = Arc::clone(handler);
        let responder = PromptResponder {
            connection_id: connection_id.to_owned(),
            request_id: request.request_id.clone(),
            response_tx: response_tx.clone(),
        };
        let span = info_span!(
            "prompt_request",
            connection_id = %responder.connection_id,
            request_id = %responder.request_id,
        );
        tokio::spawn(
            async move {
                let error_responder = responder.clone();
                if let Err(err) = handler.handle(request, responder).await {
                    // The remote caller must still settle; synthesize an
                    // error response in the handler's place.
                    warn!(error = %err, "prompt handler failed");
                    if let Err(send_err) = error_responder.respond_error(err.to_string()).await {
                        warn!(error = %send_err, "failed to deliver synthesized error response");
                    }
                }
            }
            .instrument(span),
        );
    }
}

// ── Background writer ─────────────────────────────────────────────────────────

/// Per-connection writer task: serialize responses and write NDJSON lines.
async fn run_response_writer<W>(
    mut write_half: W,
    mut response_rx: mpsc::Receiver<ServerTunnelMessage>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            message = response_rx.recv() => {
                let Some(message) = message else { break };
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize tunnel response");
                        continue;
                    }
                };
                line.push('\n');
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    warn!(error = %err, "tunnel response write failed, closing writer");
                    break;
                }
            }
        }
    }
}
