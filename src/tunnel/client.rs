//! Child-side tunnel adapter.
//!
//! Owns one duplex stream to the parent orchestrator.  Outbound traffic
//! (console logs, raw output, structured telemetry, prompt requests) is
//! serialized to NDJSON lines by a writer task; a reader task parses inbound
//! [`ServerTunnelMessage`] lines and settles pending prompt requests through
//! the correlation table.
//!
//! Liveness contract: no pending prompt request survives connection teardown.
//! Whether the stream closes, errors, or [`TunnelClient::destroy`] is called,
//! every outstanding request is rejected with [`AppError::ConnectionLost`]
//! before teardown completes — a suspended caller is never left hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tunnel::codec::LineCodec;
use crate::tunnel::protocol::{PromptRequest, ServerTunnelMessage, StructuredMessage, TunnelMessage};
use crate::{AppError, Result};

/// Outcome delivered through a pending prompt oneshot.
type PromptOutcome = Result<Value>;

/// Correlation table mapping `request_id` to its pending oneshot sender.
///
/// Owned exclusively by one [`TunnelClient`]; every entry is removed exactly
/// once — on matching response, on timeout, on connection loss, or on
/// teardown — and removal settles the oneshot exactly once.
type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<PromptOutcome>>>>;

/// Client-side duplex adapter over one tunnel connection.
#[derive(Debug)]
pub struct TunnelClient {
    outbound_tx: mpsc::Sender<String>,
    pending: PendingTable,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Attach to a duplex stream and start the background reader and writer.
    ///
    /// The stream is typically a connected local socket or a subprocess stdio
    /// pair; tests use [`tokio::io::duplex`].
    pub fn connect<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(run_writer(
            write_half,
            outbound_rx,
            Arc::clone(&pending),
            cancel.clone(),
        ));
        let reader = tokio::spawn(run_reader(read_half, Arc::clone(&pending), cancel.clone()));

        Self {
            outbound_tx,
            pending,
            cancel,
            destroyed: AtomicBool::new(false),
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    /// Whether the underlying connection has closed or the adapter was
    /// destroyed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.destroyed.load(Ordering::SeqCst)
    }

    /// Serialize `message` to one JSON line and enqueue it for writing.
    ///
    /// Fails fast when the connection is closed or the adapter destroyed, so
    /// callers needing reliability (prompt requests) surface transport
    /// failure immediately instead of hanging.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tunnel` when serialization fails or the connection
    /// is no longer writable.
    pub async fn send(&self, message: &TunnelMessage) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Tunnel("tunnel connection is closed".into()));
        }
        let line = serde_json::to_string(message)
            .map_err(|e| AppError::Tunnel(format!("failed to serialize outbound message: {e}")))?;
        self.outbound_tx
            .send(line)
            .await
            .map_err(|_| AppError::Tunnel("tunnel connection is closed".into()))
    }

    /// Send a prompt request and await its correlated response.
    ///
    /// Registers the request in the pending table, sends it as a structured
    /// tunnel message, then suspends until the parent answers.  With
    /// `timeout`, a timer races the response; on expiry the entry is removed
    /// and `AppError::PromptTimeout` is returned.  Without a timeout the call
    /// waits indefinitely — a human may need unbounded time to respond, so no
    /// implicit default is applied.
    ///
    /// Concurrent calls are independent: each request has its own
    /// `request_id` and pending entry, with no ordering constraint between
    /// them.
    ///
    /// # Errors
    ///
    /// - `AppError::Tunnel` — the request could not be written.
    /// - `AppError::PromptTimeout` — `timeout` elapsed first.
    /// - `AppError::PromptFailed` — the parent answered with an error.
    /// - `AppError::ConnectionLost` — the connection closed or the adapter
    ///   was torn down while the request was pending.
    pub async fn send_prompt_request(
        &self,
        request: PromptRequest,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel::<PromptOutcome>();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(request_id.clone(), tx);
        }

        let message = TunnelMessage::Structured {
            message: StructuredMessage::PromptRequest(request),
        };
        if let Err(err) = self.send(&message).await {
            // The request never left the process; unregister it.
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        let outcome = match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.pending.lock().await.remove(&request_id);
                    return Err(AppError::PromptTimeout(format!(
                        "prompt request {request_id} timed out after {duration:?}"
                    )));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(settled) => settled,
            Err(_dropped) => Err(AppError::ConnectionLost(format!(
                "tunnel torn down while prompt request {request_id} was pending"
            ))),
        }
    }

    /// Tear down the adapter: reject all pending requests, stop the
    /// background tasks, and close the connection.
    ///
    /// Idempotent — repeated calls are no-ops and never double-settle an
    /// already-settled request.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        reject_all(&self.pending, "tunnel client destroyed").await;
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for TunnelClient {
    /// Stop the background tasks when the adapter is dropped without an
    /// explicit [`destroy`](Self::destroy).  Dropping the pending table
    /// drops its oneshot senders, which rejects any still-suspended callers.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Writer task: drain serialized lines from the channel onto the stream.
async fn run_writer<W>(
    mut write_half: W,
    mut outbound_rx: mpsc::Receiver<String>,
    pending: PendingTable,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            line = outbound_rx.recv() => {
                let Some(mut line) = line else { break };
                line.push('\n');
                if let Err(err) = write_half.write_all(line.as_bytes()).await {
                    warn!(error = %err, "tunnel client: write failed, closing");
                    reject_all(&pending, "tunnel write failed").await;
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// Reader task: frame inbound lines, parse [`ServerTunnelMessage`]s, and
/// settle matching pending entries.
async fn run_reader<R>(read_half: R, pending: PendingTable, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(read_half, LineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            item = framed.next() => match item {
                None => {
                    debug!("tunnel client: connection closed by peer");
                    reject_all(&pending, "connection closed").await;
                    cancel.cancel();
                    break;
                }
                Some(Err(AppError::Tunnel(msg))) => {
                    // Oversized frame — drop it, keep the connection.
                    warn!(error = msg.as_str(), "tunnel client: framing error, skipping line");
                }
                Some(Err(err)) => {
                    warn!(error = %err, "tunnel client: read error, closing");
                    reject_all(&pending, "connection error").await;
                    cancel.cancel();
                    break;
                }
                Some(Ok(line)) => handle_inbound_line(&line, &pending).await,
            }
        }
    }
}

/// Parse one inbound line and settle the matching pending request.
///
/// Responses whose `request_id` has no pending entry (already timed out,
/// already torn down) are ignored; malformed lines are logged and dropped.
async fn handle_inbound_line(line: &str, pending: &PendingTable) {
    if line.trim().is_empty() {
        return;
    }
    let message: ServerTunnelMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "tunnel client: malformed inbound line, skipping");
            return;
        }
    };

    match message {
        ServerTunnelMessage::PromptResponse {
            request_id,
            value,
            error,
        } => {
            let sender = pending.lock().await.remove(&request_id);
            let Some(sender) = sender else {
                debug!(request_id, "tunnel client: response for unknown request, ignoring");
                return;
            };
            let outcome = match error {
                Some(message) => Err(AppError::PromptFailed(message)),
                None => Ok(value.unwrap_or(Value::Null)),
            };
            // The receiver may have been dropped by a racing timeout; either
            // way the entry settles exactly once.
            let _ = sender.send(outcome);
        }
    }
}

/// Drain the pending table, rejecting every entry with a connection-lost
/// error carrying `reason`.
async fn reject_all(pending: &PendingTable, reason: &str) {
    let drained: Vec<(String, oneshot::Sender<PromptOutcome>)> =
        pending.lock().await.drain().collect();
    for (request_id, sender) in drained {
        let _ = sender.send(Err(AppError::ConnectionLost(format!(
            "{reason} while prompt request {request_id} was pending"
        ))));
    }
}
