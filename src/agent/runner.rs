//! Agent session and turn state machine.
//!
//! One [`AgentSession`] owns one agent subprocess for its whole life:
//! `starting → initializing → ready → turn_running → … → done`.  Creation is
//! scoped acquisition — if the initialize handshake fails the subprocess is
//! killed before the error propagates, so a half-initialized child is never
//! leaked.  A session is created once; retries reuse it rather than
//! respawning.
//!
//! While a turn runs, every inbound protocol event re-arms an inactivity
//! timer: a short grace period before the first event, a longer sustained
//! window afterwards.  If the timer fires the turn is interrupted.  Failed
//! and interrupted turns retry up to a bounded attempt count, each retry
//! escalating the instruction text instead of repeating the identical
//! prompt.
//!
//! A completed turn whose final message claims work was done is additionally
//! checked against a before/after workspace fingerprint; only when the text
//! claims work AND the fingerprint is unchanged is the turn treated as
//! ineffective and retried.  Either signal alone is not sufficient —
//! directly-committing agents change the fingerprint, and quiet agents make
//! no claim.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use futures_util::StreamExt;
use regex::RegexSet;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::agent::protocol::{
    classify_inbound, parse_turn_notification, AgentMessage, AgentRequest, SessionCreated,
    TurnCompletion, TurnEvent, TurnStarted,
};
use crate::agent::spawner::{spawn_agent, SpawnConfig};
use crate::config::GlobalConfig;
use crate::telemetry::TelemetrySink;
use crate::tunnel::codec::LineCodec;
use crate::tunnel::protocol::{StructuredMessage, TurnStatus};
use crate::{AppError, Result};

// ── Configuration ────────────────────────────────────────────────────────────

/// Timing and retry settings for one session.
#[derive(Debug, Clone)]
pub struct TurnRunnerConfig {
    /// Maximum turn attempts within the session.
    pub max_attempts: u32,
    /// Deadline for the initialize / session-create handshake.
    pub handshake_timeout: Duration,
    /// Grace period before the first inbound event of a turn.
    pub initial_grace: Duration,
    /// Sustained inactivity window once a turn has produced events,
    /// re-armed on every event.  Always bounded: an unresponsive child must
    /// eventually be reclaimed.
    pub idle_timeout: Duration,
}

impl TurnRunnerConfig {
    /// Derive runner settings from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            handshake_timeout: config.startup_timeout(),
            initial_grace: config.turn_initial_grace(),
            idle_timeout: config.turn_idle_timeout(),
        }
    }
}

/// Final result of [`AgentSession::run_turn`].
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Terminal status of the last attempt.
    pub status: TurnStatus,
    /// Final result message, when the agent produced one.
    pub message: Option<String>,
    /// Attempts consumed.
    pub attempts: u32,
}

/// Session over a spawned agent's stdio.
pub type SpawnedAgentSession = AgentSession<BufReader<ChildStdout>, ChildStdin>;

// ── Session ──────────────────────────────────────────────────────────────────

/// One live agent session: subprocess, protocol streams, and turn state.
pub struct AgentSession<R, W> {
    session_id: String,
    next_id: i64,
    reader: FramedRead<R, LineCodec>,
    writer: W,
    child: Option<Child>,
    scratch: Option<TempDir>,
    sink: Arc<dyn TelemetrySink>,
    config: TurnRunnerConfig,
    effect_probe: EffectProbe,
}

impl AgentSession<BufReader<ChildStdout>, ChildStdin> {
    /// Spawn the agent, perform the initialize handshake, and create a
    /// session.
    ///
    /// Scoped acquisition: when any step after the spawn fails, the
    /// subprocess is terminated and the scratch directory removed before the
    /// error propagates.
    ///
    /// # Errors
    ///
    /// Spawn, handshake, and session-create failures, all as
    /// `AppError::Agent`.
    pub async fn start(
        spawn_config: &SpawnConfig,
        runner_config: TurnRunnerConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let scratch =
            tempfile::tempdir().map_err(|e| AppError::Agent(format!("failed to create scratch dir: {e}")))?;
        let process = spawn_agent(spawn_config, Some(scratch.path())).await?;

        let mut session = Self::over_io(
            process.stdout,
            process.stdin,
            Some(process.child),
            Some(scratch),
            runner_config,
            sink,
        )?;

        if let Err(err) = session.handshake(&spawn_config.workspace_root).await {
            session.shutdown().await;
            return Err(err);
        }

        session.sink.structured(&StructuredMessage::session_start(
            &session.session_id,
            &spawn_config.program,
            &spawn_config.workspace_root.to_string_lossy(),
        ));
        info!(session_id = %session.session_id, "agent session ready");
        Ok(session)
    }
}

impl<R, W> AgentSession<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Build a session over arbitrary duplex streams.
    ///
    /// Used by [`start`](AgentSession::start) for spawned children and by
    /// tests driving a scripted agent over in-memory pipes.  The handshake
    /// has not run yet; call [`handshake`](Self::handshake) before running
    /// turns.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the work-claim patterns fail to
    /// compile.
    pub fn over_io(
        reader: R,
        writer: W,
        child: Option<Child>,
        scratch: Option<TempDir>,
        config: TurnRunnerConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        Ok(Self {
            session_id: String::new(),
            next_id: 1,
            reader: FramedRead::new(reader, LineCodec::new()),
            writer,
            child,
            scratch,
            sink,
            config,
            effect_probe: EffectProbe::new()?,
        })
    }

    /// Session identifier assigned by the agent (empty before the
    /// handshake).
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Perform the initialize / session-create exchange.
    ///
    /// # Errors
    ///
    /// `AppError::Agent` on timeout, early exit, or a malformed result.
    pub async fn handshake(&mut self, workspace_root: &Path) -> Result<()> {
        let deadline = Instant::now() + self.config.handshake_timeout;

        let init_id = self.next_request_id();
        self.write_request(&AgentRequest::initialize(init_id)).await?;
        self.await_response(init_id, deadline).await?;

        let create_id = self.next_request_id();
        self.write_request(&AgentRequest::session_create(create_id, workspace_root))
            .await?;
        let result = self.await_response(create_id, deadline).await?;
        let created: SessionCreated = serde_json::from_value(result)
            .map_err(|e| AppError::Agent(format!("malformed session/create result: {e}")))?;

        self.session_id = created.session_id;
        Ok(())
    }

    /// Run one logical turn, retrying failed or interrupted attempts up to
    /// the configured bound.
    ///
    /// When `workspace` is given, completed turns whose final message claims
    /// work are cross-checked against a before/after workspace fingerprint
    /// and retried when nothing actually changed.
    ///
    /// # Errors
    ///
    /// `AppError::Agent` when the stream dies mid-turn or every attempt is
    /// exhausted without completion.
    pub async fn run_turn(&mut self, prompt: &str, workspace: Option<&Path>) -> Result<TurnOutcome> {
        let mut attempt: u32 = 1;
        let mut prompt_text = prompt.to_owned();

        loop {
            self.sink
                .structured(&StructuredMessage::turn_start(&self.session_id, attempt));

            let before = match workspace {
                Some(root) => Some(workspace_fingerprint(root)?),
                None => None,
            };

            let completion = self.drive_turn(&prompt_text).await?;

            self.sink.structured(&StructuredMessage::turn_completed(
                &self.session_id,
                &completion.turn_id,
                completion.status,
                completion.message.clone(),
            ));

            let reason = match completion.status {
                TurnStatus::Completed => {
                    let after = match workspace {
                        Some(root) => Some(workspace_fingerprint(root)?),
                        None => None,
                    };
                    if self.turn_had_no_effect(&completion, before.as_deref(), after.as_deref()) {
                        "agent reported completed work but the workspace is unchanged".to_owned()
                    } else {
                        return Ok(TurnOutcome {
                            status: TurnStatus::Completed,
                            message: completion.message,
                            attempts: attempt,
                        });
                    }
                }
                TurnStatus::Failed => completion
                    .message
                    .clone()
                    .unwrap_or_else(|| "turn reported failure".to_owned()),
                TurnStatus::Interrupted => completion
                    .message
                    .clone()
                    .unwrap_or_else(|| "turn was interrupted".to_owned()),
            };

            if attempt >= self.config.max_attempts {
                self.sink
                    .structured(&StructuredMessage::agent_error(&format!(
                        "turn did not complete after {attempt} attempts: {reason}"
                    )));
                return Err(AppError::Agent(format!(
                    "turn did not complete after {attempt} attempts: {reason}"
                )));
            }

            attempt += 1;
            self.sink.structured(&StructuredMessage::retry_scheduled(
                &self.session_id,
                attempt,
                &reason,
            ));
            prompt_text = escalation_prompt(prompt, attempt, &reason);
            debug!(
                session_id = %self.session_id,
                attempt,
                reason = reason.as_str(),
                "retrying turn with escalated instructions"
            );
        }
    }

    /// Run a turn and always release the session's resources afterwards,
    /// success or failure.
    ///
    /// # Errors
    ///
    /// Same as [`run_turn`](Self::run_turn); cleanup runs regardless.
    pub async fn run_to_completion(
        mut self,
        prompt: &str,
        workspace: Option<&Path>,
    ) -> Result<TurnOutcome> {
        let result = self.run_turn(prompt, workspace).await;
        self.shutdown().await;
        result
    }

    /// Terminate the subprocess and release auxiliary resources.
    ///
    /// Safe to call more than once; runs on every exit path.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill().await.ok();
            let _ = child.wait().await;
        }
        if let Some(scratch) = self.scratch.take() {
            if let Err(err) = scratch.close() {
                warn!(error = %err, "failed to remove scratch dir");
            }
        }
        if !self.session_id.is_empty() {
            self.sink
                .structured(&StructuredMessage::session_end(&self.session_id));
        }
    }

    // ── Turn internals ───────────────────────────────────────────────────────

    /// Drive a single turn attempt to its terminal report.
    async fn drive_turn(&mut self, prompt: &str) -> Result<TurnCompletion> {
        let run_id = self.next_request_id();
        self.write_request(&AgentRequest::turn_run(run_id, &self.session_id, prompt))
            .await?;

        let mut turn_id = String::new();
        let mut saw_event = false;
        let mut last_activity = Instant::now();

        loop {
            // Short grace before the first event, sustained window after.
            let window = if saw_event {
                self.config.idle_timeout
            } else {
                self.config.initial_grace
            };
            let deadline = last_activity + window;

            let step = tokio::select! {
                () = tokio::time::sleep_until(deadline) => None,
                item = self.reader.next() => Some(item),
            };

            let Some(item) = step else {
                // Inactivity — reclaim the unresponsive turn.
                let interrupt_id = self.next_request_id();
                let _ = self
                    .write_request(&AgentRequest::turn_interrupt(
                        interrupt_id,
                        &self.session_id,
                        &turn_id,
                    ))
                    .await;
                info!(
                    session_id = %self.session_id,
                    turn_id = turn_id.as_str(),
                    "turn interrupted after inactivity"
                );
                return Ok(TurnCompletion {
                    turn_id,
                    status: TurnStatus::Interrupted,
                    message: Some(format!("turn interrupted after {window:?} of inactivity")),
                });
            };

            match item {
                None => return Err(AppError::Agent("agent stream closed mid-turn".into())),
                Some(Err(AppError::Tunnel(msg))) => {
                    warn!(error = msg.as_str(), "agent framing error, skipping line");
                }
                Some(Err(err)) => {
                    return Err(AppError::Agent(format!("agent stream error: {err}")));
                }
                Some(Ok(line)) => {
                    last_activity = Instant::now();
                    match classify_inbound(&line) {
                        Err(err) => {
                            warn!(error = %err, "unparseable agent line, skipping");
                        }
                        Ok(None) => {}
                        Ok(Some(AgentMessage::Response { id, result })) if id == run_id => {
                            if let Ok(started) = serde_json::from_value::<TurnStarted>(result) {
                                turn_id = started.turn_id;
                            }
                        }
                        Ok(Some(AgentMessage::Error { id, message })) if id == run_id => {
                            return Ok(TurnCompletion {
                                turn_id,
                                status: TurnStatus::Failed,
                                message: Some(message),
                            });
                        }
                        Ok(Some(AgentMessage::Response { id, .. } | AgentMessage::Error { id, .. })) => {
                            debug!(id, "stale response correlation, skipping");
                        }
                        Ok(Some(AgentMessage::Notification { method, params })) => {
                            match parse_turn_notification(&method, params) {
                                Err(err) => {
                                    warn!(method = method.as_str(), error = %err, "bad turn notification, skipping");
                                }
                                Ok(None) => {
                                    debug!(method = method.as_str(), "unknown notification, skipping");
                                }
                                Ok(Some(TurnEvent::Activity(message))) => {
                                    saw_event = true;
                                    self.sink.structured(&message);
                                }
                                Ok(Some(TurnEvent::Completed(completion))) => {
                                    return Ok(completion);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Both signals are required: a textual work claim alone produces false
    /// positives from chatty agents, an unchanged fingerprint alone flags
    /// read-only tasks that legitimately change nothing.
    fn turn_had_no_effect(
        &self,
        completion: &TurnCompletion,
        before: Option<&str>,
        after: Option<&str>,
    ) -> bool {
        let (Some(before), Some(after)) = (before, after) else {
            return false;
        };
        if before != after {
            return false;
        }
        completion
            .message
            .as_deref()
            .is_some_and(|message| self.effect_probe.claims_work(message))
    }

    /// Serialize one request as an NDJSON line and flush it to the agent.
    async fn write_request(&mut self, request: &AgentRequest) -> Result<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| AppError::Agent(format!("failed to serialize request: {e}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::Agent(format!("write to agent failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::Agent(format!("flush to agent failed: {e}")))?;
        Ok(())
    }

    /// Read lines until the response correlated to `request_id` arrives or
    /// `deadline` passes.  Notifications seen along the way are skipped;
    /// non-JSON lines are logged and skipped.
    async fn await_response(&mut self, request_id: i64, deadline: Instant) -> Result<Value> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AppError::Agent(format!(
                    "handshake timeout: no response to request {request_id} within {:?}",
                    self.config.handshake_timeout
                )));
            }

            let item = tokio::time::timeout(remaining, self.reader.next())
                .await
                .map_err(|_| {
                    AppError::Agent(format!(
                        "handshake timeout: no response to request {request_id} within {:?}",
                        self.config.handshake_timeout
                    ))
                })?;

            match item {
                None => return Err(AppError::Agent("agent exited during handshake".into())),
                Some(Err(AppError::Tunnel(msg))) => {
                    warn!(error = msg.as_str(), "agent framing error during handshake, skipping");
                }
                Some(Err(err)) => {
                    return Err(AppError::Agent(format!("handshake io error: {err}")));
                }
                Some(Ok(line)) => match classify_inbound(&line) {
                    Err(err) => {
                        debug!(error = %err, raw = line.as_str(), "non-JSON line during handshake, skipping");
                    }
                    Ok(Some(AgentMessage::Response { id, result })) if id == request_id => {
                        return Ok(result);
                    }
                    Ok(Some(AgentMessage::Error { id, message })) if id == request_id => {
                        return Err(AppError::Agent(format!("agent rejected request: {message}")));
                    }
                    Ok(_) => {
                        debug!("skipping unexpected message during handshake");
                    }
                },
            }
        }
    }

    fn next_request_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

// ── No-effect detection ──────────────────────────────────────────────────────

/// Text patterns by which an agent claims to have produced work.
#[derive(Debug)]
struct EffectProbe {
    claims: RegexSet,
}

impl EffectProbe {
    fn new() -> Result<Self> {
        let claims = RegexSet::new([
            r"(?i)\bI(?: have|'ve)? (?:implemented|added|fixed|updated|created|refactored|changed)\b",
            r"(?i)\b(?:changes|edits|fixes) (?:have been|were) (?:made|applied|committed)\b",
            r"(?i)\bcommitted (?:the|my|all)? ?changes\b",
            r"(?i)\b(?:created|modified|updated|wrote|edited) \S+ files?\b",
        ])
        .map_err(|e| AppError::Config(format!("invalid work-claim pattern: {e}")))?;
        Ok(Self { claims })
    }

    fn claims_work(&self, message: &str) -> bool {
        self.claims.is_match(message)
    }
}

/// Fingerprint of a workspace's file state: SHA-256 over the sorted
/// (relative path, length, mtime) tuples of every file under `root`.
///
/// `.git` contents are included deliberately so direct commits count as a
/// state change.
///
/// # Errors
///
/// `AppError::Io` when the directory walk fails.
pub fn workspace_fingerprint(root: &Path) -> Result<String> {
    let mut entries: Vec<String> = Vec::new();
    collect_entries(root, root, &mut entries)?;
    entries.sort();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_entries(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs());
            out.push(format!("{rel}\u{1f}{}\u{1f}{mtime}", meta.len()));
        }
    }
    Ok(())
}

/// Build the continuation prompt for a retry attempt.
///
/// Each attempt escalates the instruction text rather than repeating the
/// identical prompt, reducing the chance of repeating the same ineffective
/// behavior.
#[must_use]
pub fn escalation_prompt(base: &str, attempt: u32, reason: &str) -> String {
    let preamble = if attempt <= 2 {
        "The previous attempt stopped before the task was done. Pick up from the current \
         repository state and finish it."
    } else {
        "Multiple attempts have stopped without finishing the task. Re-read the task, verify \
         each step against the repository as you go, and do not report completion until the \
         changes actually exist on disk."
    };
    format!("{preamble} (previous attempt: {reason})\n\nOriginal task:\n{base}")
}
