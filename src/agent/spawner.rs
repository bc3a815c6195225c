//! Agent process spawner.
//!
//! Spawns headless agent processes with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist so orchestrator secrets never
//!   leak into the child's environment.
//! - A configurable startup timeout: if the agent does not emit its ready
//!   signal (first stdout line) within the window, the process is killed and
//!   `AppError::Agent("startup timeout")` is returned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the parent's environment is stripped via
/// `env_clear()` before the child is launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TERM",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent CLI binary (e.g. `claude`, `codex`).
    pub program: String,
    /// Default arguments passed to the binary.
    pub args: Vec<String>,
    /// Workspace root directory; the child process starts in this directory.
    pub workspace_root: PathBuf,
    /// Maximum time to wait for the agent's ready signal (first stdout line).
    pub startup_timeout: Duration,
    /// Tunnel socket name exported to the child as `AGENT_RELAY_SOCKET`, so
    /// tooling inside the agent can open its own tunnel back to the parent.
    pub tunnel_socket: Option<String>,
}

// ── Process handle ───────────────────────────────────────────────────────────

/// Active stdio connection to a spawned agent process.
///
/// The caller is responsible for keeping `child` alive (it has
/// `kill_on_drop(true)`), writing requests to `stdin`, and reading
/// line-delimited responses from `stdout`.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for sending JSON request lines.
    pub stdin: ChildStdin,
    /// Buffered reader over the agent's stdout for line-by-line parsing.
    pub stdout: BufReader<ChildStdout>,
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn an agent process and wait for its ready signal.
///
/// Builds a `tokio::process::Command` with `env_clear()` and only the
/// variables listed in [`ALLOWED_ENV_VARS`], injects the tunnel socket and
/// optional scratch directory, then waits up to `config.startup_timeout`
/// for the first line of stdout.  On timeout the process is killed before
/// the error returns — a half-started child is never left running.
///
/// # Errors
///
/// - `AppError::Agent("failed to spawn agent: …")` — OS spawn failure.
/// - `AppError::Agent("startup timeout …")` — no ready line within the window.
/// - `AppError::Agent("agent process exited before ready signal")` — early EOF.
pub async fn spawn_agent(config: &SpawnConfig, scratch_dir: Option<&Path>) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.program);

    for arg in &config.args {
        cmd.arg(arg);
    }

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    if let Some(socket) = &config.tunnel_socket {
        cmd.env("AGENT_RELAY_SOCKET", socket);
    }
    if let Some(scratch) = scratch_dir {
        cmd.env("AGENT_RELAY_SCRATCH", scratch);
    }

    cmd.current_dir(&config.workspace_root)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Agent(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Agent("failed to capture agent stdin".into()))?;
    let stdout_raw = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Agent("failed to capture agent stdout".into()))?;

    let mut reader = BufReader::new(stdout_raw);
    let mut line = String::new();

    match tokio::time::timeout(config.startup_timeout, reader.read_line(&mut line)).await {
        Ok(Ok(read)) if read > 0 => {
            info!(
                program = %config.program,
                ready_line = line.trim(),
                "agent emitted ready signal"
            );
        }
        Ok(Ok(_)) => {
            // Zero bytes means EOF — process exited before sending anything.
            return Err(AppError::Agent(
                "agent process exited before ready signal".into(),
            ));
        }
        Ok(Err(err)) => {
            return Err(AppError::Agent(format!(
                "failed to read agent ready signal: {err}"
            )));
        }
        Err(_elapsed) => {
            // Kill the process before returning the error.
            child.kill().await.ok();
            return Err(AppError::Agent(format!(
                "startup timeout: agent did not emit ready signal within {:?}",
                config.startup_timeout
            )));
        }
    }

    Ok(AgentProcess {
        child,
        stdin,
        stdout: reader,
    })
}
