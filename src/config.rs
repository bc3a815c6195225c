//! Global configuration parsing and validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Configurable timeout values (seconds) for agent sessions and turns.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Maximum time to wait for the agent's ready signal after spawn.
    #[serde(default = "default_startup_seconds")]
    pub startup_seconds: u64,
    /// Grace period before the first inbound event of a turn.
    #[serde(default = "default_turn_initial_grace_seconds")]
    pub turn_initial_grace_seconds: u64,
    /// Sustained inactivity window once a turn has produced events.
    #[serde(default = "default_turn_idle_seconds")]
    pub turn_idle_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: default_startup_seconds(),
            turn_initial_grace_seconds: default_turn_initial_grace_seconds(),
            turn_idle_seconds: default_turn_idle_seconds(),
        }
    }
}

fn default_startup_seconds() -> u64 {
    30
}

fn default_turn_initial_grace_seconds() -> u64 {
    60
}

fn default_turn_idle_seconds() -> u64 {
    300
}

/// External agent subprocess settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary (e.g. `claude`, `codex`).
    #[serde(default)]
    pub program: String,
    /// Default arguments passed to the agent binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Workspace root directory; the child process starts in this directory.
    #[serde(default)]
    pub workspace_root: PathBuf,
}

/// Retry policy for failed or interrupted turns.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum turn attempts within one session.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_socket_name() -> String {
    "agent-relay.sock".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Local socket name the tunnel host listens on.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    /// Timeout settings.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// External agent subprocess settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Turn retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            timeouts: TimeoutConfig::default(),
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Parse and validate a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the TOML is malformed or a value would
    /// make the runner unbounded (zero inactivity windows, zero attempts).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that serde defaults alone cannot enforce.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.socket_name.trim().is_empty() {
            return Err(AppError::Config("socket_name must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.timeouts.turn_idle_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.turn_idle_seconds must be positive: turn inactivity must stay bounded"
                    .into(),
            ));
        }
        if self.timeouts.turn_initial_grace_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.turn_initial_grace_seconds must be positive".into(),
            ));
        }
        if self.timeouts.startup_seconds == 0 {
            return Err(AppError::Config("timeouts.startup_seconds must be positive".into()));
        }
        Ok(())
    }

    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.startup_seconds)
    }

    /// Pre-first-event grace window as a [`Duration`].
    #[must_use]
    pub fn turn_initial_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.turn_initial_grace_seconds)
    }

    /// Sustained inactivity window as a [`Duration`].
    #[must_use]
    pub fn turn_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.turn_idle_seconds)
    }
}
