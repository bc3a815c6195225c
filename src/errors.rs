//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Callers deciding on fallback behavior must distinguish
/// [`AppError::PromptTimeout`] from every other kind: a timeout may be
/// answered with a caller-chosen default, while a lost connection or failed
/// write must propagate.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Tunnel transport or protocol failure (write failed, malformed frame).
    Tunnel(String),
    /// The duplex connection closed or errored while requests were pending.
    ConnectionLost(String),
    /// A prompt request exceeded its caller-specified timeout.
    PromptTimeout(String),
    /// The remote peer answered a prompt request with an error payload.
    PromptFailed(String),
    /// Child agent process or turn protocol failure.
    Agent(String),
    /// Interactive prompt frontend failure or user cancellation.
    Frontend(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error is a genuine timeout.
    ///
    /// Timeout-only fallback policies (e.g. default-deny after a silent
    /// operator) must check this instead of matching on the message text.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PromptTimeout(_))
    }

    /// Whether this error reports a lost or torn-down connection.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Tunnel(msg) => write!(f, "tunnel: {msg}"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::PromptTimeout(msg) => write!(f, "prompt timeout: {msg}"),
            Self::PromptFailed(msg) => write!(f, "prompt failed: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Frontend(msg) => write!(f, "frontend: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
