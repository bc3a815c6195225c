//! Telemetry sink seam between the tunnel transport and its host.
//!
//! The tunnel dispatcher relays everything a child sends — console logs, raw
//! output passthrough, and typed structured messages — into a
//! [`TelemetrySink`]. How the sink renders or forwards them is the host's
//! concern, not the transport's.

use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::tunnel::protocol::{LogLevel, OutputStream, StructuredMessage};

/// Receiver for telemetry relayed out of the tunnel.
pub trait TelemetrySink: Send + Sync {
    /// Relay a console-style log record forwarded by a child.
    fn console(&self, level: LogLevel, args: &[serde_json::Value]);

    /// Relay raw stdout/stderr passthrough data.
    fn output(&self, stream: OutputStream, data: &str);

    /// Relay a typed structured telemetry message.
    fn structured(&self, message: &StructuredMessage);
}

/// Sink that forwards everything into the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn console(&self, level: LogLevel, args: &[serde_json::Value]) {
        let rendered = render_args(args);
        match level {
            LogLevel::Log => info!(target: "relay::child", "{rendered}"),
            LogLevel::Error => error!(target: "relay::child", "{rendered}"),
            LogLevel::Warn => warn!(target: "relay::child", "{rendered}"),
            LogLevel::Debug => debug!(target: "relay::child", "{rendered}"),
        }
    }

    fn output(&self, stream: OutputStream, data: &str) {
        match stream {
            OutputStream::Stdout => info!(target: "relay::child::stdout", "{data}"),
            OutputStream::Stderr => warn!(target: "relay::child::stderr", "{data}"),
        }
    }

    fn structured(&self, message: &StructuredMessage) {
        debug!(target: "relay::telemetry", kind = message.kind(), "structured message");
    }
}

/// One event captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// A console log record.
    Console {
        /// Log level tag.
        level: LogLevel,
        /// Ordered argument values.
        args: Vec<serde_json::Value>,
    },
    /// A raw output passthrough record.
    Output {
        /// Originating stream.
        stream: OutputStream,
        /// Payload text.
        data: String,
    },
    /// A structured telemetry message.
    Structured(StructuredMessage),
}

/// In-memory sink recording every relayed event, for assertions in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    /// Create an empty recording sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }

    /// Drain and return the events recorded so far.
    #[must_use]
    pub fn take(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .map_or_else(|e| std::mem::take(&mut *e.into_inner()), |mut g| std::mem::take(&mut *g))
    }

    fn push(&self, event: SinkEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl TelemetrySink for MemorySink {
    fn console(&self, level: LogLevel, args: &[serde_json::Value]) {
        self.push(SinkEvent::Console {
            level,
            args: args.to_vec(),
        });
    }

    fn output(&self, stream: OutputStream, data: &str) {
        self.push(SinkEvent::Output {
            stream,
            data: data.to_owned(),
        });
    }

    fn structured(&self, message: &StructuredMessage) {
        self.push(SinkEvent::Structured(message.clone()));
    }
}

/// Render log arguments the way a console would: space-separated, strings
/// unquoted, everything else as compact JSON.
fn render_args(args: &[serde_json::Value]) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    parts.join(" ")
}
