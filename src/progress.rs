//! Connection-state reporting for the remote session.
//!
//! The session's state machine notifies a registered reporter on every
//! transition so a frontend can show a reconnect indicator without being
//! wired into the transition logic itself. Events go to **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

use crate::session::ConnectionState;

/// A single observable session event.
#[derive(Clone, Copy, Debug)]
pub enum ConnectionEvent {
    /// The session moved from one state to another.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// One bounded reconnection attempt is starting.
    ReconnectAttempt { attempt: u32, max: u32 },
}

/// Receives session events. Implementations write to stderr (human or JSON).
pub trait ConnectionReporter: Send + Sync {
    /// Emit an event. Called from inside the session's critical section, so
    /// implementations must be quick and must not call back into the session.
    fn report(&self, event: ConnectionEvent);
}

/// Human-friendly lines: "remote session  reconnecting (attempt 2/3)".
pub struct StderrReporter;

impl ConnectionReporter for StderrReporter {
    fn report(&self, event: ConnectionEvent) {
        let line = match event {
            ConnectionEvent::StateChanged { to, .. } => {
                format!("remote session  {}\n", to)
            }
            ConnectionEvent::ReconnectAttempt { attempt, max } => {
                format!("remote session  reconnecting (attempt {}/{})\n", attempt, max)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable: one JSON object per line on stderr.
pub struct JsonReporter;

impl ConnectionReporter for JsonReporter {
    fn report(&self, event: ConnectionEvent) {
        let obj = match event {
            ConnectionEvent::StateChanged { from, to } => serde_json::json!({
                "event": "session",
                "from": from.to_string(),
                "to": to.to_string(),
            }),
            ConnectionEvent::ReconnectAttempt { attempt, max } => serde_json::json!({
                "event": "session",
                "phase": "reconnect",
                "attempt": attempt,
                "max": max,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when status output is disabled.
pub struct NoReporter;

impl ConnectionReporter for NoReporter {
    fn report(&self, _event: ConnectionEvent) {}
}

/// Reporter mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReporterMode {
    Off,
    Human,
    Json,
}

impl ReporterMode {
    /// Default: human output when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ReporterMode::Human
        } else {
            ReporterMode::Off
        }
    }

    /// Build a reporter for this mode; the session takes ownership.
    pub fn reporter(&self) -> Box<dyn ConnectionReporter> {
        match self {
            ReporterMode::Off => Box::new(NoReporter),
            ReporterMode::Human => Box::new(StderrReporter),
            ReporterMode::Json => Box::new(JsonReporter),
        }
    }
}
