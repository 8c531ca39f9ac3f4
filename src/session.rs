//! Remote session management with transparent reconnection.
//!
//! [`RemoteSession`] owns exactly one logical connection to the remote file
//! store and hides transient transport failures from callers: every remote
//! operation goes through [`RemoteSession::with_connection`], which detects
//! connection-level errors, re-authenticates with the last-known credentials
//! under a bounded retry policy, and re-invokes the failed operation exactly
//! once after a successful reconnect.
//!
//! The underlying protocol does not tolerate interleaved commands on one
//! channel, so the live connection sits behind a mutex: concurrent callers
//! queue, and reconnection is a mutually exclusive critical section.
//!
//! The actual wire protocol lives behind the [`RemoteTransport`] trait
//! (implemented by [`crate::transport_sftp::SftpTransport`]); tests drive the
//! state machine with a scripted in-memory transport.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::progress::{ConnectionEvent, ConnectionReporter, NoReporter};

/// Connectivity state of the managed session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Authentication material. When both are set, the private key wins.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
}

/// One entry in a remote directory listing.
#[derive(Clone, Debug)]
pub struct RemoteEntry {
    /// Full remote path.
    pub path: String,
    /// Bare entry name.
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub is_dir: bool,
}

/// Session-level errors.
///
/// Only [`SessionError::Network`] marks a transport failure and triggers the
/// reconnect-and-retry path; everything else surfaces immediately.
#[derive(Debug)]
pub enum SessionError {
    /// Bad credentials or rejected key. Fatal for the attempt, never retried.
    Auth(String),
    /// Transport-level failure: timeout, reset, EOF.
    Network(String),
    /// Reconnection gave up after the configured number of attempts.
    ConnectionLost { attempts: u32 },
    /// Remote path does not exist.
    NotFound(String),
    /// Remote refused access to a path.
    Permission(String),
}

impl SessionError {
    /// Whether this error should trigger the reconnect path.
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Network(_))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Auth(e) => write!(f, "authentication failed: {}", e),
            SessionError::Network(e) => write!(f, "network error: {}", e),
            SessionError::ConnectionLost { attempts } => {
                write!(f, "connection lost after {} reconnect attempts", attempts)
            }
            SessionError::NotFound(path) => write!(f, "remote path not found: {}", path),
            SessionError::Permission(path) => write!(f, "permission denied: {}", path),
        }
    }
}

impl std::error::Error for SessionError {}

/// The minimal remote-filesystem surface the session manages.
///
/// Implementations are plain blocking I/O; async callers wrap session usage
/// in `spawn_blocking`.
pub trait RemoteTransport: Send {
    /// Establish the secure channel and authenticate. Must tear down any
    /// previous channel first.
    fn connect(&mut self, credentials: &Credentials) -> Result<(), SessionError>;

    /// Drop the channel. Must be safe to call when already disconnected.
    fn disconnect(&mut self);

    /// Lightweight liveness probe (a cheap stat, not a full round trip of
    /// real work). Returns `false` when the channel is gone.
    fn probe(&mut self) -> bool;

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, SessionError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, SessionError>;
}

/// Bounded reconnection policy. A configuration concern, not hardcoded.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

struct SessionInner {
    transport: Box<dyn RemoteTransport>,
    state: ConnectionState,
}

/// The one shared handle to the remote store.
pub struct RemoteSession {
    inner: Mutex<SessionInner>,
    credentials: Credentials,
    policy: ReconnectPolicy,
    reporter: Box<dyn ConnectionReporter>,
}

impl RemoteSession {
    pub fn new(
        transport: Box<dyn RemoteTransport>,
        credentials: Credentials,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                transport,
                state: ConnectionState::Disconnected,
            }),
            credentials,
            policy,
            reporter: Box::new(NoReporter),
        }
    }

    /// Register the state-change reporter. Notification only; the state
    /// machine does not depend on it.
    pub fn with_reporter(mut self, reporter: Box<dyn ConnectionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Establish the connection. Idempotent: a no-op when already connected.
    pub fn connect(&self) -> Result<(), SessionError> {
        let mut inner = self.lock();
        self.ensure_connected(&mut inner)
    }

    /// Current liveness. Cheap local check first; probes the channel only
    /// when the local state claims it is up.
    pub fn is_connected(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return false;
        }
        if inner.transport.probe() {
            true
        } else {
            self.set_state(&mut inner, ConnectionState::Disconnected);
            false
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Tear the session down.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.transport.disconnect();
        self.set_state(&mut inner, ConnectionState::Disconnected);
    }

    /// Run `operation` against the live connection.
    ///
    /// On a transport-level failure the session reconnects (bounded attempts
    /// with the configured delay) and re-invokes `operation` exactly once
    /// more. Authentication failures and non-transport errors surface
    /// immediately. The connection lock is held for the whole call, so
    /// callers queue and at most one reconnect runs at a time.
    pub fn with_connection<T>(
        &self,
        mut operation: impl FnMut(&mut dyn RemoteTransport) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut inner = self.lock();
        self.ensure_connected(&mut inner)?;
        match operation(inner.transport.as_mut()) {
            Ok(value) => Ok(value),
            Err(e) if e.is_transport() => {
                tracing::debug!("remote operation failed ({}), reconnecting", e);
                self.reconnect(&mut inner)?;
                operation(inner.transport.as_mut())
            }
            Err(e) => Err(e),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        // A panic while holding the lock poisons it; the transport state is
        // still sound (worst case: disconnected), so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self, inner: &mut SessionInner) -> Result<(), SessionError> {
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(inner, ConnectionState::Connecting);
        match inner.transport.connect(&self.credentials) {
            Ok(()) => {
                self.set_state(inner, ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(inner, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn reconnect(&self, inner: &mut SessionInner) -> Result<(), SessionError> {
        self.set_state(inner, ConnectionState::Reconnecting);
        inner.transport.disconnect();
        for attempt in 1..=self.policy.max_attempts {
            self.reporter.report(ConnectionEvent::ReconnectAttempt {
                attempt,
                max: self.policy.max_attempts,
            });
            std::thread::sleep(self.policy.delay);
            match inner.transport.connect(&self.credentials) {
                Ok(()) => {
                    self.set_state(inner, ConnectionState::Connected);
                    return Ok(());
                }
                Err(e @ SessionError::Auth(_)) => {
                    // Credentials went bad; retrying cannot help.
                    self.set_state(inner, ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!("reconnect attempt {} failed: {}", attempt, e);
                    inner.transport.disconnect();
                }
            }
        }
        self.set_state(inner, ConnectionState::Disconnected);
        Err(SessionError::ConnectionLost {
            attempts: self.policy.max_attempts,
        })
    }

    fn set_state(&self, inner: &mut SessionInner, to: ConnectionState) {
        if inner.state != to {
            let from = inner.state;
            inner.state = to;
            self.reporter.report(ConnectionEvent::StateChanged { from, to });
        }
    }
}
