//! SFTP transport backed by libssh2 (`ssh2` crate).
//!
//! Implements [`RemoteTransport`] over a TCP + SSH channel. All calls are
//! blocking by design; the session layer is used from `spawn_blocking` when
//! driven by async code.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ssh2::{ErrorCode, Session as SshSession, Sftp};

use crate::config::RemoteConfig;
use crate::session::{Credentials, RemoteEntry, RemoteTransport, SessionError};

// libssh2 error codes that mean "the server rejected who you are", not
// "the wire broke" (LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED and
// LIBSSH2_ERROR_AUTHENTICATION_FAILED).
const ERR_PUBLICKEY_UNVERIFIED: i32 = -16;
const ERR_AUTHENTICATION_FAILED: i32 = -18;

// SFTP status codes (SSH_FX_*).
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;

struct Live {
    session: SshSession,
    sftp: Sftp,
}

/// An SFTP connection to one host. Created disconnected; the session layer
/// drives `connect`/`disconnect`.
pub struct SftpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    live: Option<Live>,
}

impl SftpTransport {
    pub fn new(remote: &RemoteConfig, timeout: Duration) -> Self {
        Self {
            host: remote.host.clone(),
            port: remote.port,
            timeout,
            live: None,
        }
    }

    fn live(&self) -> Result<&Live, SessionError> {
        self.live
            .as_ref()
            .ok_or_else(|| SessionError::Network("not connected".into()))
    }
}

impl RemoteTransport for SftpTransport {
    fn connect(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        self.live = None;

        let addr = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| SessionError::Network(format!("connect {}: {}", addr, e)))?;

        let mut session = SshSession::new()
            .map_err(|e| SessionError::Network(format!("ssh session init: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| SessionError::Network(format!("ssh handshake: {}", e)))?;

        // Private key takes precedence when both credentials are configured.
        if let Some(key) = &credentials.private_key {
            session
                .userauth_pubkey_file(&credentials.user, None, key, None)
                .map_err(map_auth_error)?;
        } else if let Some(password) = &credentials.password {
            session
                .userauth_password(&credentials.user, password)
                .map_err(map_auth_error)?;
        } else {
            return Err(SessionError::Auth(
                "no password or private key configured".into(),
            ));
        }

        let sftp = session
            .sftp()
            .map_err(|e| SessionError::Network(format!("sftp subsystem: {}", e)))?;

        self.live = Some(Live { session, sftp });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(live) = self.live.take() {
            let _ = live.session.disconnect(None, "closing", None);
        }
    }

    fn probe(&mut self) -> bool {
        match &self.live {
            Some(live) => live.sftp.stat(Path::new(".")).is_ok(),
            None => false,
        }
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, SessionError> {
        let live = self.live()?;
        let entries = live
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| map_sftp_error(e, path))?;

        let mut result = Vec::with_capacity(entries.len());
        for (entry_path, stat) in entries {
            let name = entry_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let full = format!("{}/{}", path.trim_end_matches('/'), name);
            let mtime = stat.mtime.unwrap_or(0) as i64;
            result.push(RemoteEntry {
                path: full,
                name,
                size: stat.size.unwrap_or(0),
                modified_at: Utc.timestamp_opt(mtime, 0).unwrap(),
                is_dir: stat.is_dir(),
            });
        }
        Ok(result)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, SessionError> {
        let live = self.live()?;
        let mut file = live
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_sftp_error(e, path))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| SessionError::Network(format!("read {}: {}", path, e)))?;
        Ok(buf)
    }
}

fn map_auth_error(e: ssh2::Error) -> SessionError {
    match e.code() {
        ErrorCode::Session(ERR_AUTHENTICATION_FAILED) | ErrorCode::Session(ERR_PUBLICKEY_UNVERIFIED) => {
            SessionError::Auth(e.to_string())
        }
        _ => SessionError::Network(format!("authentication transport: {}", e)),
    }
}

fn map_sftp_error(e: ssh2::Error, path: &str) -> SessionError {
    match e.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE) => SessionError::NotFound(path.to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED) => SessionError::Permission(path.to_string()),
        _ => SessionError::Network(e.to_string()),
    }
}
