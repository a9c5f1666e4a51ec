use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connection closed: {0}")]
    Disconnected(String),
    #[error("remote call timed out: {0}")]
    Timeout(String),
    #[error("invalid address: {0}")]
    Address(String),
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("session worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session itself is unusable; the caller should reconnect.
    Connection,
    NotFound,
    Transfer,
}

impl SessionError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            SessionError::NotFound(_) => ErrorClass::NotFound,
            SessionError::Auth(_)
            | SessionError::Disconnected(_)
            | SessionError::Timeout(_)
            | SessionError::Address(_) => ErrorClass::Connection,
            SessionError::Ssh(_) | SessionError::Io(_) | SessionError::Worker(_) => {
                ErrorClass::Transfer
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), ErrorClass::NotFound)
    }
}

/// Size and whole-second modification time of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: i64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl SessionConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// One logical session against a remote file tree.
///
/// Transfers preserve the source modification time on the destination so
/// that size/mtime signatures agree on both sides afterwards.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Returns `Ok(None)` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, SessionError>;

    async fn put(&self, local: &Path, remote: &str) -> Result<(), SessionError>;

    async fn get(&self, remote: &str, local: &Path) -> Result<(), SessionError>;

    /// Replaces `to` when it already exists.
    async fn rename(&self, from: &str, to: &str) -> Result<(), SessionError>;

    async fn unlink(&self, path: &str) -> Result<(), SessionError>;

    /// Succeeds when the directory already exists.
    async fn mkdir(&self, path: &str) -> Result<(), SessionError>;

    async fn rmdir(&self, path: &str) -> Result<(), SessionError>;

    async fn readdir(&self, path: &str) -> Result<Vec<RemoteEntry>, SessionError>;

    /// Runs `command`, forwarding output chunks as they arrive, and returns
    /// the exit code.
    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<i32, SessionError>;

    async fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig)
    -> Result<Arc<dyn RemoteSession>, SessionError>;
}

/// Whole seconds since the Unix epoch of `meta`'s modification time.
pub fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Joins a POSIX remote directory and a child name.
pub fn join_remote(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        return format!("/{name}");
    }
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
