use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Upload,
    Download,
    Delete,
    CreateDir,
    Rename,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Upload => "UPLOAD",
            JobKind::Download => "DOWNLOAD",
            JobKind::Delete => "DELETE",
            JobKind::CreateDir => "MKDIR",
            JobKind::Rename => "RENAME",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch order: `High` runs before `Normal`, `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection unavailable: {0}")]
    Connection(String),
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Transfer(err.to_string())
    }
}

impl From<crate::sync::paths::PathError> for JobError {
    fn from(err: crate::sync::paths::PathError) -> Self {
        JobError::Transfer(err.to_string())
    }
}

/// Handed to a job's action on every attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: u64,
    pub attempt: u32,
    pub cancel: CancellationToken,
}

pub type JobAction =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

pub struct TransferJob {
    pub id: u64,
    pub dedup_key: String,
    pub kind: JobKind,
    pub local_path: Option<PathBuf>,
    pub remote_path: String,
    pub temp_local: Option<PathBuf>,
    pub temp_remote: Option<String>,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cancel: CancellationToken,
    action: JobAction,
}

impl TransferJob {
    pub fn new<F, Fut>(kind: JobKind, remote_path: impl Into<String>, action: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let remote_path = remote_path.into();
        let action: JobAction = Arc::new(move |ctx| action(ctx).boxed());
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            dedup_key: dedup_key(kind, &remote_path),
            kind,
            local_path: None,
            remote_path,
            temp_local: None,
            temp_remote: None,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: 0,
            cancel: CancellationToken::new(),
            action,
        }
    }

    pub fn with_local_path(mut self, path: PathBuf) -> Self {
        self.local_path = Some(path);
        self
    }

    pub fn with_temp_paths(mut self, local: Option<PathBuf>, remote: Option<String>) -> Self {
        self.temp_local = local;
        self.temp_remote = remote;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            dedup_key: self.dedup_key.clone(),
            kind: self.kind,
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            priority: self.priority,
            retry_count: self.retry_count,
        }
    }

    pub(crate) fn run(&self) -> BoxFuture<'static, Result<(), JobError>> {
        (self.action)(JobContext {
            job_id: self.id,
            attempt: self.retry_count,
            cancel: self.cancel.clone(),
        })
    }
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferJob")
            .field("id", &self.id)
            .field("dedup_key", &self.dedup_key)
            .field("kind", &self.kind)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Identifies the remote resource and operation a job acts on.
pub fn dedup_key(kind: JobKind, remote_path: &str) -> String {
    format!("{}:{}", kind.as_str(), remote_path)
}

/// Event payload describing a job without its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub id: u64,
    pub dedup_key: String,
    pub kind: JobKind,
    pub local_path: Option<PathBuf>,
    pub remote_path: String,
    pub priority: Priority,
    pub retry_count: u32,
}
