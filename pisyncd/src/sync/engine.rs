use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::conflict::{PushDecision, artifact_names, conflict_stamp, decide_push};
use super::connection::{ConnectionError, ConnectionManager, ConnectionState};
use super::debounce::{Debouncer, Suppressor};
use super::filter::{FilterError, PathFilter};
use super::index::{ConflictArtifact, PathStatus, PendingChange, SyncIndex, SyncSignature};
use super::job::{JobContext, JobError, JobKind, Priority, TransferJob, dedup_key};
use super::paths::{
    PathError, local_path_for, relative_path, relative_remote, remote_ancestors, remote_path_for,
};
use super::queue::{QueueEvent, TransferQueue};
use super::registry::{ConnectionRegistry, SyncTarget};
use super::transfer::{RemoteCall, download_atomic, upload_atomic};
use crate::config::{ConfigError, SyncSettings};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);
pub const SUPPRESSION_WINDOW: Duration = Duration::from_secs(3);
const EVENT_CAPACITY: usize = 1024;
/// Debounce keys of remote-change pulls; local pushes use the bare path.
const PULL_KEY_PREFIX: &str = "remote:";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("remote operation failed: {0}")]
    Remote(#[from] JobError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sync is disabled in the settings")]
    Disabled,
    #[error("no sync target is bound")]
    NotBound,
    #[error("{0} is outside the sync root")]
    OutsideRoot(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTimings {
    pub debounce: Duration,
    pub suppression: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_WINDOW,
            suppression: SUPPRESSION_WINDOW,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub timings: EngineTimings,
    pub retry_backoff: Backoff,
    /// Surfaced with terminal failures so users know where to look.
    pub log_path: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timings: EngineTimings::default(),
            retry_backoff: Backoff::job_retry(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatusChanged {
        path: String,
        status: PathStatus,
    },
    ConflictDetected(ConflictArtifact),
    JobFailed {
        path: String,
        kind: JobKind,
        error: JobError,
        log_path: Option<PathBuf>,
    },
}

/// Outcome of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub conflicts: usize,
}

#[derive(Clone)]
struct Bound {
    target: SyncTarget,
    manager: ConnectionManager,
}

struct Binding {
    bound: Bound,
    listener: JoinHandle<()>,
}

#[derive(Default)]
struct OfflineBuffer {
    online: bool,
    parked: Vec<TransferJob>,
}

struct EngineInner {
    registry: Arc<ConnectionRegistry>,
    queue: TransferQueue,
    settings: RwLock<SyncSettings>,
    filter: RwLock<PathFilter>,
    binding: Mutex<Option<Binding>>,
    index: Mutex<SyncIndex>,
    suppressor: Suppressor,
    debouncer: Debouncer,
    offline: Mutex<OfflineBuffer>,
    events: broadcast::Sender<EngineEvent>,
    queue_listener: Mutex<Option<JoinHandle<()>>>,
    log_path: Option<PathBuf>,
}

/// Turns change notifications into transfer jobs for one bound target.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SyncEngine {
    /// Must be called from within a tokio runtime.
    pub fn new(registry: Arc<ConnectionRegistry>, options: EngineOptions) -> Self {
        let settings = SyncSettings::default();
        let filter = PathFilter::allow_all();
        let queue = TransferQueue::with_backoff(settings.max_concurrency, options.retry_backoff);
        queue.set_online(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = Self {
            inner: Arc::new(EngineInner {
                registry,
                queue,
                settings: RwLock::new(settings),
                filter: RwLock::new(filter),
                binding: Mutex::new(None),
                index: Mutex::new(SyncIndex::new()),
                suppressor: Suppressor::new(options.timings.suppression),
                debouncer: Debouncer::new(options.timings.debounce),
                offline: Mutex::new(OfflineBuffer::default()),
                events,
                queue_listener: Mutex::new(None),
                log_path: options.log_path,
            }),
        };
        let listener = tokio::spawn(queue_listener(
            Arc::downgrade(&engine.inner),
            engine.inner.queue.subscribe(),
        ));
        *lock(&engine.inner.queue_listener) = Some(listener);
        engine
    }

    fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    fn index(&self) -> MutexGuard<'_, SyncIndex> {
        lock(&self.inner.index)
    }

    fn filter(&self) -> PathFilter {
        match self.inner.filter.read() {
            Ok(filter) => filter.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn settings(&self) -> SyncSettings {
        match self.inner.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn bound(&self) -> Option<Bound> {
        lock(&self.inner.binding)
            .as_ref()
            .map(|binding| binding.bound.clone())
    }

    fn require_bound(&self) -> Result<Bound, EngineError> {
        self.bound().ok_or(EngineError::NotBound)
    }

    /// Resolves the target from `settings` and binds its connection manager.
    /// A different target identity tears down everything tied to the old one.
    pub async fn bind(&self, settings: SyncSettings) -> Result<ConnectionManager, EngineError> {
        let settings = settings.normalized();
        if !settings.enabled {
            return Err(EngineError::Disabled);
        }
        let target = SyncTarget::from_settings(&settings)?;
        let filter = PathFilter::from_settings(&settings)?;
        let manager = self.inner.registry.get_or_create(&target, &settings);

        match self.inner.filter.write() {
            Ok(mut current) => *current = filter,
            Err(poisoned) => *poisoned.into_inner() = filter,
        }
        self.inner.queue.update_concurrency(settings.max_concurrency);
        match self.inner.settings.write() {
            Ok(mut current) => *current = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }

        let previous = {
            let mut binding = lock(&self.inner.binding);
            if let Some(current) = binding.as_mut()
                && current.bound.target.key() == target.key()
            {
                current.bound.target = target;
                return Ok(manager);
            }
            binding.take()
        };

        if let Some(previous) = previous {
            let old_key = previous.bound.target.key();
            info!("rebinding sync from {} to {}", old_key, target.key());
            previous.listener.abort();
            self.drop_target_work();
            self.index().clear_baselines();
            self.inner.registry.dispose(&old_key).await;
        }

        let listener = tokio::spawn(connection_listener(
            Arc::downgrade(&self.inner),
            manager.watch_state(),
        ));
        *lock(&self.inner.binding) = Some(Binding {
            bound: Bound {
                target,
                manager: manager.clone(),
            },
            listener,
        });
        Ok(manager)
    }

    /// Cancels queued and parked jobs for the current target.
    fn drop_target_work(&self) {
        self.inner.debouncer.cancel_all();
        let mut offline = lock(&self.inner.offline);
        offline.online = false;
        self.inner.queue.set_online(false);
        // Routed through the queue so bulk waiters see the cancellation.
        for job in std::mem::take(&mut offline.parked) {
            self.inner.queue.enqueue(job);
        }
        self.inner.queue.cancel_all();
    }

    fn apply_connection_state(&self, state: ConnectionState) {
        let online = state.is_online();
        let mut offline = lock(&self.inner.offline);
        if offline.online == online {
            return;
        }
        offline.online = online;
        if !online {
            debug!("sync paused while connection is {:?}", state);
            self.inner.queue.set_online(false);
            return;
        }
        let parked = std::mem::take(&mut offline.parked);
        if !parked.is_empty() {
            info!("flushing {} jobs parked while offline", parked.len());
        }
        for job in parked {
            self.inner.queue.enqueue(job);
        }
        self.inner.queue.set_online(true);
    }

    /// Hands `job` to the queue, or parks it until the connection is up.
    fn submit(&self, bound: &Bound, job: TransferJob) {
        let mut offline = lock(&self.inner.offline);
        if offline.online {
            self.inner.queue.enqueue(job);
            return;
        }
        debug!("parking {} {} until connected", job.kind, job.remote_path);
        offline.parked.push(job);
        drop(offline);
        if !bound.manager.is_manually_disconnected() {
            bound.manager.ensure_connected();
        }
    }

    /// Removes not-yet-started jobs of `kinds` for `remote`.
    fn cancel_kinds(&self, remote: &str, kinds: &[JobKind]) {
        let keys: Vec<String> = kinds.iter().map(|kind| dedup_key(*kind, remote)).collect();
        let mut offline = lock(&self.inner.offline);
        let (matched, kept): (Vec<TransferJob>, Vec<TransferJob>) =
            std::mem::take(&mut offline.parked)
                .into_iter()
                .partition(|job| keys.contains(&job.dedup_key));
        offline.parked = kept;
        // Parked jobs go through the queue so bulk waiters see the cancellation.
        for job in matched {
            self.inner.queue.enqueue(job);
        }
        for key in &keys {
            self.inner.queue.cancel_by_key(key);
        }
    }

    fn set_status(&self, relative: &str, status: PathStatus) {
        let changed = self.index().set_status(relative, status);
        if changed {
            let _ = self.inner.events.send(EngineEvent::StatusChanged {
                path: relative.to_string(),
                status,
            });
        }
    }

    fn job_failed(&self, local: Option<&Path>, remote: &str, kind: JobKind, err: JobError) {
        let relative = self.bound().and_then(|bound| {
            local
                .and_then(|path| relative_path(&bound.target.local_root, path))
                .or_else(|| relative_remote(&bound.target.remote_root, remote))
        });
        let path = relative.unwrap_or_else(|| remote.to_string());
        match &self.inner.log_path {
            Some(log) => error!(
                "{} of {} failed: {} (details in {})",
                kind,
                path,
                err,
                log.display()
            ),
            None => error!("{} of {} failed: {}", kind, path, err),
        }
        self.set_status(&path, PathStatus::Error);
        let _ = self.inner.events.send(EngineEvent::JobFailed {
            path,
            kind,
            error: err,
            log_path: self.inner.log_path.clone(),
        });
    }
}

async fn queue_listener(weak: Weak<EngineInner>, mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("engine missed {} queue events", skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let engine = SyncEngine::from_inner(inner);
        match event {
            QueueEvent::JobStarted(_) => {
                if let Some(bound) = engine.bound() {
                    bound.manager.mark_syncing();
                }
            }
            QueueEvent::QueueChanged(snapshot) if snapshot.total == 0 => {
                if let Some(bound) = engine.bound() {
                    bound.manager.mark_idle();
                }
            }
            QueueEvent::JobFailed { job, error } => {
                engine.job_failed(job.local_path.as_deref(), &job.remote_path, job.kind, error);
            }
            _ => {}
        }
    }
}

async fn connection_listener(weak: Weak<EngineInner>, mut states: watch::Receiver<ConnectionState>) {
    loop {
        let state = *states.borrow_and_update();
        {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            SyncEngine::from_inner(inner).apply_connection_state(state);
        }
        if states.changed().await.is_err() {
            return;
        }
    }
}

include!("engine_impl_core.rs");
include!("engine_impl_ops.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
