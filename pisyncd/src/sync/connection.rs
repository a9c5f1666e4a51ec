use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use pisync_core::{Connector, ErrorClass, ExecOutput, RemoteSession, SessionConfig, SessionError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::registry::SyncTarget;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const KEEPALIVE_COMMAND: &str = ":";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Syncing,
    Error,
}

impl ConnectionState {
    /// Whether jobs may be dispatched against the session.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Syncing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    ConnectFailed(ConnectionError),
    ReconnectScheduled { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection was closed by the user")]
    ManuallyDisconnected,
    #[error("connection manager was disposed")]
    Disposed,
    #[error("remote command timed out after {0:?}")]
    CommandTimeout(Duration),
}

impl From<SessionError> for ConnectionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Auth(message) => ConnectionError::Auth(message),
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}

/// Settings that may change without recreating the manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub target: SyncTarget,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl ManagerSettings {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            password: self.target.credential.password.clone(),
            private_key_path: self.target.credential.private_key_path.clone(),
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
        }
    }
}

/// Timers owned by the manager; tests shorten them.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub keepalive_interval: Duration,
    pub reconnect_backoff: Backoff,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            reconnect_backoff: Backoff::reconnect(),
        }
    }
}

type ConnectResult = Result<Arc<dyn RemoteSession>, ConnectionError>;
type ConnectFuture = Shared<BoxFuture<'static, ConnectResult>>;

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn RemoteSession>>,
    connecting: Option<ConnectFuture>,
    retry_attempt: u32,
    manual: bool,
    disposed: bool,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Slot {
    fn reconnect_pending(&self) -> bool {
        self.reconnect
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stop_timers(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct Inner {
    key: String,
    settings: RwLock<ManagerSettings>,
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    slot: Mutex<Slot>,
}

/// Owns the single logical session for one sync target.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
        options: ManagerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                key: settings.target.key(),
                settings: RwLock::new(settings),
                connector,
                options,
                state,
                events,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        match self.inner.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn settings(&self) -> ManagerSettings {
        match self.inner.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn target(&self) -> SyncTarget {
        self.settings().target
    }

    pub fn operation_timeout(&self) -> Duration {
        self.settings().operation_timeout
    }

    /// Replaces credentials and timeouts; the open session is kept.
    pub fn refresh_settings(&self, settings: ManagerSettings) {
        match self.inner.settings.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_manually_disconnected(&self) -> bool {
        self.slot().manual
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!("connection {} -> {:?}", self.inner.key, next);
            let _ = self.inner.events.send(ConnectionEvent::StateChanged(next));
        }
    }

    /// Returns the live session, connecting first when needed. Concurrent
    /// callers share one connection attempt.
    pub async fn get_session(&self) -> Result<Arc<dyn RemoteSession>, ConnectionError> {
        let attempt = {
            let mut slot = self.slot();
            if slot.disposed {
                return Err(ConnectionError::Disposed);
            }
            if slot.manual {
                return Err(ConnectionError::ManuallyDisconnected);
            }
            if let Some(session) = &slot.session {
                return Ok(Arc::clone(session));
            }
            self.start_connect(&mut slot)
        };
        attempt.await
    }

    /// Starts connecting in the background unless a session, an attempt or
    /// a scheduled reconnect already exists.
    pub fn ensure_connected(&self) {
        let mut slot = self.slot();
        if slot.disposed
            || slot.manual
            || slot.session.is_some()
            || slot.connecting.is_some()
            || slot.reconnect_pending()
        {
            return;
        }
        let _ = self.start_connect(&mut slot);
    }

    /// Explicit connect request; clears a previous manual disconnect.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.slot().manual = false;
        self.get_session().await.map(|_| ())
    }

    fn start_connect(&self, slot: &mut Slot) -> ConnectFuture {
        if let Some(attempt) = &slot.connecting {
            return attempt.clone();
        }
        if let Some(handle) = slot.reconnect.take() {
            handle.abort();
        }
        let manager = self.clone();
        let task = tokio::spawn(async move { manager.connect_once().await });
        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(ConnectionError::Transport(format!(
                    "connect task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        slot.connecting = Some(attempt.clone());
        attempt
    }

    async fn connect_once(&self) -> ConnectResult {
        self.set_state(ConnectionState::Connecting);
        let settings = self.settings();
        let config = settings.session_config();
        info!(
            "connecting to {} as {}",
            config.address(),
            config.username
        );

        let result = match tokio::time::timeout(
            settings.connect_timeout,
            self.inner.connector.connect(&config),
        )
        .await
        {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(err)) => Err(ConnectionError::from(err)),
            Err(_) => Err(ConnectionError::Timeout(settings.connect_timeout)),
        };

        let mut slot = self.slot();
        slot.connecting = None;
        match result {
            Ok(session) => {
                if slot.disposed || slot.manual {
                    let refused = if slot.disposed {
                        ConnectionError::Disposed
                    } else {
                        ConnectionError::ManuallyDisconnected
                    };
                    drop(slot);
                    tokio::spawn(async move { session.close().await });
                    return Err(refused);
                }
                slot.session = Some(Arc::clone(&session));
                slot.retry_attempt = 0;
                if let Some(handle) = slot.keepalive.take() {
                    handle.abort();
                }
                slot.keepalive = Some(tokio::spawn(keepalive_loop(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&session),
                    self.inner.options.keepalive_interval,
                )));
                drop(slot);
                info!("connected to {}", config.address());
                self.set_state(ConnectionState::Connected);
                Ok(session)
            }
            Err(err) => {
                let suppressed = slot.disposed || slot.manual;
                drop(slot);
                if suppressed {
                    return Err(err);
                }
                warn!("connection to {} failed: {}", config.address(), err);
                self.set_state(ConnectionState::Error);
                let _ = self
                    .inner
                    .events
                    .send(ConnectionEvent::ConnectFailed(err.clone()));
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    fn schedule_reconnect(&self) {
        let mut slot = self.slot();
        if slot.manual || slot.disposed || slot.reconnect_pending() || slot.session.is_some() {
            return;
        }
        let attempt = slot.retry_attempt;
        let delay = self.inner.options.reconnect_backoff.delay(attempt);
        slot.retry_attempt = attempt.saturating_add(1);
        let weak = Arc::downgrade(&self.inner);
        slot.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = ConnectionManager::from_inner(inner);
            manager.slot().reconnect = None;
            if let Err(err) = manager.get_session().await {
                debug!("reconnect attempt failed: {err}");
            }
        }));
        drop(slot);
        info!(
            "reconnecting to {} in {:?} (attempt {})",
            self.inner.key,
            delay,
            attempt + 1
        );
        let _ = self.inner.events.send(ConnectionEvent::ReconnectScheduled {
            attempt: attempt + 1,
            delay,
        });
    }

    /// Reports a failure observed on `session`. Connection-class failures
    /// drop the session and schedule a reconnect.
    pub fn report_failure(&self, session: &Arc<dyn RemoteSession>, err: &SessionError) {
        if err.classification() != ErrorClass::Connection {
            return;
        }
        self.session_lost(session, &err.to_string());
    }

    fn session_lost(&self, session: &Arc<dyn RemoteSession>, reason: &str) {
        let lost = {
            let mut slot = self.slot();
            let current = slot
                .session
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(live, session));
            if !current {
                return;
            }
            if let Some(handle) = slot.keepalive.take() {
                handle.abort();
            }
            slot.session.take()
        };
        warn!("session to {} lost: {}", self.inner.key, reason);
        if let Some(session) = lost {
            tokio::spawn(async move { session.close().await });
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    /// User-initiated disconnect; no reconnect until `connect` is called.
    pub async fn disconnect(&self) {
        let session = {
            let mut slot = self.slot();
            slot.manual = true;
            slot.connecting = None;
            slot.stop_timers();
            slot.session.take()
        };
        self.set_state(ConnectionState::Disconnected);
        if let Some(session) = session {
            session.close().await;
            info!("disconnected from {}", self.inner.key);
        }
    }

    pub async fn dispose(&self) {
        self.slot().disposed = true;
        self.disconnect().await;
    }

    /// Connected -> Syncing; any other state is left alone.
    pub fn mark_syncing(&self) {
        self.transition(ConnectionState::Connected, ConnectionState::Syncing);
    }

    /// Syncing -> Connected.
    pub fn mark_idle(&self) {
        self.transition(ConnectionState::Syncing, ConnectionState::Connected);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current != from {
                return false;
            }
            *current = to;
            true
        });
        if changed {
            debug!("connection {} -> {:?}", self.inner.key, to);
            let _ = self.inner.events.send(ConnectionEvent::StateChanged(to));
        }
    }

    /// Runs `command` on the remote, streaming output chunks into `output`.
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<i32, ConnectionError> {
        let session = self.get_session().await?;
        match tokio::time::timeout(timeout, session.exec(command, output)).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(err)) => {
                self.report_failure(&session, &err);
                Err(ConnectionError::from(err))
            }
            Err(_) => Err(ConnectionError::CommandTimeout(timeout)),
        }
    }
}

async fn keepalive_loop(inner: Weak<Inner>, session: Arc<dyn RemoteSession>, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        ticker.tick().await;
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager::from_inner(strong);
        let timeout = manager.operation_timeout();
        let (sink, _drain) = mpsc::unbounded_channel();
        match tokio::time::timeout(timeout, session.exec(KEEPALIVE_COMMAND, sink)).await {
            Ok(Ok(_)) => debug!("keepalive ok for {}", manager.key()),
            Ok(Err(err)) if err.classification() == ErrorClass::Connection => {
                warn!("keepalive for {} failed: {}", manager.key(), err);
                manager.session_lost(&session, &err.to_string());
                return;
            }
            Ok(Err(err)) => warn!("keepalive for {} failed: {}", manager.key(), err),
            Err(_) => warn!("keepalive for {} timed out", manager.key()),
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
