use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pisync_core::{ErrorClass, RemoteSession, SessionError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::debounce::Suppressor;
use super::job::JobError;

/// Appended to in-flight transfer targets on either side.
pub const TEMP_SUFFIX: &str = ".pisync-tmp";

pub fn temp_local_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

pub fn temp_remote_path(remote: &str) -> String {
    format!("{remote}{TEMP_SUFFIX}")
}

/// A session borrowed for one job attempt. Every call is time-boxed and
/// connection-class failures are reported back to the manager.
pub struct RemoteCall<'a> {
    manager: &'a ConnectionManager,
    session: Arc<dyn RemoteSession>,
    timeout: Duration,
    cancel: &'a CancellationToken,
}

impl<'a> RemoteCall<'a> {
    pub async fn open(
        manager: &'a ConnectionManager,
        cancel: &'a CancellationToken,
    ) -> Result<Self, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let session = manager
            .get_session()
            .await
            .map_err(|err| JobError::Connection(err.to_string()))?;
        Ok(Self {
            manager,
            session,
            timeout: manager.operation_timeout(),
            cancel,
        })
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    pub async fn run<T, F>(&self, op: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.classify(err)),
            Err(_) => Err(JobError::Timeout(self.timeout)),
        }
    }

    fn classify(&self, err: SessionError) -> JobError {
        match err.classification() {
            ErrorClass::NotFound => JobError::NotFound(err.to_string()),
            ErrorClass::Connection => {
                self.manager.report_failure(&self.session, &err);
                JobError::Connection(err.to_string())
            }
            ErrorClass::Transfer => JobError::Transfer(err.to_string()),
        }
    }
}

/// Uploads to a temporary sibling, then renames onto `remote`.
pub async fn upload_atomic(call: &RemoteCall<'_>, local: &Path, remote: &str) -> Result<(), JobError> {
    let temp = temp_remote_path(remote);
    call.run(call.session().put(local, &temp)).await?;
    if let Err(err) = call.run(call.session().rename(&temp, remote)).await {
        if let Err(cleanup) = call.run(call.session().unlink(&temp)).await {
            debug!("could not remove {}: {}", temp, cleanup);
        }
        return Err(err);
    }
    Ok(())
}

/// Downloads to a temporary sibling, then renames onto `local`. Both local
/// paths are suppressed so their change notifications are ignored.
pub async fn download_atomic(
    call: &RemoteCall<'_>,
    remote: &str,
    local: &Path,
    suppressor: &Suppressor,
) -> Result<(), JobError> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_local_path(local);
    suppressor.suppress(&temp);
    suppressor.suppress(local);

    if let Err(err) = call.run(call.session().get(remote, &temp)).await {
        if let Err(cleanup) = tokio::fs::remove_file(&temp).await
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            warn!("could not remove {}: {}", temp.display(), cleanup);
        }
        return Err(err);
    }
    tokio::fs::rename(&temp, local).await?;
    // Restart the window now that the file is in place.
    suppressor.suppress(local);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::backoff::Backoff;
    use crate::sync::connection::{ConnectionState, ManagerOptions, ManagerSettings};
    use crate::sync::registry::{Credential, SyncTarget};
    use pisync_core::memory::{Fault, MemoryRemote};
    use tempfile::tempdir;

    fn manager(remote: &MemoryRemote) -> ConnectionManager {
        ConnectionManager::new(
            ManagerSettings {
                target: SyncTarget {
                    host: "pi.local".into(),
                    port: 22,
                    username: "pi".into(),
                    credential: Credential {
                        password: Some("pw".into()),
                        private_key_path: None,
                    },
                    remote_root: "/srv/app".into(),
                    local_root: PathBuf::from("/tmp/app"),
                },
                connect_timeout: Duration::from_secs(1),
                operation_timeout: Duration::from_millis(200),
            },
            Arc::new(remote.clone()),
            ManagerOptions {
                keepalive_interval: Duration::from_secs(60),
                reconnect_backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(5)),
            },
        )
    }

    #[test]
    fn temp_paths_append_suffix() {
        assert_eq!(
            temp_local_path(Path::new("/a/b.txt")),
            PathBuf::from("/a/b.txt.pisync-tmp")
        );
        assert_eq!(temp_remote_path("/srv/b.txt"), "/srv/b.txt.pisync-tmp");
    }

    #[tokio::test]
    async fn upload_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"hello").unwrap();
        let remote = MemoryRemote::new();
        remote.mkdir_all("/srv/app");
        let manager = manager(&remote);
        let cancel = CancellationToken::new();

        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        upload_atomic(&call, &local, "/srv/app/a.txt").await.unwrap();
        assert_eq!(remote.read_file("/srv/app/a.txt").unwrap(), b"hello");
        assert_eq!(remote.files(), vec!["/srv/app/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn failed_rename_removes_remote_temp() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"hello").unwrap();
        let remote = MemoryRemote::new();
        remote.mkdir_all("/srv/app");
        remote.fail_next("rename", Fault::Transfer);
        let manager = manager(&remote);
        let cancel = CancellationToken::new();

        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        let err = upload_atomic(&call, &local, "/srv/app/a.txt").await.unwrap_err();
        assert!(matches!(err, JobError::Transfer(_)));
        assert!(remote.files().is_empty());
    }

    #[tokio::test]
    async fn download_keeps_remote_mtime_and_suppresses_paths() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("nested/a.txt");
        let remote = MemoryRemote::new();
        remote.write_file("/srv/app/nested/a.txt", b"data", 1_700_000_000);
        let manager = manager(&remote);
        let cancel = CancellationToken::new();
        let suppressor = Suppressor::new(Duration::from_secs(3));

        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        download_atomic(&call, "/srv/app/nested/a.txt", &local, &suppressor)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"data");
        let meta = std::fs::metadata(&local).unwrap();
        assert_eq!(pisync_core::modified_secs(&meta), 1_700_000_000);
        assert!(!temp_local_path(&local).exists());
        assert!(suppressor.is_suppressed(&local));
        assert!(suppressor.is_suppressed(&temp_local_path(&local)));
    }

    #[tokio::test]
    async fn missing_remote_maps_to_not_found() {
        let dir = tempdir().unwrap();
        let remote = MemoryRemote::new();
        let manager = manager(&remote);
        let cancel = CancellationToken::new();
        let suppressor = Suppressor::new(Duration::from_secs(3));

        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        let err = download_atomic(&call, "/srv/app/gone", &dir.path().join("gone"), &suppressor)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
        assert!(!dir.path().join("gone.pisync-tmp").exists());
    }

    #[tokio::test]
    async fn connection_failure_is_reported_to_manager() {
        let remote = MemoryRemote::new();
        let manager = manager(&remote);
        let cancel = CancellationToken::new();

        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        remote.fail_next("stat", Fault::Disconnect);
        let err = call.run(call.session().stat("/srv")).await.unwrap_err();
        assert!(matches!(err, JobError::Connection(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_token_skips_remote_calls() {
        let remote = MemoryRemote::new();
        let manager = manager(&remote);
        let cancel = CancellationToken::new();
        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(
            call.run(call.session().stat("/srv")).await.unwrap_err(),
            JobError::Cancelled
        );
        assert_eq!(remote.call_count("stat"), 0);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let remote = MemoryRemote::new();
        let manager = manager(&remote);
        let cancel = CancellationToken::new();
        let call = RemoteCall::open(&manager, &cancel).await.unwrap();
        remote.set_latency(Duration::from_millis(500));
        assert_eq!(
            call.run(call.session().stat("/srv")).await.unwrap_err(),
            JobError::Timeout(Duration::from_millis(200))
        );
    }
}
