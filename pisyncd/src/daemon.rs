use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use pisync_core::{ExecOutput, SshConnector};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::sync::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::sync::engine::{Direction, EngineEvent, EngineOptions, SyncEngine, SyncReport};
use crate::sync::paths::{local_path_for, relative_remote};
use crate::sync::registry::ConnectionRegistry;

/// One line of the notification protocol read from stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Changed(PathBuf),
    Deleted(PathBuf),
    RemoteChanged(String),
    Renamed { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("unknown notification: {0}")]
    Unknown(String),
    #[error("notification `{0}` needs a path")]
    MissingPath(&'static str),
    #[error("rename needs `<from> -> <to>`: {0}")]
    MalformedRename(String),
}

pub struct DaemonRuntime {
    engine: SyncEngine,
    manager: ConnectionManager,
    settings: SyncSettings,
}

impl DaemonRuntime {
    pub async fn bootstrap(settings: SyncSettings, log_path: Option<PathBuf>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&settings.local_path)
            .await
            .with_context(|| format!("failed to create local root at {:?}", settings.local_path))?;

        let registry = Arc::new(ConnectionRegistry::new(Arc::new(SshConnector::new())));
        let engine = SyncEngine::new(
            registry,
            EngineOptions {
                log_path,
                ..EngineOptions::default()
            },
        );
        let manager = engine
            .bind(settings.clone())
            .await
            .context("failed to bind sync target")?;
        let settings = engine.settings();

        Ok(Self {
            engine,
            manager,
            settings,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Follows change notifications on stdin until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            "started: local_root={}, remote={}@{}:{}, auto_sync={}",
            self.settings.local_path.display(),
            self.settings.username,
            self.settings.host,
            self.settings.remote_path,
            self.settings.auto_sync
        );
        self.manager.ensure_connected();
        let reporter = self.spawn_reporter();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    info!("shutdown requested");
                    break;
                }
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => match parse_notification(&line) {
                        Ok(Some(notification)) => {
                            dispatch_notification(&self.engine, &self.settings, notification);
                        }
                        Ok(None) => {}
                        Err(err) => warn!("{}", err),
                    },
                    Ok(None) => {
                        debug!("stdin closed; waiting for Ctrl-C");
                        stdin_open = false;
                    }
                    Err(err) => {
                        warn!("failed reading notifications: {}", err);
                        stdin_open = false;
                    }
                },
            }
        }

        reporter.abort();
        self.engine.shutdown().await;
        Ok(())
    }

    pub async fn sync_all(&self) -> anyhow::Result<SyncReport> {
        self.engine.sync_all().await.context("push of pending changes failed")
    }

    pub async fn pull(&self) -> anyhow::Result<SyncReport> {
        self.engine.sync_pull().await.context("pull failed")
    }

    pub async fn push(&self, path: &Path) -> anyhow::Result<SyncReport> {
        self.engine
            .force_push(path)
            .await
            .with_context(|| format!("force push of {} failed", path.display()))
    }

    /// Runs `command` on the remote, mirroring its output locally. Returns
    /// the remote exit code.
    pub async fn exec(&self, command: &str) -> anyhow::Result<i32> {
        let (sink, mut output) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(chunk) = output.recv().await {
                let written = match chunk {
                    ExecOutput::Stdout(bytes) => stdout.write_all(&bytes).await,
                    ExecOutput::Stderr(bytes) => stderr.write_all(&bytes).await,
                };
                if written.is_err() {
                    break;
                }
            }
            let _ = stdout.flush().await;
            let _ = stderr.flush().await;
        });
        let timeout = self.settings.operation_timeout();
        let code = self
            .manager
            .exec(command, timeout, sink)
            .await
            .with_context(|| format!("remote command failed: {command}"));
        let _ = printer.await;
        code
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }

    /// Prints engine and connection events to stdout for whoever drives the
    /// daemon.
    fn spawn_reporter(&self) -> JoinHandle<()> {
        let mut engine_events = self.engine.subscribe();
        let mut connection_events = self.manager.subscribe();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                let line = tokio::select! {
                    event = engine_events.recv() => match event {
                        Ok(event) => format_engine_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("reporter skipped {} engine events", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    event = connection_events.recv() => match event {
                        Ok(event) => match format_connection_event(&event) {
                            Some(line) => line,
                            None => continue,
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
        })
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
