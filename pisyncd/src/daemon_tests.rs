use super::*;
use crate::sync::backoff::Backoff;
use crate::sync::connection::ManagerOptions;
use crate::sync::engine::EngineTimings;
use crate::sync::index::ConflictArtifact;
use crate::sync::job::{JobError, JobKind};
use pisync_core::memory::MemoryRemote;
use std::time::Duration;
use tempfile::TempDir;

async fn bound_engine(auto_sync: bool) -> (SyncEngine, SyncSettings, MemoryRemote, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    remote.mkdir_all("/home/pi/site");
    let registry = Arc::new(ConnectionRegistry::with_options(
        Arc::new(remote.clone()),
        ManagerOptions {
            keepalive_interval: Duration::from_secs(60),
            reconnect_backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
        },
    ));
    let engine = SyncEngine::new(
        registry,
        EngineOptions {
            timings: EngineTimings {
                debounce: Duration::from_millis(20),
                suppression: Duration::from_millis(500),
            },
            ..EngineOptions::default()
        },
    );
    let settings = SyncSettings {
        auto_sync,
        host: "raspberrypi".into(),
        username: "pi".into(),
        password: Some("secret".into()),
        remote_path: "/home/pi/site".into(),
        local_path: dir.path().to_path_buf(),
        exclusions: Vec::new(),
        ..SyncSettings::default()
    };
    engine.bind(settings.clone()).await.unwrap();
    (engine, settings, remote, dir)
}

#[test]
fn parses_each_notification_kind() {
    assert_eq!(
        parse_notification("changed src/app.ts").unwrap(),
        Some(Notification::Changed("src/app.ts".into()))
    );
    assert_eq!(
        parse_notification("  deleted /home/me/site/old file.txt  ").unwrap(),
        Some(Notification::Deleted("/home/me/site/old file.txt".into()))
    );
    assert_eq!(
        parse_notification("remote-changed /home/pi/site/index.html").unwrap(),
        Some(Notification::RemoteChanged("/home/pi/site/index.html".into()))
    );
    assert_eq!(
        parse_notification("renamed a b.txt -> c.txt").unwrap(),
        Some(Notification::Renamed {
            from: "a b.txt".into(),
            to: "c.txt".into()
        })
    );
}

#[test]
fn skips_blank_lines_and_comments() {
    assert_eq!(parse_notification("").unwrap(), None);
    assert_eq!(parse_notification("   ").unwrap(), None);
    assert_eq!(parse_notification("# changed a.txt").unwrap(), None);
}

#[test]
fn rejects_malformed_notifications() {
    assert_eq!(
        parse_notification("touched a.txt"),
        Err(NotificationError::Unknown("touched".into()))
    );
    assert_eq!(
        parse_notification("changed"),
        Err(NotificationError::MissingPath("changed"))
    );
    assert_eq!(
        parse_notification("renamed a.txt"),
        Err(NotificationError::MalformedRename("a.txt".into()))
    );
    assert!(matches!(
        parse_notification("renamed  -> b.txt"),
        Err(NotificationError::MalformedRename(_))
    ));
}

#[tokio::test]
async fn relative_change_marks_path_pending() {
    let (engine, settings, _remote, dir) = bound_engine(true).await;
    let path = dir.path().join("index.html");
    std::fs::write(&path, b"<html>").unwrap();

    assert!(dispatch_notification(
        &engine,
        &settings,
        Notification::Changed("index.html".into())
    ));
    assert_eq!(engine.status(&path), PathStatus::Pending);
    engine.shutdown().await;
}

#[tokio::test]
async fn local_changes_are_ignored_without_auto_sync() {
    let (engine, settings, _remote, dir) = bound_engine(false).await;
    let path = dir.path().join("index.html");
    std::fs::write(&path, b"<html>").unwrap();

    assert!(!dispatch_notification(
        &engine,
        &settings,
        Notification::Changed(path.clone())
    ));
    assert!(!dispatch_notification(
        &engine,
        &settings,
        Notification::Deleted(path.clone())
    ));
    assert_eq!(engine.status(&path), PathStatus::None);
    engine.shutdown().await;
}

#[tokio::test]
async fn remote_change_downloads_even_without_auto_sync() {
    let (engine, settings, remote, dir) = bound_engine(false).await;
    remote.write_file("/home/pi/site/data/readings.csv", b"t,v\n1,2\n", 1_700_000_000);

    assert!(dispatch_notification(
        &engine,
        &settings,
        Notification::RemoteChanged("/home/pi/site/data/readings.csv".into())
    ));
    let local = dir.path().join("data/readings.csv");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !local.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("download");
    engine.queue().wait_idle().await;
    assert_eq!(std::fs::read(&local).unwrap(), b"t,v\n1,2\n");
    engine.shutdown().await;
}

#[tokio::test]
async fn remote_change_outside_root_is_dropped() {
    let (engine, settings, _remote, _dir) = bound_engine(true).await;
    assert!(!dispatch_notification(
        &engine,
        &settings,
        Notification::RemoteChanged("/etc/passwd".into())
    ));
    engine.shutdown().await;
}

#[test]
fn remote_change_accepts_root_relative_paths() {
    let settings = SyncSettings {
        remote_path: "/home/pi/site".into(),
        local_path: "/work/site".into(),
        ..SyncSettings::default()
    };
    assert_eq!(
        remote_change_target(&settings, "css/main.css"),
        Some(PathBuf::from("/work/site/css/main.css"))
    );
    assert_eq!(
        remote_change_target(&settings, "/home/pi/site/css/main.css"),
        Some(PathBuf::from("/work/site/css/main.css"))
    );
    assert_eq!(remote_change_target(&settings, "/home/pi/other/x"), None);
}

#[test]
fn failure_lines_point_at_the_log() {
    let line = format_engine_event(&EngineEvent::JobFailed {
        path: "a.txt".into(),
        kind: JobKind::Upload,
        error: JobError::Transfer("disk full".into()),
        log_path: Some(PathBuf::from("/var/log/pisyncd.log")),
    });
    assert_eq!(
        line,
        "failed UPLOAD a.txt: transfer failed: disk full (see /var/log/pisyncd.log)"
    );

    let line = format_engine_event(&EngineEvent::ConflictDetected(ConflictArtifact {
        source_path: "/w/a.txt".into(),
        local_artifact: "/w/a.conflict-local-S.txt".into(),
        remote_artifact: "/w/a.conflict-remote-S.txt".into(),
    }));
    assert!(line.starts_with("conflict /w/a.txt local="));
}

#[test]
fn connection_lines_skip_reconnect_scheduling() {
    assert_eq!(
        format_connection_event(&ConnectionEvent::StateChanged(ConnectionState::Connected)),
        Some("connection connected".to_string())
    );
    assert_eq!(
        format_connection_event(&ConnectionEvent::ReconnectScheduled {
            attempt: 2,
            delay: Duration::from_secs(2),
        }),
        None
    );
}

#[test]
fn report_summary_mentions_only_nonzero_extras() {
    let report = SyncReport {
        completed: 4,
        failed: 1,
        cancelled: 0,
        conflicts: 2,
    };
    assert_eq!(
        summarize_report("push", &report),
        "push: 4 completed, 1 failed, 2 conflicts"
    );
}
