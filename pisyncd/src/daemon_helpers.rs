use crate::sync::index::PathStatus;

/// Parses one protocol line. Blank lines and `#` comments yield `None`.
pub fn parse_notification(line: &str) -> Result<Option<Notification>, NotificationError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let require = |name: &'static str| {
        if rest.is_empty() {
            Err(NotificationError::MissingPath(name))
        } else {
            Ok(rest)
        }
    };
    let notification = match verb {
        "changed" => Notification::Changed(PathBuf::from(require("changed")?)),
        "deleted" => Notification::Deleted(PathBuf::from(require("deleted")?)),
        "remote-changed" => Notification::RemoteChanged(require("remote-changed")?.to_string()),
        "renamed" => {
            let rest = require("renamed")?;
            let (from, to) = rest
                .split_once(" -> ")
                .map(|(from, to)| (from.trim(), to.trim()))
                .filter(|(from, to)| !from.is_empty() && !to.is_empty())
                .ok_or_else(|| NotificationError::MalformedRename(rest.to_string()))?;
            Notification::Renamed {
                from: PathBuf::from(from),
                to: PathBuf::from(to),
            }
        }
        other => return Err(NotificationError::Unknown(other.to_string())),
    };
    Ok(Some(notification))
}

/// Hands a notification to the engine. Local changes are ignored while
/// `autoSync` is off.
pub fn dispatch_notification(
    engine: &SyncEngine,
    settings: &SyncSettings,
    notification: Notification,
) -> bool {
    if !settings.auto_sync && !matches!(notification, Notification::RemoteChanged(_)) {
        debug!("auto sync is off; ignoring {:?}", notification);
        return false;
    }
    let local = |path: &Path| resolve_local(&settings.local_path, path);
    match notification {
        Notification::RemoteChanged(value) => {
            match remote_change_target(settings, &value) {
                Some(path) => engine.schedule_sync_file(&path, Direction::Pull),
                None => {
                    warn!("remote change outside {}: {}", settings.remote_path, value);
                    false
                }
            }
        }
        Notification::Changed(path) => engine.schedule_sync_file(&local(&path), Direction::Push),
        Notification::Deleted(path) => engine.schedule_delete(&local(&path)),
        Notification::Renamed { from, to } => engine.schedule_rename(&local(&from), &local(&to)),
    }
}

fn resolve_local(local_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        local_root.join(path)
    }
}

/// Local counterpart of a remote change, given either an absolute remote
/// path under the remote root or a root-relative one.
fn remote_change_target(settings: &SyncSettings, value: &str) -> Option<PathBuf> {
    let relative = relative_remote(&settings.remote_path, value)?;
    local_path_for(&settings.local_path, &relative).ok()
}

fn status_label(status: PathStatus) -> &'static str {
    match status {
        PathStatus::Synced => "synced",
        PathStatus::Pending => "pending",
        PathStatus::Modified => "modified",
        PathStatus::Error => "error",
        PathStatus::None => "none",
    }
}

fn format_engine_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::StatusChanged { path, status } => {
            format!("status {} {}", status_label(*status), path)
        }
        EngineEvent::ConflictDetected(artifact) => format!(
            "conflict {} local={} remote={}",
            artifact.source_path.display(),
            artifact.local_artifact.display(),
            artifact.remote_artifact.display()
        ),
        EngineEvent::JobFailed {
            path,
            kind,
            error,
            log_path,
        } => match log_path {
            Some(log) => format!(
                "failed {} {}: {} (see {})",
                kind.as_str(),
                path,
                error,
                log.display()
            ),
            None => format!("failed {} {}: {}", kind.as_str(), path, error),
        },
    }
}

fn format_connection_event(event: &ConnectionEvent) -> Option<String> {
    match event {
        ConnectionEvent::StateChanged(state) => Some(format!(
            "connection {}",
            match state {
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Connecting => "connecting",
                ConnectionState::Connected => "connected",
                ConnectionState::Syncing => "syncing",
                ConnectionState::Error => "error",
            }
        )),
        ConnectionEvent::ConnectFailed(err) => Some(format!("connection failed: {err}")),
        ConnectionEvent::ReconnectScheduled { .. } => None,
    }
}

/// One-line summary printed after a bulk operation.
pub fn summarize_report(action: &str, report: &SyncReport) -> String {
    let mut summary = format!(
        "{action}: {} completed, {} failed",
        report.completed, report.failed
    );
    if report.cancelled > 0 {
        summary.push_str(&format!(", {} cancelled", report.cancelled));
    }
    if report.conflicts > 0 {
        summary.push_str(&format!(", {} conflicts", report.conflicts));
    }
    summary
}
