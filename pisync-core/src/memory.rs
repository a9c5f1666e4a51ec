//! In-memory remote used by tests and local dry runs.
//!
//! A [`MemoryRemote`] is a shared file tree plus knobs for latency, injected
//! faults and dropped sessions. It implements [`Connector`] itself, so one
//! value can be handed to a connection manager and inspected afterwards.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use filetime::FileTime;
use tokio::sync::mpsc;

use crate::session::{
    Connector, ExecOutput, RemoteEntry, RemoteSession, RemoteStat, SessionConfig, SessionError,
    join_remote, modified_secs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The session drops; every later call on it fails too.
    Disconnect,
    Transfer,
    Timeout,
}

type ExecHandler = Arc<dyn Fn(&str) -> (Vec<ExecOutput>, i32) + Send + Sync>;

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mtime: i64,
}

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    calls: HashMap<String, usize>,
    inflight: HashMap<String, usize>,
    max_inflight: HashMap<String, usize>,
    faults: VecDeque<(String, Fault)>,
    generation: u64,
    connects: usize,
    unreachable: bool,
    latency: Duration,
    connect_delay: Duration,
    exec_handler: Option<ExecHandler>,
}

#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        if trimmed.len() > 1 {
            Some("/".to_string())
        } else {
            None
        }
    } else {
        Some(trimmed[..idx].to_string())
    }
}

fn normalize(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

fn is_child_of(path: &str, dir: &str) -> bool {
    if dir == "/" {
        return path.len() > 1 && path.starts_with('/');
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut state = RemoteState::default();
        state.dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Creates `path` and every missing ancestor.
    pub fn mkdir_all(&self, path: &str) {
        let mut state = self.lock();
        let mut current = normalize(path);
        loop {
            state.dirs.insert(current.clone());
            match parent_of(&current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    /// Stores a file directly, creating parent directories.
    pub fn write_file(&self, path: &str, data: &[u8], mtime: i64) {
        if let Some(parent) = parent_of(path) {
            self.mkdir_all(&parent);
        }
        self.lock().files.insert(
            normalize(path),
            MemoryFile {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).map(|f| f.data.clone())
    }

    pub fn stat(&self, path: &str) -> Option<RemoteStat> {
        stat_in(&self.lock(), &normalize(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_some()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(&normalize(path))
    }

    pub fn files(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        let mut state = self.lock();
        state.calls.clear();
        state.max_inflight.clear();
    }

    /// Highest number of simultaneous calls observed for `op`.
    pub fn max_concurrent(&self, op: &str) -> usize {
        self.lock().max_inflight.get(op).copied().unwrap_or(0)
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Delay applied to every file operation.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// While unreachable, connects fail with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// The next call of `op` fails with `fault`.
    pub fn fail_next(&self, op: &str, fault: Fault) {
        self.lock().faults.push_back((op.to_string(), fault));
    }

    /// Invalidates every open session.
    pub fn drop_sessions(&self) {
        self.lock().generation += 1;
    }

    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str) -> (Vec<ExecOutput>, i32) + Send + Sync + 'static,
    {
        self.lock().exec_handler = Some(Arc::new(handler));
    }
}

fn stat_in(state: &RemoteState, path: &str) -> Option<RemoteStat> {
    if let Some(file) = state.files.get(path) {
        return Some(RemoteStat {
            size: file.data.len() as u64,
            mtime: file.mtime,
            is_dir: false,
        });
    }
    state.dirs.contains(path).then_some(RemoteStat {
        size: 0,
        mtime: 0,
        is_dir: true,
    })
}

fn require_parent(state: &RemoteState, path: &str) -> Result<(), SessionError> {
    match parent_of(path) {
        Some(parent) if !state.dirs.contains(&parent) => Err(SessionError::NotFound(parent)),
        _ => Ok(()),
    }
}

#[async_trait]
impl Connector for MemoryRemote {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let (delay, unreachable) = {
            let mut state = self.lock();
            state.connects += 1;
            (state.connect_delay, state.unreachable)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(SessionError::Disconnected(format!(
                "{} unreachable",
                config.address()
            )));
        }
        if config.username.is_empty() {
            return Err(SessionError::Auth("empty username".into()));
        }
        let generation = self.lock().generation;
        Ok(Arc::new(MemorySession {
            remote: self.clone(),
            generation,
        }))
    }
}

pub struct MemorySession {
    remote: MemoryRemote,
    generation: u64,
}

struct CallGuard {
    remote: MemoryRemote,
    op: &'static str,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut state = self.remote.lock();
        if let Some(count) = state.inflight.get_mut(self.op) {
            *count = count.saturating_sub(1);
        }
    }
}

impl MemorySession {
    async fn begin(&self, op: &'static str) -> Result<CallGuard, SessionError> {
        let latency = {
            let mut state = self.remote.lock();
            *state.calls.entry(op.to_string()).or_default() += 1;
            if state.generation != self.generation {
                return Err(SessionError::Disconnected("session dropped".into()));
            }
            if let Some(pos) = state.faults.iter().position(|(name, _)| name == op) {
                let fault = state.faults.remove(pos).map(|(_, fault)| fault);
                match fault {
                    Some(Fault::Disconnect) => {
                        state.generation += 1;
                        return Err(SessionError::Disconnected(format!("{op}: channel closed")));
                    }
                    Some(Fault::Timeout) => {
                        return Err(SessionError::Timeout(format!("{op}: timed out")));
                    }
                    Some(Fault::Transfer) => {
                        return Err(SessionError::Ssh(format!("{op}: failure")));
                    }
                    None => {}
                }
            }
            let inflight = state.inflight.entry(op.to_string()).or_default();
            *inflight += 1;
            let current = *inflight;
            let max = state.max_inflight.entry(op.to_string()).or_default();
            *max = (*max).max(current);
            state.latency
        };
        let guard = CallGuard {
            remote: self.remote.clone(),
            op,
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(guard)
    }
}

fn default_exec(command: &str) -> (Vec<ExecOutput>, i32) {
    let command = command.trim();
    match command {
        ":" | "true" => (Vec::new(), 0),
        "false" => (Vec::new(), 1),
        _ => {
            if let Some(text) = command.strip_prefix("echo ") {
                return (vec![ExecOutput::Stdout(format!("{text}\n").into_bytes())], 0);
            }
            (
                vec![ExecOutput::Stderr(
                    format!("{command}: command not found\n").into_bytes(),
                )],
                127,
            )
        }
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>, SessionError> {
        let _call = self.begin("stat").await?;
        Ok(stat_in(&self.remote.lock(), &normalize(path)))
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let _call = self.begin("put").await?;
        let data = tokio::fs::read(local).await?;
        let mtime = modified_secs(&tokio::fs::metadata(local).await?);
        let path = normalize(remote);
        let mut state = self.remote.lock();
        require_parent(&state, &path)?;
        if state.dirs.contains(&path) {
            return Err(SessionError::Ssh(format!("{path}: is a directory")));
        }
        state.files.insert(path, MemoryFile { data, mtime });
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        let _call = self.begin("get").await?;
        let path = normalize(remote);
        let file = self
            .remote
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or(SessionError::NotFound(path))?;
        tokio::fs::write(local, &file.data).await?;
        filetime::set_file_mtime(local, FileTime::from_unix_time(file.mtime, 0))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SessionError> {
        let _call = self.begin("rename").await?;
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.remote.lock();
        require_parent(&state, &to)?;
        if let Some(file) = state.files.remove(&from) {
            state.files.insert(to, file);
            return Ok(());
        }
        if !state.dirs.contains(&from) {
            return Err(SessionError::NotFound(from));
        }
        let moved_dirs: Vec<String> = state
            .dirs
            .iter()
            .filter(|dir| **dir == from || is_child_of(dir, &from))
            .cloned()
            .collect();
        for dir in moved_dirs {
            state.dirs.remove(&dir);
            state.dirs.insert(format!("{to}{}", &dir[from.len()..]));
        }
        let moved_files: Vec<String> = state
            .files
            .keys()
            .filter(|file| is_child_of(file, &from))
            .cloned()
            .collect();
        for file in moved_files {
            if let Some(entry) = state.files.remove(&file) {
                state.files.insert(format!("{to}{}", &file[from.len()..]), entry);
            }
        }
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), SessionError> {
        let _call = self.begin("unlink").await?;
        let path = normalize(path);
        match self.remote.lock().files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound(path)),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), SessionError> {
        let _call = self.begin("mkdir").await?;
        let path = normalize(path);
        let mut state = self.remote.lock();
        if state.files.contains_key(&path) {
            return Err(SessionError::Ssh(format!("{path}: file exists")));
        }
        require_parent(&state, &path)?;
        state.dirs.insert(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), SessionError> {
        let _call = self.begin("rmdir").await?;
        let path = normalize(path);
        let mut state = self.remote.lock();
        if !state.dirs.contains(&path) {
            return Err(SessionError::NotFound(path));
        }
        let occupied = state.files.keys().any(|f| is_child_of(f, &path))
            || state.dirs.iter().any(|d| is_child_of(d, &path));
        if occupied {
            return Err(SessionError::Ssh(format!("{path}: directory not empty")));
        }
        state.dirs.remove(&path);
        Ok(())
    }

    async fn readdir(&self, path: &str) -> Result<Vec<RemoteEntry>, SessionError> {
        let _call = self.begin("readdir").await?;
        let path = normalize(path);
        let state = self.remote.lock();
        if !state.dirs.contains(&path) {
            return Err(SessionError::NotFound(path));
        }
        let direct = |candidate: &str| {
            is_child_of(candidate, &path) && parent_of(candidate).as_deref() == Some(path.as_str())
        };
        let mut entries: Vec<RemoteEntry> = state
            .dirs
            .iter()
            .filter(|d| direct(d.as_str()))
            .map(|d| RemoteEntry {
                name: d.rsplit('/').next().unwrap_or_default().to_string(),
                is_dir: true,
            })
            .collect();
        entries.extend(state.files.keys().filter(|f| direct(f.as_str())).map(|f| RemoteEntry {
            name: f.rsplit('/').next().unwrap_or_default().to_string(),
            is_dir: false,
        }));
        Ok(entries)
    }

    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<i32, SessionError> {
        let _call = self.begin("exec").await?;
        if let Some(seconds) = command.trim().strip_prefix("sleep ") {
            let seconds: f64 = seconds.trim().parse().unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            return Ok(0);
        }
        let handler = self.remote.lock().exec_handler.clone();
        let (chunks, code) = match handler {
            Some(handler) => handler(command),
            None => default_exec(command),
        };
        for chunk in chunks {
            let _ = output.send(chunk);
        }
        Ok(code)
    }

    async fn close(&self) {
        *self
            .remote
            .lock()
            .calls
            .entry("close".to_string())
            .or_default() += 1;
    }
}

/// Convenience for building a path under a remote directory in tests.
pub fn remote_path(dir: &str, relative: &str) -> String {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(dir.to_string(), |acc, part| join_remote(&acc, part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/a/b"), Some("/a".to_string()));
        assert_eq!(parent_of("/a"), Some("/".to_string()));
        assert_eq!(parent_of("/"), None);
        assert!(is_child_of("/a/b", "/a"));
        assert!(!is_child_of("/ab", "/a"));
        assert!(is_child_of("/a", "/"));
    }

    #[test]
    fn write_file_creates_ancestors() {
        let remote = MemoryRemote::new();
        remote.write_file("/srv/app/conf/a.toml", b"x", 5);
        assert!(remote.is_dir("/srv"));
        assert!(remote.is_dir("/srv/app/conf"));
        assert_eq!(remote.stat("/srv/app/conf/a.toml").map(|s| s.mtime), Some(5));
        assert_eq!(remote_path("/srv/app", "conf/a.toml"), "/srv/app/conf/a.toml");
    }
}
