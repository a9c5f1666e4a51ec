use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::Metadata;
use std::path::PathBuf;

use pisync_core::{RemoteStat, modified_secs};

/// Cheap content identity: byte size plus whole-second modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncSignature {
    pub size: u64,
    pub mtime: i64,
}

impl SyncSignature {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            size: meta.len(),
            mtime: modified_secs(meta),
        }
    }
}

impl From<RemoteStat> for SyncSignature {
    fn from(stat: RemoteStat) -> Self {
        Self {
            size: stat.size,
            mtime: stat.mtime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStatus {
    Synced,
    Pending,
    Modified,
    Error,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictArtifact {
    pub source_path: PathBuf,
    pub local_artifact: PathBuf,
    pub remote_artifact: PathBuf,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    change: PendingChange,
    mark: u64,
}

/// Per-session sync bookkeeping keyed by root-relative path: baselines,
/// the pending-change ledger, path statuses and recorded conflicts.
#[derive(Debug, Default)]
pub struct SyncIndex {
    signatures: HashMap<String, SyncSignature>,
    pending: BTreeMap<String, PendingEntry>,
    statuses: HashMap<String, PathStatus>,
    conflicts: Vec<ConflictArtifact>,
    remote_dirs: HashSet<String>,
    next_mark: u64,
}

fn within(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

impl SyncIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(&self, relative: &str) -> Option<SyncSignature> {
        self.signatures.get(relative).copied()
    }

    pub fn record_signature(&mut self, relative: &str, signature: SyncSignature) {
        self.signatures.insert(relative.to_string(), signature);
    }

    /// Drops the baseline of `relative` and of everything below it.
    pub fn remove_signatures(&mut self, relative: &str) {
        self.signatures.retain(|path, _| !within(path, relative));
    }

    /// Moves baselines from `from` (and its descendants) to `to`.
    pub fn rename_signatures(&mut self, from: &str, to: &str) {
        let moved: Vec<(String, SyncSignature)> = self
            .signatures
            .iter()
            .filter(|(path, _)| within(path, from))
            .map(|(path, sig)| (format!("{to}{}", &path[from.len()..]), *sig))
            .collect();
        self.remove_signatures(from);
        self.signatures.extend(moved);
    }

    /// Forgets everything tied to a particular remote.
    pub fn clear_baselines(&mut self) {
        self.signatures.clear();
        self.remote_dirs.clear();
    }

    /// Records intent for `relative` and returns a mark identifying this
    /// notification.
    pub fn mark_pending(&mut self, relative: &str, change: PendingChange) -> u64 {
        self.next_mark += 1;
        let mark = self.next_mark;
        self.pending
            .insert(relative.to_string(), PendingEntry { change, mark });
        mark
    }

    pub fn pending(&self, relative: &str) -> Option<PendingChange> {
        self.pending.get(relative).map(|entry| entry.change)
    }

    pub fn pending_mark(&self, relative: &str) -> Option<u64> {
        self.pending.get(relative).map(|entry| entry.mark)
    }

    /// Clears the entry only if no newer notification arrived since `mark`.
    pub fn clear_pending_if(&mut self, relative: &str, mark: Option<u64>) -> bool {
        let current = self.pending_mark(relative);
        if current.is_some() && current == mark {
            self.pending.remove(relative);
            return true;
        }
        false
    }

    pub fn clear_pending(&mut self, relative: &str) {
        self.pending.remove(relative);
    }

    /// Ledger snapshot in path order.
    pub fn pending_changes(&self) -> Vec<(String, PendingChange)> {
        self.pending
            .iter()
            .map(|(path, entry)| (path.clone(), entry.change))
            .collect()
    }

    pub fn status(&self, relative: &str) -> PathStatus {
        self.statuses.get(relative).copied().unwrap_or_default()
    }

    /// Returns whether the status changed.
    pub fn set_status(&mut self, relative: &str, status: PathStatus) -> bool {
        let previous = if status == PathStatus::None {
            self.statuses.remove(relative)
        } else {
            self.statuses.insert(relative.to_string(), status)
        };
        previous.unwrap_or_default() != status
    }

    pub fn record_conflict(&mut self, artifact: ConflictArtifact) {
        self.conflicts.push(artifact);
    }

    pub fn conflicts(&self) -> &[ConflictArtifact] {
        &self.conflicts
    }

    /// Drops the records for `source`; returns whether any existed.
    pub fn resolve_conflicts(&mut self, source: &std::path::Path) -> bool {
        let before = self.conflicts.len();
        self.conflicts.retain(|artifact| artifact.source_path.as_path() != source);
        self.conflicts.len() != before
    }

    pub fn knows_remote_dir(&self, dir: &str) -> bool {
        self.remote_dirs.contains(dir)
    }

    pub fn remember_remote_dir(&mut self, dir: &str) {
        self.remote_dirs.insert(dir.to_string());
    }

    /// Forgets `dir` and every cached directory below it.
    pub fn forget_remote_dirs(&mut self, dir: &str) {
        self.remote_dirs.retain(|known| !within(known, dir));
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
