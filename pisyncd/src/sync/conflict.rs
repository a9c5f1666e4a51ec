use time::OffsetDateTime;
use time::macros::format_description;

use super::index::SyncSignature;

const LOCAL_MARKER: &str = ".conflict-local-";
const REMOTE_MARKER: &str = ".conflict-remote-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDecision {
    /// Local and remote already agree.
    InSync,
    Transfer,
    /// Both sides moved away from the baseline independently.
    Conflict,
}

pub fn decide_push(
    baseline: Option<&SyncSignature>,
    local: &SyncSignature,
    remote: Option<&SyncSignature>,
) -> PushDecision {
    let Some(remote) = remote else {
        return PushDecision::Transfer;
    };
    if local == remote {
        return PushDecision::InSync;
    }
    match baseline {
        Some(base) if base != local && base != remote => PushDecision::Conflict,
        _ => PushDecision::Transfer,
    }
}

/// UTC stamp used in artifact names, e.g. `20240131T235959Z`.
pub fn conflict_stamp(now: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]T[hour][minute][second]Z");
    now.to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Local and remote artifact file names for `file_name`.
pub fn artifact_names(file_name: &str, stamp: &str) -> (String, String) {
    (
        artifact_name(file_name, LOCAL_MARKER, stamp),
        artifact_name(file_name, REMOTE_MARKER, stamp),
    )
}

fn artifact_name(file_name: &str, marker: &str, stamp: &str) -> String {
    if let Some((stem, ext)) = file_name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem}{marker}{stamp}.{ext}");
    }
    format!("{file_name}{marker}{stamp}")
}

pub fn is_conflict_artifact(file_name: &str) -> bool {
    file_name.contains(LOCAL_MARKER) || file_name.contains(REMOTE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(size: u64, mtime: i64) -> SyncSignature {
        SyncSignature { size, mtime }
    }

    #[test]
    fn in_sync_when_local_matches_remote() {
        assert_eq!(
            decide_push(Some(&sig(1, 1)), &sig(2, 2), Some(&sig(2, 2))),
            PushDecision::InSync
        );
    }

    #[test]
    fn transfer_when_remote_is_missing() {
        assert_eq!(decide_push(Some(&sig(1, 1)), &sig(2, 2), None), PushDecision::Transfer);
    }

    #[test]
    fn transfer_when_only_local_changed() {
        assert_eq!(
            decide_push(Some(&sig(1, 1)), &sig(2, 2), Some(&sig(1, 1))),
            PushDecision::Transfer
        );
    }

    #[test]
    fn conflict_when_both_sides_changed() {
        assert_eq!(
            decide_push(Some(&sig(1, 1)), &sig(2, 2), Some(&sig(3, 3))),
            PushDecision::Conflict
        );
    }

    #[test]
    fn transfer_without_baseline() {
        assert_eq!(
            decide_push(None, &sig(2, 2), Some(&sig(3, 3))),
            PushDecision::Transfer
        );
    }

    #[test]
    fn names_artifacts_beside_original() {
        let stamp = conflict_stamp(OffsetDateTime::from_unix_timestamp(1_706_745_599).unwrap());
        assert_eq!(stamp, "20240131T235959Z");
        assert_eq!(
            artifact_names("app.ts", &stamp),
            (
                "app.conflict-local-20240131T235959Z.ts".to_string(),
                "app.conflict-remote-20240131T235959Z.ts".to_string()
            )
        );
        assert_eq!(
            artifact_names("Makefile", "S").0,
            "Makefile.conflict-local-S"
        );
        assert_eq!(artifact_names(".env", "S").1, ".env.conflict-remote-S");
        assert!(is_conflict_artifact("app.conflict-remote-S.ts"));
        assert!(!is_conflict_artifact("app.ts"));
    }
}
