use std::path::{Component, Path, PathBuf};

use pisync_core::join_remote;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Maps `path` (absolute, or relative to `local_root`) to a `/`-separated
/// path under the root. `None` when it falls outside the root or is the
/// root itself.
pub fn relative_path(local_root: &Path, path: &Path) -> Option<String> {
    let relative = if path.is_absolute() {
        path.strip_prefix(local_root).ok()?
    } else {
        path
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn checked_parts(relative: &str) -> Result<Vec<&str>, PathError> {
    let mut parts = Vec::new();
    for part in relative.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(relative.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts)
}

pub fn local_path_for(local_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let mut out = local_root.to_path_buf();
    for part in checked_parts(relative)? {
        out.push(part);
    }
    Ok(out)
}

pub fn remote_path_for(remote_root: &str, relative: &str) -> Result<String, PathError> {
    Ok(checked_parts(relative)?
        .into_iter()
        .fold(remote_root.to_string(), |acc, part| join_remote(&acc, part)))
}

/// Maps a remote path (absolute under `remote_root`, or already relative)
/// to a relative path.
pub fn relative_remote(remote_root: &str, remote: &str) -> Option<String> {
    let root = remote_root.trim_end_matches('/');
    let stripped = if remote.starts_with('/') {
        let rest = remote.strip_prefix(root)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        rest
    } else {
        remote
    };
    let parts = checked_parts(stripped).ok()?;
    Some(parts.join("/"))
}

/// Remote directories from the top of `remote_root` down to the parent of
/// `relative`, each an absolute path.
pub fn remote_ancestors(remote_root: &str, relative: &str) -> Result<Vec<String>, PathError> {
    let parts = checked_parts(relative)?;
    let mut dirs = Vec::new();
    let mut current = String::new();
    for part in remote_root.split('/').filter(|part| !part.is_empty()) {
        current = join_remote(&current, part);
        dirs.push(current.clone());
    }
    if current.is_empty() {
        current = "/".to_string();
    }
    for part in &parts[..parts.len() - 1] {
        current = join_remote(&current, part);
        dirs.push(current.clone());
    }
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_stay_under_root() {
        let root = PathBuf::from("/home/me/site");
        assert_eq!(
            relative_path(&root, Path::new("/home/me/site/src/app.ts")),
            Some("src/app.ts".to_string())
        );
        assert_eq!(
            relative_path(&root, Path::new("src/./app.ts")),
            Some("src/app.ts".to_string())
        );
        assert_eq!(relative_path(&root, Path::new("/home/me/other/a")), None);
        assert_eq!(relative_path(&root, Path::new("/home/me/site")), None);
        assert_eq!(relative_path(&root, Path::new("../escape")), None);
    }

    #[test]
    fn maps_relative_path_under_both_roots() {
        let root = PathBuf::from("/cache");
        assert_eq!(
            local_path_for(&root, "Docs/A.txt").unwrap(),
            PathBuf::from("/cache/Docs/A.txt")
        );
        assert_eq!(
            remote_path_for("/srv/app", "Docs/A.txt").unwrap(),
            "/srv/app/Docs/A.txt"
        );
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(matches!(
            local_path_for(Path::new("/cache"), "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert_eq!(remote_path_for("/srv", ""), Err(PathError::Empty));
    }

    #[test]
    fn strips_remote_root() {
        assert_eq!(
            relative_remote("/srv/app", "/srv/app/a/b.txt"),
            Some("a/b.txt".to_string())
        );
        assert_eq!(relative_remote("/srv/app", "a/b.txt"), Some("a/b.txt".to_string()));
        assert_eq!(relative_remote("/srv/app", "/srv/application/x"), None);
        assert_eq!(relative_remote("/srv/app", "/etc/passwd"), None);
    }

    #[test]
    fn lists_remote_ancestors_top_down() {
        assert_eq!(
            remote_ancestors("/srv/app", "a/b/c.txt").unwrap(),
            vec!["/srv", "/srv/app", "/srv/app/a", "/srv/app/a/b"]
        );
        assert_eq!(remote_ancestors("/", "c.txt").unwrap(), Vec::<String>::new());
        assert_eq!(remote_ancestors("/", "d/c.txt").unwrap(), vec!["/d"]);
    }
}
