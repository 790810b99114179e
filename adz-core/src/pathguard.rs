//! Path guard: the only defense between the HTTP surface and the host
//! filesystem. A path is accepted iff it is absolute after lexical
//! normalization and equal to, or a strict descendant of, an allow-list root.

use std::path::{Component, Path, PathBuf};

use crate::error::ApiError;

/// Validate a caller-supplied host path against an allow-list.
///
/// Returns the normalized absolute path. Rejections are distinct:
/// `InvalidPath` for non-absolute input, `PathNotAllowed` when no root
/// contains the normalized form.
pub fn validate(path: impl AsRef<Path>, allow: &[PathBuf]) -> Result<PathBuf, ApiError> {
    let path = path.as_ref();
    if !path.is_absolute() {
        return Err(ApiError::InvalidPath(path.display().to_string()));
    }

    let normalized = normalize(path);
    for root in allow {
        if !root.is_absolute() {
            continue;
        }
        // starts_with is component-wise, so /a/b never admits /a/bc.
        if normalized.starts_with(normalize(root)) {
            return Ok(normalized);
        }
    }

    Err(ApiError::PathNotAllowed(normalized.display().to_string()))
}

/// Lexically normalize a path: resolve `.` and `..` segments without
/// touching the filesystem. `..` never climbs above the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.as_os_str() != "/" {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(paths: &[&str]) -> Vec<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn accepts_root_itself_and_descendants() {
        let allow = roots(&["/srv/ws"]);
        assert_eq!(validate("/srv/ws", &allow).unwrap(), PathBuf::from("/srv/ws"));
        assert_eq!(
            validate("/srv/ws/project", &allow).unwrap(),
            PathBuf::from("/srv/ws/project")
        );
    }

    #[test]
    fn rejects_relative_path_distinctly() {
        let err = validate("srv/ws", &roots(&["/srv/ws"])).unwrap_err();
        assert_eq!(err.kind(), "invalid-path");
    }

    #[test]
    fn rejects_path_outside_roots() {
        let err = validate("/etc", &roots(&["/srv/ws"])).unwrap_err();
        assert_eq!(err.kind(), "path-not-allowed");
    }

    #[test]
    fn sibling_prefix_does_not_match() {
        let allow = roots(&["/a/b"]);
        assert!(validate("/a/bc", &allow).is_err());
        assert!(validate("/a/b/c", &allow).is_ok());
    }

    #[test]
    fn dotdot_traversal_is_resolved_before_check() {
        let allow = roots(&["/srv/ws"]);
        let err = validate("/srv/ws/../../etc/passwd", &allow).unwrap_err();
        assert_eq!(err.kind(), "path-not-allowed");

        // Traversal that stays inside the root is fine.
        assert_eq!(
            validate("/srv/ws/a/../b", &allow).unwrap(),
            PathBuf::from("/srv/ws/b")
        );
    }

    #[test]
    fn dotdot_never_climbs_above_root() {
        assert_eq!(normalize(Path::new("/../../x")), PathBuf::from("/x"));
    }

    #[test]
    fn curdir_segments_are_dropped() {
        assert_eq!(normalize(Path::new("/a/./b/.")), PathBuf::from("/a/b"));
    }

    #[test]
    fn empty_allow_list_rejects_everything() {
        assert!(validate("/srv/ws", &[]).is_err());
    }

    #[test]
    fn multiple_roots_any_match_wins() {
        let allow = roots(&["/srv/ws", "/home/agents"]);
        assert!(validate("/home/agents/alice", &allow).is_ok());
    }
}
