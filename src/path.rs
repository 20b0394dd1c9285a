//! Path mangler: pure functions translating user-visible paths to backing-store
//! version-directory paths and back. No I/O lives here — only the versioning
//! engine touches disk.

use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};

use crate::error::{FsError, FsResult};

/// Suffix appended to every mangled path component.
pub const NODE_SUFFIX: &str = ".node";

/// Sentinel marking a version directory as representing a directory node.
pub const SENTINEL_DIR: &str = "dir";

/// Sentinel marking a version directory (or its directory form) as tombstoned.
pub const SENTINEL_DELETED: &str = "deleted";

/// Translate a user-visible path into its version-directory path under `root`.
///
/// `user_path` must be absolute (start with `/`); repeated separators collapse.
/// `/` itself mangles to `root` unchanged. Fails with [`FsError::NameTooLong`]
/// if the resulting path would exceed `libc::PATH_MAX`.
pub fn version_dir(root: &Path, user_path: &Path) -> FsResult<PathBuf> {
    let mut mangled = root.to_path_buf();
    for component in user_path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => mangled.push(suffixed(part)),
            Component::ParentDir => {
                // The dispatcher never passes ".." through — a defensive no-op
                // keeps this function total rather than panicking on misuse.
            }
            Component::Prefix(_) => {}
        }
    }

    if mangled.as_os_str().len() > libc::PATH_MAX as usize {
        return Err(FsError::NameTooLong);
    }
    Ok(mangled)
}

/// Join a single validated child name onto an already-mangled parent directory.
pub fn join_node(parent_dir: &Path, name: &OsStr) -> FsResult<PathBuf> {
    let mut child = parent_dir.to_path_buf();
    child.push(suffixed(name));
    if child.as_os_str().len() > libc::PATH_MAX as usize {
        return Err(FsError::NameTooLong);
    }
    Ok(child)
}

fn suffixed(part: &OsStr) -> OsString {
    let mut owned = OsString::with_capacity(part.len() + NODE_SUFFIX.len());
    owned.push(part);
    owned.push(NODE_SUFFIX);
    owned
}

/// Strip exactly one trailing `.node` suffix from a raw backing entry name,
/// yielding the user-visible name it represents. Returns `None` for entries
/// that are not mangled children (sentinels, revisions, or foreign files) —
/// that is a filter signal, not an error.
pub fn demangle(entry_name: &OsStr) -> Option<OsString> {
    let bytes = entry_name.as_encoded_bytes();
    let suffix = NODE_SUFFIX.as_bytes();
    if bytes.len() <= suffix.len() || !bytes.ends_with(suffix) {
        return None;
    }
    let stripped = &bytes[..bytes.len() - suffix.len()];
    // Safety-by-construction: `stripped` is a prefix of a valid OsStr that itself
    // came from pushing a NODE_SUFFIX (pure ASCII) onto a valid OsStr, so the
    // split point falls on a valid boundary.
    Some(unsafe { OsStr::from_encoded_bytes_unchecked(stripped) }.to_os_string())
}

/// Parse a revision directory-entry name as a non-negative revision number.
/// Non-numeric names (sentinels, stray files) yield `None` rather than an error —
/// `latest_revision` scans are failure-tolerant by design (§4.3).
pub fn parse_revision(entry_name: &OsStr) -> Option<u64> {
    let s = entry_name.to_str()?;
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_mangles_to_backing_root() {
        let root = Path::new("/srv/store");
        assert_eq!(version_dir(root, Path::new("/")).unwrap(), root);
    }

    #[test]
    fn nested_path_mangles_per_component() {
        let root = Path::new("/srv/store");
        let got = version_dir(root, Path::new("/a/b/c")).unwrap();
        assert_eq!(got, Path::new("/srv/store/a.node/b.node/c.node"));
    }

    #[test]
    fn repeated_separators_collapse() {
        let root = Path::new("/srv/store");
        let got = version_dir(root, Path::new("/a//b///c")).unwrap();
        assert_eq!(got, Path::new("/srv/store/a.node/b.node/c.node"));
    }

    #[test]
    fn mangling_is_injective_for_distinct_paths() {
        let root = Path::new("/srv/store");
        let a = version_dir(root, Path::new("/a/b")).unwrap();
        let b = version_dir(root, Path::new("/ab")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn demangle_strips_trailing_suffix() {
        assert_eq!(demangle(OsStr::new("hello.node")).unwrap(), OsStr::new("hello"));
    }

    #[test]
    fn demangle_rejects_non_mangled_names() {
        assert_eq!(demangle(OsStr::new("dir")), None);
        assert_eq!(demangle(OsStr::new("deleted")), None);
        assert_eq!(demangle(OsStr::new("0")), None);
        assert_eq!(demangle(OsStr::new(".node")), None);
    }

    #[test]
    fn demangle_last_component_round_trips_through_mangle() {
        let root = Path::new("/srv/store");
        let mangled = version_dir(root, Path::new("/report.final")).unwrap();
        let last = mangled.file_name().unwrap();
        assert_eq!(demangle(last).unwrap(), OsStr::new("report.final"));
    }

    #[test]
    fn overlong_path_yields_name_too_long() {
        let root = Path::new("/srv/store");
        let giant = "a".repeat(libc::PATH_MAX as usize);
        let user_path = PathBuf::from(format!("/{giant}"));
        assert_eq!(version_dir(root, &user_path), Err(FsError::NameTooLong));
    }

    #[test]
    fn revision_parsing_tolerates_non_numeric() {
        assert_eq!(parse_revision(OsStr::new("12")), Some(12));
        assert_eq!(parse_revision(OsStr::new("dir")), None);
        assert_eq!(parse_revision(OsStr::new("deleted")), None);
        assert_eq!(parse_revision(OsStr::new("-1")), None);
        assert_eq!(parse_revision(OsStr::new("")), None);
    }
}
