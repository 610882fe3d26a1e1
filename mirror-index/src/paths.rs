//! Conversion between absolute filesystem paths and index paths
//!
//! Index paths are relative to the watched root, use `/` as separator on
//! every platform and never start or end with one.

use std::path::{Component, Path, PathBuf};

use crate::errors::{IndexError, Result};

/// Separator used inside index paths
pub const SEPARATOR: char = '/';

/// Relative index path for `path`, or `None` when it is not strictly below `root`.
///
/// Names that are not valid UTF-8 cannot be stored without loss and are
/// rejected as malformed.
pub fn to_relative(root: &Path, path: &Path) -> Result<Option<String>> {
    let Ok(stripped) = path.strip_prefix(root) else {
        return Ok(None);
    };

    let mut parts = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(IndexError::MalformedEvent(format!(
                        "{:?} is not valid UTF-8",
                        path
                    )))
                }
            },
            Component::CurDir => {}
            _ => return Ok(None),
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

/// Absolute path of an index path under `root`
pub fn to_absolute(root: &Path, relative: &str) -> PathBuf {
    relative
        .split(SEPARATOR)
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Final component of an index path
pub fn base_name(relative: &str) -> &str {
    relative.rsplit(SEPARATOR).next().unwrap_or(relative)
}

/// Whether `path` equals `prefix` or lies underneath it
pub fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path[prefix.len()..].starts_with(SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths() {
        let root = Path::new("/data/root");

        let relative = |path: &str| to_relative(root, Path::new(path)).unwrap();

        assert_eq!(relative("/data/root/docs/a.txt").as_deref(), Some("docs/a.txt"));
        assert_eq!(relative("/data/root"), None);
        assert_eq!(relative("/data/other/a.txt"), None);
        assert_eq!(relative("/data/root2/a.txt"), None);
        assert_eq!(relative("/data/root/../x"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_name_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = Path::new("/data/root");
        let path = root.join(OsStr::from_bytes(b"bad\xffname.txt"));
        assert!(matches!(
            to_relative(root, &path),
            Err(IndexError::MalformedEvent(_))
        ));

        // Outside the root is still not an error
        let outside = Path::new("/data/other").join(OsStr::from_bytes(b"bad\xff"));
        assert_eq!(to_relative(root, &outside).unwrap(), None);
    }

    #[test]
    fn test_absolute_paths() {
        let root = Path::new("/data/root");
        assert_eq!(
            to_absolute(root, "docs/a.txt"),
            PathBuf::from("/data/root/docs/a.txt")
        );
    }

    #[test]
    fn test_base_name_and_prefix() {
        assert_eq!(base_name("docs/sub/a.txt"), "a.txt");
        assert_eq!(base_name("a.txt"), "a.txt");

        assert!(is_within("dir", "dir"));
        assert!(is_within("dir/x/y", "dir"));
        assert!(!is_within("dir2/x", "dir"));
        assert!(!is_within("di", "dir"));
    }
}
