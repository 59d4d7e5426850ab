//! # Path Confinement
//!
//! Every file the decryptor touches must live under the build root.
//!
//! [`secure_abs_path`] is purely lexical: it joins and normalizes `.` and
//! `..` without touching the filesystem. [`resolve`] additionally follows
//! symlinks component by component and applies the same confinement check to
//! every link target. Escapes are always errors, never clamped to the root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use super::error::PathError;
use crate::constants::MAX_SYMLINK_FOLLOWS;

/// Lexically normalize a path: drop `.`, apply `..` by popping.
///
/// `..` never pops past the filesystem root, mirroring how the kernel treats
/// `/..`.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_parent = matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_parent || (!out.has_root() && out.as_os_str().is_empty()) {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// Check that `root` is usable as a build root.
pub fn validate_root(root: &Path) -> Result<(), PathError> {
    if !root.is_absolute() {
        return Err(PathError::InvalidRoot {
            root: root.to_path_buf(),
            reason: "must be an absolute path".to_string(),
        });
    }
    if clean(root) != root {
        return Err(PathError::InvalidRoot {
            root: root.to_path_buf(),
            reason: "must be a normalized path".to_string(),
        });
    }
    Ok(())
}

/// Lexically resolve `path` against `root` without following symlinks.
///
/// Relative paths are joined onto `root`. Absolute paths are accepted as-is
/// when they already lie under `root`. Either way the normalized result must
/// stay under `root`.
pub fn secure_abs_path(root: &Path, path: &Path) -> Result<PathBuf, PathError> {
    validate_root(root)?;
    let joined = if path.is_absolute() {
        clean(path)
    } else {
        clean(&root.join(path))
    };
    if !joined.starts_with(root) {
        return Err(PathError::OutsideRoot {
            path: path.to_path_buf(),
            root: root.to_path_buf(),
        });
    }
    Ok(joined)
}

/// Resolve `path` under `root`, following symlinks.
///
/// Returns the absolute resolved path and the same path relative to `root`,
/// so that `absolute == root.join(relative)`. Components that do not exist
/// yet are appended lexically. A symlink whose target (relative or absolute)
/// falls outside `root` is an error.
pub fn resolve(root: &Path, path: &Path) -> Result<(PathBuf, PathBuf), PathError> {
    let lexical = secure_abs_path(root, path)?;
    let relative = strip_root(root, &lexical);

    let mut current = root.to_path_buf();
    let mut pending: Vec<PathBuf> = components_rev(&relative);
    let mut follows = 0usize;
    let mut missing = false;

    while let Some(component) = pending.pop() {
        let next = current.join(&component);
        if missing {
            current = next;
            continue;
        }
        let metadata = match std::fs::symlink_metadata(&next) {
            Ok(metadata) => metadata,
            Err(err)
                if err.kind() == ErrorKind::NotFound || err.kind() == ErrorKind::NotADirectory =>
            {
                missing = true;
                current = next;
                continue;
            }
            Err(source) => return Err(PathError::Io { path: next, source }),
        };
        if !metadata.file_type().is_symlink() {
            current = next;
            continue;
        }

        follows += 1;
        if follows > MAX_SYMLINK_FOLLOWS {
            return Err(PathError::TooManyLinks {
                path: path.to_path_buf(),
            });
        }
        let target = std::fs::read_link(&next).map_err(|source| PathError::Io {
            path: next.clone(),
            source,
        })?;
        let target_abs = if target.is_absolute() {
            clean(&target)
        } else {
            clean(&current.join(&target))
        };
        if !target_abs.starts_with(root) {
            return Err(PathError::SymlinkOutsideRoot {
                path: strip_root(root, &next),
                target,
                root: root.to_path_buf(),
            });
        }
        trace!(link = %next.display(), target = %target_abs.display(), "Following symlink");

        // Restart from the root with the target's components in front of what is left
        let target_rel = strip_root(root, &target_abs);
        pending.extend(components_rev(&target_rel));
        current = root.to_path_buf();
    }

    let relative = strip_root(root, &current);
    Ok((current, relative))
}

/// `path` relative to `root`; empty when `path` is the root itself.
/// Callers guarantee `path` lies under `root`.
pub(crate) fn strip_root(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Normal components of a relative path, last component first
fn components_rev(relative: &Path) -> Vec<PathBuf> {
    relative
        .components()
        .rev()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(PathBuf::from(name)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();
        (dir, path)
    }

    #[test]
    fn test_clean() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(clean(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn test_secure_abs_path() {
        let root = Path::new("/build/root");
        assert_eq!(
            secure_abs_path(root, Path::new("apps/../base")).unwrap(),
            PathBuf::from("/build/root/base")
        );
        assert_eq!(
            secure_abs_path(root, Path::new("/build/root/apps")).unwrap(),
            PathBuf::from("/build/root/apps")
        );
        assert!(matches!(
            secure_abs_path(root, Path::new("../../bar")),
            Err(PathError::OutsideRoot { .. })
        ));
        assert!(matches!(
            secure_abs_path(root, Path::new("/etc/passwd")),
            Err(PathError::OutsideRoot { .. })
        ));
        // Prefix match on the string is not containment
        assert!(secure_abs_path(root, Path::new("/build/rootkit")).is_err());
    }

    #[test]
    fn test_invalid_root() {
        assert!(matches!(
            secure_abs_path(Path::new("relative"), Path::new("x")),
            Err(PathError::InvalidRoot { .. })
        ));
        assert!(matches!(
            secure_abs_path(Path::new("/a/../b"), Path::new("x")),
            Err(PathError::InvalidRoot { .. })
        ));
    }

    #[test]
    fn test_resolve_plain_paths() {
        let (_dir, root) = root();
        std::fs::create_dir_all(root.join("apps/web")).unwrap();

        let (abs, rel) = resolve(&root, Path::new("apps/./web")).unwrap();
        assert_eq!(abs, root.join("apps/web"));
        assert_eq!(rel, PathBuf::from("apps/web"));
        assert_eq!(abs, root.join(&rel));

        let (abs, rel) = resolve(&root, Path::new("apps/missing/file.env")).unwrap();
        assert_eq!(abs, root.join("apps/missing/file.env"));
        assert_eq!(abs, root.join(&rel));

        let (abs, rel) = resolve(&root, Path::new(".")).unwrap();
        assert_eq!(abs, root);
        assert_eq!(rel, PathBuf::new());
    }

    #[test]
    fn test_resolve_relative_symlink_inside_root() {
        let (_dir, root) = root();
        std::fs::create_dir_all(root.join("base")).unwrap();
        std::fs::create_dir_all(root.join("apps")).unwrap();
        std::fs::write(root.join("base/secret.env"), "A=1\n").unwrap();
        symlink("../base/secret.env", root.join("apps/secret.env")).unwrap();

        let (abs, rel) = resolve(&root, Path::new("apps/secret.env")).unwrap();
        assert_eq!(abs, root.join("base/secret.env"));
        assert_eq!(rel, PathBuf::from("base/secret.env"));
    }

    #[test]
    fn test_resolve_absolute_symlink_inside_root() {
        let (_dir, root) = root();
        std::fs::create_dir_all(root.join("base")).unwrap();
        symlink(root.join("base"), root.join("link")).unwrap();

        let (abs, _) = resolve(&root, Path::new("link/file.yaml")).unwrap();
        assert_eq!(abs, root.join("base/file.yaml"));
    }

    #[test]
    fn test_resolve_symlink_outside_root() {
        let (_dir, root) = root();
        let (_other, outside) = self::root();
        symlink(&outside, root.join("escape")).unwrap();
        symlink("../../../../../../etc/passwd", root.join("relative-escape")).unwrap();

        assert!(matches!(
            resolve(&root, Path::new("escape/secret.env")),
            Err(PathError::SymlinkOutsideRoot { .. })
        ));
        assert!(matches!(
            resolve(&root, Path::new("relative-escape")),
            Err(PathError::SymlinkOutsideRoot { .. })
        ));
    }

    #[test]
    fn test_resolve_symlink_chain() {
        let (_dir, root) = root();
        std::fs::create_dir_all(root.join("target")).unwrap();
        symlink("target", root.join("one")).unwrap();
        symlink("one", root.join("two")).unwrap();

        let (abs, _) = resolve(&root, Path::new("two")).unwrap();
        assert_eq!(abs, root.join("target"));
    }

    #[test]
    fn test_resolve_symlink_loop() {
        let (_dir, root) = root();
        symlink("b", root.join("a")).unwrap();
        symlink("a", root.join("b")).unwrap();

        assert!(matches!(
            resolve(&root, Path::new("a")),
            Err(PathError::TooManyLinks { .. })
        ));
    }
}
