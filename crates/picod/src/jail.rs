use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("Invalid path {path:?}: escapes the workspace")]
pub struct PathEscape {
    pub path: String,
}

/// Confines caller-supplied paths to a workspace root.
///
/// Resolution is purely lexical: absolute inputs are re-rooted under the
/// workspace, `.`/`..` segments are collapsed without touching the
/// filesystem, and any path that would climb out of the root is rejected.
/// Symlinks inside the workspace are not followed during resolution.
#[derive(Debug, Clone)]
pub struct PathJail {
    workspace: PathBuf,
}

impl PathJail {
    /// Set the workspace root, once, at boot. The root is resolved to an
    /// absolute real path so prefix checks cannot be confused by links.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            workspace: std::fs::canonicalize(root)?,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Resolve `path` to an absolute path guaranteed to live under the
    /// workspace root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathEscape> {
        let relative = path.trim_start_matches('/');

        let mut cleaned = Vec::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::ParentDir => {
                    if cleaned.pop().is_none() {
                        // Climbing above the root is an escape, not a no-op.
                        return Err(PathEscape {
                            path: path.to_string(),
                        });
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => (),
            }
        }

        let candidate: PathBuf = self.workspace.join(cleaned.iter().collect::<PathBuf>());
        if candidate != self.workspace && !candidate.starts_with(&self.workspace) {
            return Err(PathEscape {
                path: path.to_string(),
            });
        }
        Ok(candidate)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn jail() -> (tempfile::TempDir, PathJail) {
        let dir = tempfile::tempdir().unwrap();
        let jail = PathJail::new(dir.path()).unwrap();
        (dir, jail)
    }

    #[test]
    fn test_relative_and_absolute_inputs_resolve_inside() {
        let (_dir, jail) = jail();
        let root = jail.workspace().to_path_buf();

        assert_eq!(jail.resolve("a/b.txt").unwrap(), root.join("a/b.txt"));
        // Absolute inputs are treated as relative to the workspace.
        assert_eq!(
            jail.resolve("/etc/passwd").unwrap(),
            root.join("etc/passwd")
        );
        assert_eq!(jail.resolve("").unwrap(), root);
        assert_eq!(jail.resolve("/").unwrap(), root);
    }

    #[test]
    fn test_dot_segments_collapse() {
        let (_dir, jail) = jail();
        let root = jail.workspace().to_path_buf();

        assert_eq!(jail.resolve("./a/./b").unwrap(), root.join("a/b"));
        assert_eq!(jail.resolve("a/b/../c").unwrap(), root.join("a/c"));
    }

    #[test]
    fn test_escapes_are_rejected() {
        let (_dir, jail) = jail();

        for escape in ["../outside.txt", "a/../../outside", "/../x", "../../.."] {
            assert!(jail.resolve(escape).is_err(), "{escape} should be rejected");
        }
    }

    #[test]
    fn test_resolved_paths_stay_under_workspace() {
        let (_dir, jail) = jail();
        for input in ["x", "/x/y", "a/./b/../c", "deep/nested/dir/file.bin"] {
            let resolved = jail.resolve(input).unwrap();
            assert!(
                resolved == jail.workspace() || resolved.starts_with(jail.workspace()),
                "{input} resolved outside the workspace"
            );
        }
    }
}
