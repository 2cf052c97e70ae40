use crate::error::ToolError;
use std::path::{Component, Path, PathBuf};

/// A directory that tool paths are confined to.
///
/// Names are resolved relative to the root. Anything that lands outside it,
/// lexically (`..`, absolute paths) or after following symlinks, is refused.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ToolError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|source| ToolError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, ToolError> {
        let requested = Path::new(name);
        let denied = || ToolError::AccessDenied {
            path: name.to_string(),
            root: self.root.clone(),
        };

        if requested
            .components()
            .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
        {
            return Err(denied());
        }

        let normalized = normalize(&self.root.join(requested));
        if !normalized.starts_with(&self.root) {
            return Err(denied());
        }

        match normalized.canonicalize() {
            Ok(resolved) if resolved.starts_with(&self.root) => Ok(resolved),
            Ok(resolved) => {
                tracing::warn!(
                    "Refusing '{}': resolves to {} outside {}",
                    name,
                    resolved.display(),
                    self.root.display()
                );
                Err(denied())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ToolError::NotFound(name.to_string()))
            }
            Err(source) => Err(ToolError::Io {
                path: normalized,
                source,
            }),
        }
    }
}

/// Lexically folds `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
