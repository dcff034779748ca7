//! Sandboxed async file store.
//!
//! All operations are expressed as sandbox-relative string paths and are
//! validated before touching the filesystem: absolute paths, `..` components
//! and symlinks anywhere on the resolved path are rejected. Publishing is
//! write-to-temporary, fsync, then atomic rename, so readers of a published
//! path never observe partial content.

mod error;

pub use error::{Result, SandboxError};

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A directory root under which all file operations are confined.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    base: PathBuf,
}

impl SandboxRoot {
    /// Open (creating if necessary) a sandbox rooted at `base`.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base)
            .await
            .map_err(|e| SandboxError::io(base.display().to_string(), e))?;
        let base = tokio::fs::canonicalize(&base)
            .await
            .map_err(|e| SandboxError::io(base.display().to_string(), e))?;
        debug!(root = %base.display(), "opened sandbox root");
        Ok(Self { base })
    }

    /// The canonicalized root directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolve a sandbox-relative path to an absolute one, enforcing the
    /// sandbox invariants. The path does not need to exist, but every
    /// existing ancestor is checked for symlinks.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let mut resolved = self.base.clone();

        for component in candidate.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                other => {
                    return Err(SandboxError::RejectedComponent {
                        path: relative.to_string(),
                        component: format!("{other:?}"),
                    });
                }
            }
        }

        if !resolved.starts_with(&self.base) {
            return Err(SandboxError::OutsideSandbox {
                path: relative.to_string(),
            });
        }

        // Walk existing ancestors below the root; any symlink on the way is
        // a potential escape hatch and is refused outright.
        let mut cursor = self.base.clone();
        if let Ok(stripped) = resolved.strip_prefix(&self.base) {
            for part in stripped.components() {
                cursor.push(part.as_os_str());
                match std::fs::symlink_metadata(&cursor) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        return Err(SandboxError::SymlinkRejected {
                            path: relative.to_string(),
                            link: cursor,
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(resolved)
    }

    pub async fn exists(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    pub async fn read_to_string(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    /// Write `contents`, creating parent directories as needed. Not atomic;
    /// use [`SandboxRoot::write_atomic`] for published artifacts.
    pub async fn write(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(relative, e))?;
        }
        tokio::fs::write(&path, contents.as_ref())
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    /// Write to a temporary sibling, fsync, then rename over the final path.
    /// Readers of `relative` see either the old content or the new content,
    /// never a prefix. The temporary is removed if any step fails.
    pub async fn write_atomic(&self, relative: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let final_path = self.resolve(relative)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(relative, e))?;
        }

        let tmp_name = format!(
            "{}.tmp.{}.{}",
            relative,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let tmp_path = self.resolve(&tmp_name)?;

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|e| SandboxError::io(&tmp_name, e))?;
            file.write_all(contents.as_ref())
                .await
                .map_err(|e| SandboxError::io(&tmp_name, e))?;
            file.sync_all()
                .await
                .map_err(|e| SandboxError::io(&tmp_name, e))?;
            tokio::fs::rename(&tmp_path, &final_path)
                .await
                .map_err(|e| SandboxError::io(relative, e))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    pub async fn create_dir_all(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    pub async fn remove_file(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    pub async fn metadata(&self, relative: &str) -> Result<std::fs::Metadata> {
        let path = self.resolve(relative)?;
        tokio::fs::metadata(&path)
            .await
            .map_err(|e| SandboxError::io(relative, e))
    }

    /// List file names (not paths) directly under a sandbox-relative
    /// directory. Missing directories list as empty.
    pub async fn list_dir(&self, relative: &str) -> Result<Vec<String>> {
        let path = self.resolve(relative)?;
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SandboxError::io(relative, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::io(relative, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> (tempfile::TempDir, SandboxRoot) {
        let dir = tempfile::tempdir().unwrap();
        let root = SandboxRoot::open(dir.path()).await.unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, root) = sandbox().await;
        root.write("a/b/file.txt", b"hello").await.unwrap();
        assert_eq!(root.read_to_string("a/b/file.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn parent_components_are_rejected() {
        let (_dir, root) = sandbox().await;
        let err = root.resolve("../escape.txt").unwrap_err();
        assert!(matches!(err, SandboxError::RejectedComponent { .. }));

        let err = root.resolve("ok/../../escape.txt").unwrap_err();
        assert!(matches!(err, SandboxError::RejectedComponent { .. }));
    }

    #[tokio::test]
    async fn absolute_paths_are_rejected() {
        let (_dir, root) = sandbox().await;
        let err = root.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, SandboxError::RejectedComponent { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_rejected() {
        let (dir, root) = sandbox().await;
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = root.resolve("link/file.txt").unwrap_err();
        assert!(matches!(err, SandboxError::SymlinkRejected { .. }));
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let (_dir, root) = sandbox().await;
        root.write_atomic("out.m3u", b"first").await.unwrap();
        root.write_atomic("out.m3u", b"second").await.unwrap();
        assert_eq!(root.read_to_string("out.m3u").await.unwrap(), "second");

        // No temporaries left behind.
        let names = root.list_dir("").await.unwrap();
        assert_eq!(names, vec!["out.m3u".to_string()]);
    }

    #[tokio::test]
    async fn list_dir_on_missing_directory_is_empty() {
        let (_dir, root) = sandbox().await;
        assert!(root.list_dir("nope").await.unwrap().is_empty());
    }
}
