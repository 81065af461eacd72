//! Filesystem collaborator for helper directory trees

use async_trait::async_trait;
use brood_core::{PeerLink, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, instrument};

/// Trait for creating and removing helper trees (allows swapping in tests)
///
/// Every operation is idempotent: creating what exists and removing what is
/// already gone both succeed.
#[async_trait]
pub trait HelperFs: Send + Sync {
    async fn create_dirs(&self, dirs: &[PathBuf]) -> Result<()>;

    /// Create `link.link` pointing at `link.target`, replacing a stale link
    async fn link(&self, link: &PeerLink) -> Result<()>;

    /// Write `contents` to `path` and make it read-only
    async fn write_readonly(&self, path: &Path, contents: &str) -> Result<()>;

    /// Remove a directory tree, file or symlink (never following the link)
    async fn remove_tree(&self, path: &Path) -> Result<()>;

    async fn exists(&self, path: &Path) -> bool;
}

/// [`HelperFs`] on the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

#[async_trait]
impl HelperFs for LocalFs {
    async fn create_dirs(&self, dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(link = %link.link.display()))]
    async fn link(&self, link: &PeerLink) -> Result<()> {
        if let Ok(existing) = fs::read_link(&link.link).await {
            if existing == link.target {
                return Ok(());
            }
            debug!("Replacing stale link -> {}", existing.display());
            fs::remove_file(&link.link).await?;
        }
        if let Some(parent) = link.link.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::symlink(&link.target, &link.link).await?;
        Ok(())
    }

    #[instrument(skip(self, contents))]
    async fn write_readonly(&self, path: &Path, contents: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::symlink_metadata(path).await.is_ok() {
            fs::remove_file(path).await?;
        }
        fs::write(path, contents).await?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o444)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_dirs_is_idempotent() {
        let dir = tempdir().unwrap();
        let dirs = vec![dir.path().join("a/b"), dir.path().join("c")];
        LocalFs.create_dirs(&dirs).await.unwrap();
        LocalFs.create_dirs(&dirs).await.unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }

    #[tokio::test]
    async fn test_link_replaces_stale_target() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        LocalFs.create_dirs(&[first.clone(), second.clone()]).await.unwrap();

        let link_path = dir.path().join("peers/2-ro");
        let mut link = PeerLink {
            target: first,
            link: link_path.clone(),
        };
        LocalFs.link(&link).await.unwrap();
        LocalFs.link(&link).await.unwrap();

        link.target = second.clone();
        LocalFs.link(&link).await.unwrap();
        assert_eq!(std::fs::read_link(&link_path).unwrap(), second);
    }

    #[tokio::test]
    async fn test_write_readonly_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("1/spawn.toml");
        LocalFs.write_readonly(&path, "identity = 1\n").await.unwrap();
        LocalFs.write_readonly(&path, "identity = 1\n").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "identity = 1\n");
    }

    #[tokio::test]
    async fn test_remove_tree_does_not_follow_links() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("channel");
        LocalFs.create_dirs(&[target.clone()]).await.unwrap();
        std::fs::write(target.join("note"), "keep").unwrap();

        let link = PeerLink {
            target: target.clone(),
            link: dir.path().join("link"),
        };
        LocalFs.link(&link).await.unwrap();
        LocalFs.remove_tree(&link.link).await.unwrap();
        LocalFs.remove_tree(&link.link).await.unwrap();

        assert!(!LocalFs.exists(&link.link).await);
        assert!(target.join("note").exists());
    }
}
