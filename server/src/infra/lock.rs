//! Advisory lock marker
//!
//! A sentinel file inside a source tree. It is cooperative: anything that can
//! see the filesystem (this process, other servers, a human with a shell) can
//! take or drop it, and only configuration updates honor it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the marker is present
    pub async fn is_held(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Create the marker; returns false if it was already held
    pub async fn acquire(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(_) => {
                info!("Lock marker acquired: {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Remove the marker; returns false if it was not held
    pub async fn release(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Lock marker released: {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Fail with `Error::EnvironmentLocked` if the marker is present
    pub async fn ensure_unlocked(&self) -> Result<()> {
        if self.is_held().await {
            return Err(Error::EnvironmentLocked(self.path.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let marker = LockMarker::new(dir.path().join(".environment").join("lock"));

        assert!(!marker.is_held().await);
        assert!(marker.acquire().await.unwrap());
        assert!(marker.is_held().await);
        assert!(!marker.acquire().await.unwrap());

        assert!(marker.release().await.unwrap());
        assert!(!marker.is_held().await);
        assert!(!marker.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_unlocked_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".environment").join("lock");
        let marker = LockMarker::new(&path);

        marker.ensure_unlocked().await.unwrap();
        marker.acquire().await.unwrap();

        match marker.ensure_unlocked().await {
            Err(Error::EnvironmentLocked(locked)) => assert_eq!(locked, path),
            other => panic!("expected locked error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_marker_created_by_hand_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"").unwrap();

        let marker = LockMarker::new(&path);
        assert!(marker.is_held().await);
        assert!(marker.ensure_unlocked().await.is_err());
    }
}
