//! Git-backed tracker
//!
//! Each environment gets a ref `refs/environments/<id>` in its source
//! repository. Propagating an action snapshots the working tree onto that
//! ref through a private index, leaving the user's index and HEAD untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::tracker::Tracker;
use crate::domain::environment::{Environment, CONFIG_DIR};
use crate::error::{Error, Result};

const REF_PREFIX: &str = "refs/environments";
const NOTES_REF: &str = "environments";

/// Tracker that mirrors actions onto git refs
#[derive(Default)]
pub struct GitTracker {
    // Serializes writes to refs and notes
    write_lock: Mutex<()>,
}

impl GitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn tracking_ref(env: &Environment) -> String {
        format!("{}/{}", REF_PREFIX, env.id())
    }

    async fn git(&self, dir: &Path, args: &[&str], index: Option<&Path>) -> Result<String> {
        let mut command = Command::new("git");
        command.arg("-C").arg(dir).args(args);
        if let Some(index) = index {
            command.env("GIT_INDEX_FILE", index);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::Tracking(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Tracking(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    async fn git_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = self
            .git(dir, &["rev-parse", "--absolute-git-dir"], None)
            .await?;
        Ok(PathBuf::from(path))
    }

    async fn ref_exists(&self, dir: &Path, reference: &str) -> bool {
        self.git(dir, &["rev-parse", "--verify", "--quiet", reference], None)
            .await
            .is_ok()
    }

    async fn snapshot(&self, dir: &Path, parent: &str, message: &str) -> Result<String> {
        let index = self
            .git_dir(dir)
            .await?
            .join(format!("environment-index-{}", Uuid::new_v4().simple()));
        let exclude = format!(":(exclude){}", CONFIG_DIR);

        let result = async {
            self.git(dir, &["read-tree", parent], Some(&index)).await?;
            self.git(dir, &["add", "-A", "--", ".", &exclude], Some(&index))
                .await?;
            let tree = self.git(dir, &["write-tree"], Some(&index)).await?;
            self.git(dir, &["commit-tree", &tree, "-p", parent, "-m", message], None)
                .await
        }
        .await;

        let _ = tokio::fs::remove_file(&index).await;
        result
    }
}

#[async_trait]
impl Tracker for GitTracker {
    async fn setup(&self, env: &Environment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = env.source();
        let reference = Self::tracking_ref(env);

        if self.ref_exists(dir, &reference).await {
            debug!("Tracking ref {} already exists", reference);
            return Ok(());
        }

        self.git(dir, &["update-ref", &reference, "HEAD"], None).await?;
        info!("Tracking {} on {}", env.id(), reference);
        Ok(())
    }

    async fn propagate(&self, env: &Environment, message: &str, explanation: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = env.source();
        let reference = Self::tracking_ref(env);

        let full_message = if explanation.is_empty() {
            message.to_string()
        } else {
            format!("{}\n\n{}", message, explanation)
        };

        let commit = self.snapshot(dir, &reference, &full_message).await?;
        self.git(dir, &["update-ref", &reference, &commit], None).await?;
        debug!("Propagated {:?} to {} at {}", message, reference, commit);
        Ok(())
    }

    async fn delete(&self, env: &Environment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = env.source();
        let reference = Self::tracking_ref(env);

        if !self.ref_exists(dir, &reference).await {
            return Ok(());
        }
        self.git(dir, &["update-ref", "-d", &reference], None).await?;
        info!("Removed tracking ref {}", reference);
        Ok(())
    }

    async fn append_note(&self, env: &Environment, text: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let reference = Self::tracking_ref(env);
        self.git(
            env.source(),
            &["notes", "--ref", NOTES_REF, "append", "-m", text, &reference],
            None,
        )
        .await?;
        Ok(())
    }

    async fn uncommitted_diff(&self, env: &Environment) -> Result<String> {
        self.git(env.source(), &["diff", "HEAD", "--binary"], None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::environment::EnvironmentConfig;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .arg("-C")
                .arg(dir)
                .args(args)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "dev@example.com"]);
        run(&["config", "user.name", "dev"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run(&["add", "README.md"]);
        run(&["commit", "-q", "-m", "initial"]);
    }

    #[tokio::test]
    async fn test_propagate_moves_tracking_ref_only() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let env = Environment::new(
            "web/0123abcd",
            "web",
            dir.path(),
            EnvironmentConfig::new("alpine", "/workdir"),
        );
        let tracker = GitTracker::new();
        tracker.setup(&env).await.unwrap();

        std::fs::write(dir.path().join("notes.txt"), "draft\n").unwrap();
        tracker.propagate(&env, "Run make", "build it").await.unwrap();

        let log = tracker
            .git(dir.path(), &["log", "--format=%s", "refs/environments/web/0123abcd"], None)
            .await
            .unwrap();
        assert_eq!(log.lines().next(), Some("Run make"));

        let files = tracker
            .git(
                dir.path(),
                &["ls-tree", "--name-only", "refs/environments/web/0123abcd"],
                None,
            )
            .await
            .unwrap();
        assert!(files.contains("notes.txt"));

        // The user's branch did not move
        let head = tracker
            .git(dir.path(), &["log", "--format=%s", "HEAD"], None)
            .await
            .unwrap();
        assert_eq!(head, "initial");

        let diff = tracker.uncommitted_diff(&env).await.unwrap();
        assert!(diff.is_empty());

        tracker.append_note(&env, "$ make").await.unwrap();
        tracker.delete(&env).await.unwrap();
        assert!(!tracker.ref_exists(dir.path(), "refs/environments/web/0123abcd").await);
    }

    #[tokio::test]
    async fn test_setup_outside_repository_fails() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new(
            "web/0123abcd",
            "web",
            dir.path(),
            EnvironmentConfig::new("alpine", "/workdir"),
        );
        let err = GitTracker::new().setup(&env).await.unwrap_err();
        assert!(matches!(err, Error::Tracking(_)));
    }
}
