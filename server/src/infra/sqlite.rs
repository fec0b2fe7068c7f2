//! SQLite-backed remote storage

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use tracing::{debug, info};

use super::storage::RemoteStorage;
use crate::domain::container::ContainerId;
use crate::domain::environment::{Environment, EnvironmentConfig, PersistedEnvironment};
use crate::domain::revision::{Revision, RevisionRecord, Version};
use crate::error::{Error, Result};

/// Database row for a revision
#[derive(Debug, FromRow)]
struct RevisionRow {
    version: i64,
    name: String,
    explanation: String,
    output: String,
    state: String,
    created_at: String,
}

impl TryFrom<RevisionRow> for RevisionRecord {
    type Error = Error;

    fn try_from(row: RevisionRow) -> Result<Self> {
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| Error::Storage(format!("Failed to parse created_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(RevisionRecord {
            version: Version(row.version as u64),
            name: row.name,
            explanation: row.explanation,
            output: row.output,
            created_at,
            state: ContainerId::new(row.state),
        })
    }
}

/// Remote storage kept in a SQLite database
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Create storage on top of an initialized pool
    pub fn new(pool: SqlitePool, database_url: impl Into<String>) -> Self {
        Self {
            pool,
            database_url: database_url.into(),
        }
    }

    /// Initialize the database connection pool
    pub async fn init(database_url: &str) -> anyhow::Result<SqlitePool> {
        // Ensure parent directory exists
        if let Some(path) = database_url.strip_prefix("sqlite:") {
            if let Some(path) = path.split('?').next() {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(pool)
    }

    /// Get the pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_environment(&self, env: &Environment) -> Result<()> {
        let project = env.repo_name();
        let known: Option<(String,)> = sqlx::query_as("SELECT name FROM projects WHERE name = ?")
            .bind(&project)
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(Error::Storage(format!("no remote for project {}", project)));
        }
        Ok(())
    }

    async fn insert_note(&self, env: &Environment, kind: &str, body: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO notes (environment_id, kind, body, created_at)
            SELECT id, ?, ?, ? FROM environments WHERE id = ?
            "#,
        )
        .bind(kind)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .bind(env.id())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RecordNotFound(env.id().to_string()));
        }

        Ok(())
    }

    /// Notes of one kind, oldest first
    pub async fn notes(&self, env_id: &str, kind: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM notes WHERE environment_id = ? AND kind = ? ORDER BY id",
        )
        .bind(env_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(body,)| body).collect())
    }
}

#[async_trait]
impl RemoteStorage for SqliteStorage {
    async fn remote_url(&self, project: &str) -> Result<String> {
        let url = format!("{}#{}", self.database_url, project);
        sqlx::query("INSERT OR IGNORE INTO projects (name, url, created_at) VALUES (?, ?, ?)")
            .bind(project)
            .bind(&url)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        let (url,): (String,) = sqlx::query_as("SELECT url FROM projects WHERE name = ?")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        Ok(url)
    }

    async fn create(&self, env: &Environment) -> Result<()> {
        self.ensure_environment(env).await?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO environments (id, project, name, source, config, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(env.id())
        .bind(env.repo_name())
        .bind(env.name())
        .bind(env.source().to_string_lossy().into_owned())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!("Environment record {} created", env.id());
        Ok(())
    }

    async fn save(&self, env: &Environment, revision: &Revision) -> Result<()> {
        let config = serde_json::to_string(&env.config().await)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        // A deleted environment stays deleted
        let updated = sqlx::query(
            "UPDATE environments SET config = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&config)
        .bind(&now)
        .bind(env.id())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::RecordNotFound(env.id().to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO revisions (environment_id, version, name, explanation, output, state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(env.id())
        .bind(revision.version.0 as i64)
        .bind(&revision.name)
        .bind(&revision.explanation)
        .bind(&revision.output)
        .bind(revision.state.as_str())
        .bind(revision.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("Saved revision {} of {}", revision.version, env.id());
        Ok(())
    }

    async fn note(&self, env: &Environment, text: &str) -> Result<()> {
        self.insert_note(env, "note", text).await
    }

    async fn patch(&self, env: &Environment, diff: &str) -> Result<()> {
        self.insert_note(env, "patch", diff).await
    }

    async fn load(&self, env: &Environment) -> Result<PersistedEnvironment> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT config FROM environments WHERE id = ?")
                .bind(env.id())
                .fetch_optional(&self.pool)
                .await?;

        let config = match row {
            Some((Some(config),)) => config,
            _ => return Err(Error::RecordNotFound(env.id().to_string())),
        };
        let config: EnvironmentConfig = serde_json::from_str(&config)
            .map_err(|e| Error::Storage(format!("Failed to parse config: {}", e)))?;

        let rows: Vec<RevisionRow> = sqlx::query_as(
            r#"
            SELECT version, name, explanation, output, state, created_at
            FROM revisions
            WHERE environment_id = ?
            ORDER BY version
            "#,
        )
        .bind(env.id())
        .fetch_all(&self.pool)
        .await?;

        let revisions = rows
            .into_iter()
            .map(RevisionRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(PersistedEnvironment { config, revisions })
    }

    async fn delete(&self, repo_name: &str, env_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM revisions WHERE environment_id = ?")
            .bind(env_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM notes WHERE environment_id = ?")
            .bind(env_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM environments WHERE id = ? AND project = ?")
            .bind(env_id)
            .bind(repo_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Environment record {} deleted", env_id);
        Ok(())
    }

    async fn base_project_dir(&self, env: &Environment) -> Result<PathBuf> {
        Ok(env.source().to_path_buf())
    }
}
