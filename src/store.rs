//! # SQLite-backed session snapshots
//!
//! Persists a session's context (history, metadata, counters) so a
//! conversation can resume after a process restart. The snapshot is the
//! serde form of [`SharedContext`]; loading reproduces an equivalent
//! context with the same history order and the same derived phase.
//!
//! All operations are async through an sqlx connection pool; an in-memory
//! variant backs the tests.

use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;

use crate::context::SharedContext;
use crate::error::Result;

/// Snapshot store over a SQLite database.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePool::connect(&db_url).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store, useful for testing. Data is lost when the pool
    /// closes.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_snapshots (
                session_id TEXT PRIMARY KEY,
                context TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Saves (or replaces) the snapshot for a session.
    pub async fn save(&self, session_id: &str, context: &SharedContext) -> Result<()> {
        let serialized = serde_json::to_string(context)?;
        sqlx::query(
            r#"
            INSERT INTO session_snapshots (session_id, context, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                context = excluded.context,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(serialized)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads the snapshot for a session, if one was saved.
    pub async fn load(&self, session_id: &str) -> Result<Option<SharedContext>> {
        let row = sqlx::query(
            "SELECT context FROM session_snapshots WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let serialized: String = row.get("context");
                Ok(Some(serde_json::from_str(&serialized)?))
            }
            None => Ok(None),
        }
    }

    /// Deletes a session's snapshot. Unknown ids are a no-op.
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_snapshots WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
