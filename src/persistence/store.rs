//! SQLite-based sweeping output store

use crate::core::context::Visibility;
use crate::core::error::SweepingOutputError;
use crate::persistence::{SweepingOutputBackend, SweepingOutputEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;

/// SQLite sweeping output store
pub struct SqliteSweepingOutputBackend {
    pool: SqlitePool,
}

impl SqliteSweepingOutputBackend {
    /// Open (or create) the database at `db_path`
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("stageplan");
        std::fs::create_dir_all(&db_dir)?;

        Self::new(db_dir.join("sweeping_outputs.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sweeping_outputs (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                visibility TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (scope, name)
            );

            CREATE INDEX IF NOT EXISTS idx_outputs_scope ON sweeping_outputs(scope);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn entry_from_row(row: &SqliteRow) -> Result<SweepingOutputEntry, SweepingOutputError> {
        let name: String = row.get("name");
        let visibility: String = row.get("visibility");
        let visibility = Visibility::parse(&visibility).ok_or_else(|| SweepingOutputError::Corrupt {
            name: name.clone(),
            reason: format!("unknown visibility [{}]", visibility),
        })?;
        Ok(SweepingOutputEntry {
            scope: row.get("scope"),
            name,
            visibility,
            payload: row.get("payload"),
            created_at: Self::from_naive(row.get("created_at")),
        })
    }
}

fn backend_error(e: sqlx::Error) -> SweepingOutputError {
    SweepingOutputError::Backend(e.to_string())
}

#[async_trait::async_trait]
impl SweepingOutputBackend for SqliteSweepingOutputBackend {
    async fn insert(&self, entry: SweepingOutputEntry) -> Result<(), SweepingOutputError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sweeping_outputs (scope, name, visibility, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&entry.scope)
        .bind(&entry.name)
        .bind(entry.visibility.as_str())
        .bind(&entry.payload)
        .bind(Self::to_naive(entry.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(SweepingOutputError::AlreadyExists {
                scope: entry.scope,
                name: entry.name,
            }),
            Err(e) => Err(backend_error(e)),
        }
    }

    async fn get(&self, scope: &str, name: &str) -> Result<Option<SweepingOutputEntry>, SweepingOutputError> {
        let row = sqlx::query(
            r#"
            SELECT scope, name, visibility, payload, created_at
            FROM sweeping_outputs
            WHERE scope = ?1 AND name = ?2
            "#,
        )
        .bind(scope)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn list(&self, scope: &str) -> Result<Vec<SweepingOutputEntry>, SweepingOutputError> {
        let rows = sqlx::query(
            r#"
            SELECT scope, name, visibility, payload, created_at
            FROM sweeping_outputs
            WHERE scope = ?1
            ORDER BY created_at ASC, name ASC
            "#,
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_round_trip_and_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteSweepingOutputBackend::new(dir.path().join("outputs.db"))
            .await
            .unwrap();

        let entry = SweepingOutputEntry::new("exec/stage", "artifacts", Visibility::Stage, r#"{"a":1}"#.to_string());
        backend.insert(entry.clone()).await.unwrap();

        let loaded = backend.get("exec/stage", "artifacts").await.unwrap().unwrap();
        assert_eq!(loaded.payload, entry.payload);
        assert_eq!(loaded.visibility, Visibility::Stage);

        let err = backend.insert(entry).await.unwrap_err();
        assert!(matches!(err, SweepingOutputError::AlreadyExists { .. }));

        assert_eq!(backend.list("exec/stage").await.unwrap().len(), 1);
        assert!(backend.get("exec/stage", "missing").await.unwrap().is_none());
    }
}
