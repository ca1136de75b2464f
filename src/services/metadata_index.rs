//! src/services/metadata_index.rs
//!
//! Metadata index capability and its SQLite implementation. Entries are
//! appended, never upserted; deletes and updates fan out over every row
//! matching a field.

use crate::models::index_entry::{IndexEntry, IndexField, IndexPatch};
use async_trait::async_trait;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite, types::Json};
use std::{io, path::Path, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("migration file not found: {0}")]
    MissingMigration(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Queryable record store holding one entry per upload.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn append(&self, entry: &IndexEntry) -> IndexResult<()>;

    /// Entries whose `field` equals `value`, newest first.
    async fn query_by_field(&self, field: IndexField, value: &str)
    -> IndexResult<Vec<IndexEntry>>;

    /// Every entry, newest first. Unpaginated.
    async fn list_all(&self) -> IndexResult<Vec<IndexEntry>>;

    /// Delete every entry whose `field` equals `value`; returns the count removed.
    async fn delete_matching(&self, field: IndexField, value: &str) -> IndexResult<u64>;

    /// Apply `patch` to every entry named `name`; returns the count updated.
    async fn update_record(&self, name: &str, patch: &IndexPatch) -> IndexResult<u64>;

    async fn ping(&self) -> IndexResult<()>;
}

const SELECT_ENTRIES: &str = "SELECT id, name, user, timestamp, url, allowed_users FROM photos";

#[derive(Clone)]
pub struct SqliteMetadataIndex {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
}

impl SqliteMetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Run the statements of a SQL migration file one by one.
    pub async fn migrate(&self, path: impl AsRef<Path>) -> IndexResult<usize> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(IndexError::MissingMigration(path.display().to_string()));
        }

        let sql = tokio::fs::read_to_string(path).await?;
        let statements = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let index = Self::new(Arc::new(pool));
        index
            .migrate(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations/0001_init.sql"))
            .await
            .unwrap();
        index
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn append(&self, entry: &IndexEntry) -> IndexResult<()> {
        sqlx::query(
            "INSERT INTO photos (id, name, user, timestamp, url, allowed_users)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id)
        .bind(&entry.name)
        .bind(&entry.user)
        .bind(entry.timestamp)
        .bind(&entry.url)
        .bind(&entry.allowed_users)
        .execute(&*self.db)
        .await?;
        debug!("indexed {} for {}", entry.name, entry.user);
        Ok(())
    }

    async fn query_by_field(
        &self,
        field: IndexField,
        value: &str,
    ) -> IndexResult<Vec<IndexEntry>> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_ENTRIES);
        builder.push(" WHERE ");
        builder.push(field.column());
        builder.push(" = ");
        builder.push_bind(value);
        builder.push(" ORDER BY timestamp DESC, rowid DESC");

        Ok(builder
            .build_query_as::<IndexEntry>()
            .fetch_all(&*self.db)
            .await?)
    }

    async fn list_all(&self) -> IndexResult<Vec<IndexEntry>> {
        let rows = sqlx::query_as::<_, IndexEntry>(&format!(
            "{} ORDER BY timestamp DESC, rowid DESC",
            SELECT_ENTRIES
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn delete_matching(&self, field: IndexField, value: &str) -> IndexResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM photos WHERE ");
        builder.push(field.column());
        builder.push(" = ");
        builder.push_bind(value);

        let result = builder.build().execute(&*self.db).await?;
        debug!(
            "removed {} index entries where {} = {}",
            result.rows_affected(),
            field.column(),
            value
        );
        Ok(result.rows_affected())
    }

    async fn update_record(&self, name: &str, patch: &IndexPatch) -> IndexResult<u64> {
        let Some(allowed_users) = &patch.allowed_users else {
            return Ok(0);
        };

        let result = sqlx::query("UPDATE photos SET allowed_users = ? WHERE name = ?")
            .bind(allowed_users.clone().map(Json))
            .bind(name)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> IndexResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}
