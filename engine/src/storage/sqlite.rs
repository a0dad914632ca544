use super::Storage;
use crate::cache::CachedEntity;
use crate::error::{Result, SyncError};
use crate::operation::PendingOperation;
use crate::OperationId;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed [`Storage`].
///
/// The database runs in WAL mode with full synchronous commits, so an
/// acknowledged write survives a crash.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        // One connection: all writes are serialized by the engine anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// A private in-memory database, gone when the storage is dropped.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("Local database ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

fn operation_id(id: OperationId) -> Result<i64> {
    i64::try_from(id).map_err(|_| SyncError::Storage(format!("operation id out of range: {id}")))
}

async fn write_entity(conn: &mut SqliteConnection, entity: &CachedEntity) -> Result<()> {
    let body = serde_json::to_string(entity)?;
    sqlx::query(
        r#"
        INSERT INTO cached_entities (entity_type, entity_id, body)
        VALUES (?, ?, ?)
        ON CONFLICT (entity_type, entity_id) DO UPDATE SET body = excluded.body
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(&entity.entity_id)
    .bind(body)
    .execute(conn)
    .await?;
    Ok(())
}

impl Storage for SqliteStorage {
    async fn load_operations(&self) -> Result<Vec<PendingOperation>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM pending_operations ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(SyncError::from))
            .collect()
    }

    async fn insert_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> Result<OperationId> {
        let mut tx = self.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO pending_operations (stream_key, idempotency_key, status, body)
            VALUES (?, ?, ?, '')
            RETURNING id
            "#,
        )
        .bind(&op.stream_key)
        .bind(&op.idempotency_key)
        .bind(op.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let id = OperationId::try_from(id)
            .map_err(|_| SyncError::Storage(format!("negative operation id: {id}")))?;
        let mut stored = op.clone();
        stored.id = id;

        sqlx::query("UPDATE pending_operations SET body = ? WHERE id = ?")
            .bind(serde_json::to_string(&stored)?)
            .bind(operation_id(id)?)
            .execute(&mut *tx)
            .await?;

        if let Some(entity) = entity {
            write_entity(&mut tx, entity).await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    async fn update_operation(
        &self,
        op: &PendingOperation,
        entity: Option<&CachedEntity>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE pending_operations
            SET idempotency_key = ?, status = ?, body = ?
            WHERE id = ?
            "#,
        )
        .bind(&op.idempotency_key)
        .bind(op.status.as_str())
        .bind(serde_json::to_string(op)?)
        .bind(operation_id(op.id)?)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::OperationNotFound(op.id));
        }

        if let Some(entity) = entity {
            write_entity(&mut tx, entity).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_operation(&self, id: OperationId, entity: Option<&CachedEntity>) -> Result<()> {
        let mut tx = self.begin().await?;

        sqlx::query("DELETE FROM pending_operations WHERE id = ?")
            .bind(operation_id(id)?)
            .execute(&mut *tx)
            .await?;

        if let Some(entity) = entity {
            write_entity(&mut tx, entity).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_entities(&self) -> Result<Vec<CachedEntity>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT body FROM cached_entities")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(SyncError::from))
            .collect()
    }

    async fn save_entity(&self, entity: &CachedEntity) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_entity(&mut conn, entity).await
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
