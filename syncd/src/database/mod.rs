//! Database boundary for the replication engine.
//!
//! This module provides:
//! - `Database` - a pooled handle over Postgres (production) or SQLite (tests, local use)
//! - `DbTx` - an ordinary read/write transaction executing SQL with `SqlValue` parameters
//! - `SnapshotTx` - a transaction pinned to a named consistent view for the dump tool
//! - Emptiness checks used to guard snapshot restores
//!
//! The module is organized into submodules:
//! - `value` - The closed `SqlValue` type and its conversions
//! - `changesets` - Destination-side changeset tables, watermark and replicator state

mod changesets;
pub mod value;

pub use changesets::PendingHeight;
pub use value::SqlValue;

use anyhow::Result;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, PgPool, Postgres, Row, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::errors::DatabaseError;

#[derive(Clone)]
pub enum Database {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

pub enum DbTx {
    Sqlite(Transaction<'static, Sqlite>),
    Postgres(Transaction<'static, Postgres>),
}

/// Transaction pinned to a consistent read view that external tools can join
pub struct SnapshotTx {
    tx: DbTx,
    snapshot_id: String,
}

fn connection_failed(err: sqlx::Error) -> DatabaseError {
    DatabaseError::ConnectionFailed {
        reason: err.to_string(),
    }
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = config.connection_url();
        let database = if url.starts_with("sqlite:") {
            info!("Connecting to SQLite database: {}", url);
            let options = SqliteConnectOptions::from_str(&url)
                .map_err(connection_failed)?
                .create_if_missing(true)
                .foreign_keys(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await
                .map_err(|e| {
                    error!("FAILED to connect to SQLite database: {}", e);
                    connection_failed(e)
                })?;
            Database::Sqlite(pool)
        } else {
            info!(
                "Connecting to Postgres database {} at {}:{}",
                config.dbname, config.host, config.port
            );
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&url)
                .await
                .map_err(|e| {
                    error!("FAILED to connect to Postgres database: {}", e);
                    connection_failed(e)
                })?;
            Database::Postgres(pool)
        };

        database.initialize_tables().await?;
        info!("✓ Database initialized ({})", database.backend_name());
        Ok(database)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Database::Sqlite(_) => "sqlite",
            Database::Postgres(_) => "postgres",
        }
    }

    /// Creates the destination-side changeset tables and replicator state
    pub async fn initialize_tables(&self) -> Result<()> {
        let blob = match self {
            Database::Sqlite(_) => "BLOB",
            Database::Postgres(_) => "BYTEA",
        };

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS changeset_metadata (
                height BIGINT PRIMARY KEY,
                total_chunks BIGINT NOT NULL,
                received BIGINT NOT NULL DEFAULT 0,
                prev_height BIGINT
            )
            "#
            .to_string(),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS changeset_chunks (
                    height BIGINT NOT NULL REFERENCES changeset_metadata(height) ON DELETE CASCADE,
                    chunk_index BIGINT NOT NULL,
                    data {} NOT NULL,
                    PRIMARY KEY (height, chunk_index)
                )
                "#,
                blob
            ),
            r#"
            CREATE TABLE IF NOT EXISTS changeset_watermark (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                height BIGINT
            )
            "#
            .to_string(),
            r#"
            CREATE TABLE IF NOT EXISTS replicator_state (
                key TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#
            .to_string(),
        ];

        let mut tx = self.begin_tx().await?;
        for sql in &statements {
            if let Err(e) = tx.execute(sql, &[]).await {
                error!("FAILED to create changeset tables: {}", e);
                return Err(e.into());
            }
        }
        tx.commit().await?;
        debug!("Changeset tables ready");
        Ok(())
    }

    pub async fn begin_tx(&self) -> Result<DbTx, DatabaseError> {
        match self {
            Database::Sqlite(pool) => pool
                .begin()
                .await
                .map(DbTx::Sqlite)
                .map_err(|e| DatabaseError::query("BEGIN", e)),
            Database::Postgres(pool) => pool
                .begin()
                .await
                .map(DbTx::Postgres)
                .map_err(|e| DatabaseError::query("BEGIN", e)),
        }
    }

    /// Opens a transaction pinned to a consistent view and names that view.
    ///
    /// On Postgres the id is an exported snapshot that `pg_dump --snapshot`
    /// can attach to. SQLite has no exportable snapshots, so the read lock is
    /// taken eagerly and the id is only a label.
    pub async fn begin_snapshot_tx(&self) -> Result<SnapshotTx, DatabaseError> {
        match self {
            Database::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| DatabaseError::query("BEGIN", e))?;
                let isolation = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ";
                sqlx::query(isolation)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DatabaseError::query(isolation, e))?;
                let export = "SELECT pg_export_snapshot()";
                let snapshot_id: String = sqlx::query_scalar(export)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| DatabaseError::query(export, e))?;
                Ok(SnapshotTx {
                    tx: DbTx::Postgres(tx),
                    snapshot_id,
                })
            }
            Database::Sqlite(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| DatabaseError::query("BEGIN", e))?;
                let pin = "SELECT count(*) FROM sqlite_master";
                sqlx::query(pin)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| DatabaseError::query(pin, e))?;
                Ok(SnapshotTx {
                    tx: DbTx::Sqlite(tx),
                    snapshot_id: uuid::Uuid::new_v4().to_string(),
                })
            }
        }
    }

    /// True when the canonical bootstrap table is missing or has no rows
    pub async fn is_empty(&self, canonical_table: &str) -> Result<bool, DatabaseError> {
        validate_identifier(canonical_table)?;
        let mut tx = self.begin_tx().await?;

        let exists = if matches!(tx, DbTx::Postgres(_)) {
            let rows = tx
                .query(
                    "SELECT to_regclass($1)::text",
                    &[SqlValue::from(canonical_table)],
                )
                .await?;
            rows.first()
                .and_then(|row| row.first())
                .is_some_and(|value| !value.is_null())
        } else {
            let rows = tx
                .query(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = $1",
                    &[SqlValue::from(canonical_table)],
                )
                .await?;
            !rows.is_empty()
        };

        let empty = if exists {
            let sql = format!("SELECT 1 FROM {} LIMIT 1", canonical_table);
            tx.query(&sql, &[]).await?.is_empty()
        } else {
            true
        };

        tx.rollback().await;
        Ok(empty)
    }
}

impl DbTx {
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        match self {
            DbTx::Sqlite(tx) => bind_all(sqlx::query::<Sqlite>(sql), params)
                .execute(&mut **tx)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| DatabaseError::query(sql, e)),
            DbTx::Postgres(tx) => bind_all(sqlx::query::<Postgres>(sql), params)
                .execute(&mut **tx)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| DatabaseError::query(sql, e)),
        }
    }

    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, DatabaseError> {
        match self {
            DbTx::Sqlite(tx) => {
                let rows = bind_all(sqlx::query::<Sqlite>(sql), params)
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(|e| DatabaseError::query(sql, e))?;
                rows.iter().map(decode_sqlite_row).collect()
            }
            DbTx::Postgres(tx) => {
                let rows = bind_all(sqlx::query::<Postgres>(sql), params)
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(|e| DatabaseError::query(sql, e))?;
                rows.iter().map(decode_pg_row).collect()
            }
        }
    }

    pub async fn commit(self) -> Result<(), DatabaseError> {
        match self {
            DbTx::Sqlite(tx) => tx.commit().await,
            DbTx::Postgres(tx) => tx.commit().await,
        }
        .map_err(|e| DatabaseError::query("COMMIT", e))
    }

    pub async fn rollback(self) {
        let result = match self {
            DbTx::Sqlite(tx) => tx.rollback().await,
            DbTx::Postgres(tx) => tx.rollback().await,
        };
        if let Err(e) = result {
            debug!("Rollback failed: {}", e);
        }
    }
}

impl SnapshotTx {
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// The view is only ever read through the dump tool, so it is always rolled back
    pub async fn rollback(self) {
        self.tx.rollback().await;
    }
}

fn bind_all<'q, DB>(
    mut query: sqlx::query::Query<'q, DB, <DB as sqlx::Database>::Arguments<'q>>,
    params: &[SqlValue],
) -> sqlx::query::Query<'q, DB, <DB as sqlx::Database>::Arguments<'q>>
where
    DB: sqlx::Database,
    i64: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    bool: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    String: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    Vec<u8>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
    Option<i64>: sqlx::Encode<'q, DB> + sqlx::Type<DB>,
{
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<Vec<SqlValue>, DatabaseError> {
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(i)
            .map_err(|e| DatabaseError::query(column.name(), e))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        // Storage class of the value, not the declared column type
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "INTEGER" => SqlValue::Int(get(row, i, column.name())?),
            "BOOLEAN" => SqlValue::Bool(get(row, i, column.name())?),
            "BLOB" => SqlValue::Bytes(get(row, i, column.name())?),
            "TEXT" => SqlValue::Text(get(row, i, column.name())?),
            _ => {
                return Err(DatabaseError::UnsupportedColumnType {
                    column: column.name().to_string(),
                    type_name,
                })
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn decode_pg_row(row: &PgRow) -> Result<Vec<SqlValue>, DatabaseError> {
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row
            .try_get_raw(i)
            .map_err(|e| DatabaseError::query(column.name(), e))?;
        if raw.is_null() {
            values.push(SqlValue::Null);
            continue;
        }
        let type_name = raw.type_info().name().to_string();
        let value = match type_name.as_str() {
            "INT8" => SqlValue::Int(get(row, i, column.name())?),
            "INT4" => SqlValue::Int(get::<_, i32>(row, i, column.name())?.into()),
            "INT2" => SqlValue::Int(get::<_, i16>(row, i, column.name())?.into()),
            "BOOL" => SqlValue::Bool(get(row, i, column.name())?),
            "BYTEA" => SqlValue::Bytes(get(row, i, column.name())?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                SqlValue::Text(get(row, i, column.name())?)
            }
            _ => {
                return Err(DatabaseError::UnsupportedColumnType {
                    column: column.name().to_string(),
                    type_name,
                })
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn get<'r, R, T>(row: &'r R, index: usize, column: &str) -> Result<T, DatabaseError>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    T: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    row.try_get(index)
        .map_err(|e| DatabaseError::query(column, e))
}

/// Accepts `table` or `schema.table` made of ASCII word characters
pub fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|part| valid_part(part)) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}
