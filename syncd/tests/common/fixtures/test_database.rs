//! Test database utilities for in-memory SQLite testing

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

use syncd::database::{Database, SqlValue};

/// Test database wrapper for in-memory SQLite
pub struct TestDatabase {
    db: Database,
}

impl TestDatabase {
    /// Create a new in-memory test database with the replication tables
    pub async fn new() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Database::Sqlite(pool);
        db.initialize_tables().await?;
        Ok(Self { db })
    }

    pub fn db(&self) -> Database {
        self.db.clone()
    }

    /// Runs one statement in its own transaction
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut tx = self.db.begin_tx().await?;
        let affected = tx.execute(sql, params).await?;
        tx.commit().await?;
        Ok(affected)
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>> {
        let mut tx = self.db.begin_tx().await?;
        let rows = tx.query(sql, &[]).await?;
        tx.rollback().await;
        Ok(rows)
    }

    /// Creates the tables the changeset tests replay into
    pub async fn with_app_tables(self) -> Result<Self> {
        self.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
            &[],
        )
        .await?;
        self.execute(
            "CREATE TABLE accounts (identifier BLOB PRIMARY KEY, balance INTEGER NOT NULL)",
            &[],
        )
        .await?;
        Ok(self)
    }
}
