//! Ledger persistence.
//!
//! Thin wrapper around the SQLite pool used by the ledger. The record
//! store holding the domain entities themselves is an external
//! collaborator; only chained blocks live here.

use sqlx::SqlitePool;

use crate::error::AuditError;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, AuditError> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                compressed_data TEXT NOT NULL,
                hash TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                modified_by TEXT NOT NULL,
                version BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_blocks_hash ON ledger_blocks (hash)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_blocks_entity ON ledger_blocks (entity_type, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
