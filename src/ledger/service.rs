//! Per-entity hash-chained ledger.

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AuditError;
use crate::ledger::block::{canonical_timestamp, Block, NewBlock, GENESIS_PREVIOUS_HASH};
use crate::store::Database;

/// Outcome of a chain walk. Inconsistencies are reported here, not raised.
#[derive(Debug, Clone)]
pub struct ChainValidation {
    pub is_valid: bool,
    pub message: String,
}

pub struct LedgerService {
    db: Database,
    secret: Vec<u8>,
    append_lock: Mutex<()>,
}

impl LedgerService {
    pub fn new(db: Database, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            db,
            secret: secret.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// Append a block to the entity's chain, synthesizing and persisting a
    /// genesis block first if the chain is empty. The whole append runs
    /// inside one transaction; any failure rolls back and surfaces as a
    /// wrapped storage error.
    pub async fn add_block(&self, new: NewBlock) -> Result<Block, AuditError> {
        let _guard = self.append_lock.lock().await;

        let mut tx = self.db.pool().begin().await.map_err(|e| {
            AuditError::StorageError(format!("Failed to begin ledger transaction: {}", e))
        })?;

        let predecessor =
            match Self::last_block_tx(&mut tx, &new.entity_type, new.entity_id).await? {
                Some(block) => block,
                None => {
                    let genesis = self.genesis_for(&new)?;
                    let genesis = Self::insert_block(&mut tx, genesis).await?;
                    debug!(
                        entity_type = %new.entity_type,
                        entity_id = %new.entity_id,
                        "Created genesis block"
                    );
                    genesis
                }
            };

        let mut block = Block {
            id: None,
            compressed_data: new.compressed_data,
            hash: String::new(),
            timestamp: Utc::now(),
            previous_hash: predecessor.hash.clone(),
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            modified_by: new.modified_by,
            version: new.version,
        };
        block.hash = block.compute_hash(&self.secret)?;

        let block = Self::insert_block(&mut tx, block).await?;

        tx.commit().await.map_err(|e| {
            AuditError::StorageError(format!("Failed to commit ledger append: {}", e))
        })?;

        info!(
            entity_type = %block.entity_type,
            entity_id = %block.entity_id,
            block_id = ?block.id,
            "Block appended"
        );
        Ok(block)
    }

    /// Walk the entity's chain in store order, checking link continuity and
    /// recomputed data integrity. Returns the first failure found.
    pub async fn validate_chain(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<ChainValidation, AuditError> {
        let blocks = self.blocks_for_entity(entity_type, entity_id).await?;

        if blocks.is_empty() {
            return Ok(ChainValidation {
                is_valid: false,
                message: "No blocks found for the specified entity.".to_string(),
            });
        }

        for pair in blocks.windows(2) {
            let previous = &pair[0];
            let current = &pair[1];

            if current.previous_hash != previous.hash {
                return Ok(ChainValidation {
                    is_valid: false,
                    message: format!(
                        "Link consistency failed at block id {:?}. Expected previous hash '{}', but got '{}'.",
                        current.id, previous.hash, current.previous_hash
                    ),
                });
            }

            let calculated = current.compute_hash(&self.secret)?;
            if current.hash != calculated {
                return Ok(ChainValidation {
                    is_valid: false,
                    message: format!(
                        "Data integrity failed at block id {:?}. Expected hash '{}', but got '{}'.",
                        current.id, calculated, current.hash
                    ),
                });
            }
        }

        Ok(ChainValidation {
            is_valid: true,
            message: "Chain is valid.".to_string(),
        })
    }

    /// Latest block of the entity's chain, by store-assigned id.
    pub async fn last_block(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Option<Block>, AuditError> {
        let row = sqlx::query(
            r#"
            SELECT id, compressed_data, hash, timestamp, previous_hash, entity_type, entity_id, modified_by, version
            FROM ledger_blocks
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(entity_type)
        .bind(entity_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(Self::row_to_block).transpose()
    }

    /// All blocks of the entity's chain in append order.
    pub async fn blocks_for_entity(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<Block>, AuditError> {
        let rows = sqlx::query(
            r#"
            SELECT id, compressed_data, hash, timestamp, previous_hash, entity_type, entity_id, modified_by, version
            FROM ledger_blocks
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(Self::row_to_block).collect()
    }

    fn genesis_for(&self, new: &NewBlock) -> Result<Block, AuditError> {
        let mut genesis = Block {
            id: None,
            compressed_data: new.compressed_data.clone(),
            hash: String::new(),
            timestamp: Utc::now(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            entity_type: new.entity_type.clone(),
            entity_id: new.entity_id,
            modified_by: "System".to_string(),
            version: new.version.clone(),
        };
        genesis.hash = genesis.compute_hash(&self.secret)?;
        Ok(genesis)
    }

    async fn last_block_tx(
        tx: &mut Transaction<'_, Sqlite>,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Option<Block>, AuditError> {
        let row = sqlx::query(
            r#"
            SELECT id, compressed_data, hash, timestamp, previous_hash, entity_type, entity_id, modified_by, version
            FROM ledger_blocks
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(entity_type)
        .bind(entity_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_block).transpose()
    }

    async fn insert_block(
        tx: &mut Transaction<'_, Sqlite>,
        mut block: Block,
    ) -> Result<Block, AuditError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_blocks
            (compressed_data, hash, timestamp, previous_hash, entity_type, entity_id, modified_by, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&block.compressed_data)
        .bind(&block.hash)
        .bind(canonical_timestamp(block.timestamp))
        .bind(&block.previous_hash)
        .bind(&block.entity_type)
        .bind(block.entity_id.to_string())
        .bind(&block.modified_by)
        .bind(&block.version)
        .execute(&mut **tx)
        .await
        .map_err(|e| AuditError::StorageError(format!("Failed to persist block: {}", e)))?;

        block.id = Some(result.last_insert_rowid());
        Ok(block)
    }

    fn row_to_block(row: sqlx::sqlite::SqliteRow) -> Result<Block, AuditError> {
        let timestamp: String = row.get("timestamp");
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| {
                AuditError::DataIntegrityError(format!("Unparseable block timestamp: {}", e))
            })?
            .with_timezone(&Utc);

        let entity_id: String = row.get("entity_id");
        let entity_id = Uuid::parse_str(&entity_id).map_err(|e| {
            AuditError::DataIntegrityError(format!("Unparseable block entity id: {}", e))
        })?;

        Ok(Block {
            id: Some(row.get::<i64, _>("id")),
            compressed_data: row.get("compressed_data"),
            hash: row.get("hash"),
            timestamp,
            previous_hash: row.get("previous_hash"),
            entity_type: row.get("entity_type"),
            entity_id,
            modified_by: row.get("modified_by"),
            version: row.get("version"),
        })
    }
}
