//! Audit trail orchestration.
//!
//! Ties the subsystems together: a record mutation is diffed against its
//! previous recorded state, compressed, signed, appended to the entity's
//! hash chain, and noted in the Merkle-backed event log. Entity state is
//! reloaded through a closed registry of per-type accessors; nothing here
//! knows any concrete domain type.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::audit::diff::diff_entities;
use crate::audit::event_log::AuditEventLog;
use crate::crypto::signatures::{SignatureEngine, SignedData};
use crate::error::AuditError;
use crate::ledger::{Block, LedgerService, NewBlock};

/// Accessor for the current state of one entity type in the record store.
/// The record store itself is an external collaborator; it hands entity
/// state over as a serialized value tree.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn fetch_current(&self, entity_id: Uuid) -> Result<Option<Value>, AuditError>;
}

/// Closed registry mapping an entity type tag to its store accessor.
#[derive(Default)]
pub struct EntityRegistry {
    handlers: HashMap<String, Arc<dyn EntityStore>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, store: Arc<dyn EntityStore>) {
        self.handlers.insert(entity_type.into(), store);
    }

    pub fn resolve(&self, entity_type: &str) -> Option<Arc<dyn EntityStore>> {
        self.handlers.get(entity_type).cloned()
    }
}

/// What a ledger block's compressed data decodes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPayload {
    pub state: Value,
    pub changes: String,
}

/// One row of an entity's reconstructed history.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub modified_by: String,
    pub entity_type: String,
    pub serialized_snapshot: String,
    pub changes: String,
}

/// Outcome of recording one change: the chained block plus the signature
/// material needed to verify the embedded snapshot later.
#[derive(Debug, Clone)]
pub struct SignedChange {
    pub block: Block,
    pub signed: SignedData,
}

pub struct AuditTrail {
    ledger: Arc<LedgerService>,
    signatures: Arc<SignatureEngine>,
    event_log: Arc<AuditEventLog>,
    registry: EntityRegistry,
    signature_expiry: Duration,
}

impl AuditTrail {
    pub fn new(
        ledger: Arc<LedgerService>,
        signatures: Arc<SignatureEngine>,
        event_log: Arc<AuditEventLog>,
        registry: EntityRegistry,
    ) -> Self {
        Self {
            ledger,
            signatures,
            event_log,
            registry,
            signature_expiry: Duration::hours(1),
        }
    }

    /// Record a mutation of the named entity: reload its current state,
    /// diff it against the last recorded snapshot, then sign, chain, and
    /// log the result.
    pub async fn record_change(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        modified_by: &str,
    ) -> Result<SignedChange, AuditError> {
        let store = self.registry.resolve(entity_type).ok_or_else(|| {
            AuditError::ValidationError(format!("Entity type '{}' not registered", entity_type))
        })?;

        let current = store.fetch_current(entity_id).await?.ok_or_else(|| {
            AuditError::ValidationError(format!(
                "Entity {} of type '{}' not found in the record store",
                entity_id, entity_type
            ))
        })?;

        let previous = self.latest_recorded_state(entity_type, entity_id).await?;
        let changes = diff_entities(previous.as_ref(), Some(&current));

        let payload = AuditPayload {
            state: current,
            changes,
        };
        let serialized = serde_json::to_string(&payload)?;
        let compressed = compress_payload(&serialized)?;

        let now = Utc::now();
        let signed = self
            .signatures
            .sign(serialized.as_bytes(), now, self.signature_expiry)?;

        let block = self
            .ledger
            .add_block(NewBlock {
                compressed_data: compressed,
                entity_type: entity_type.to_string(),
                entity_id,
                modified_by: modified_by.to_string(),
                version: now.timestamp_micros().to_be_bytes().to_vec(),
            })
            .await?;

        self.event_log.log_event(&format!(
            "Changes recorded for {} with id {}",
            entity_type, entity_id
        ))?;

        info!(entity_type, %entity_id, modified_by, "Audit record created");
        Ok(SignedChange { block, signed })
    }

    /// Reconstruct the entity's history from its chain, oldest first.
    pub async fn entity_history(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let blocks = self
            .ledger
            .blocks_for_entity(entity_type, entity_id)
            .await?;

        let mut records = Vec::with_capacity(blocks.len());
        for block in blocks {
            let payload = decode_payload(&block.compressed_data)?;
            records.push(AuditRecord {
                timestamp: block.timestamp,
                action: if block.previous_hash == crate::ledger::GENESIS_PREVIOUS_HASH {
                    "Created".to_string()
                } else {
                    "Updated".to_string()
                },
                modified_by: block.modified_by,
                entity_type: block.entity_type,
                serialized_snapshot: serde_json::to_string_pretty(&payload.state)?,
                changes: payload.changes,
            });
        }
        Ok(records)
    }

    /// Diff a historical block's snapshot against the entity's current
    /// live state. Soft failures come back as descriptive text, matching
    /// how history views consume them.
    pub async fn changes_since(&self, block: &Block) -> Result<String, AuditError> {
        let store = match self.registry.resolve(&block.entity_type) {
            Some(store) => store,
            None => return Ok(format!("Entity type '{}' not registered", block.entity_type)),
        };

        let current = match store.fetch_current(block.entity_id).await? {
            Some(current) => current,
            None => return Ok(format!("Entity {} no longer exists", block.entity_id)),
        };

        let payload = decode_payload(&block.compressed_data)?;
        Ok(diff_entities(Some(&payload.state), Some(&current)))
    }

    async fn latest_recorded_state(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Option<Value>, AuditError> {
        match self.ledger.last_block(entity_type, entity_id).await? {
            Some(block) => Ok(Some(decode_payload(&block.compressed_data)?.state)),
            None => Ok(None),
        }
    }
}

/// Gzip + base64 for the ledger's compressed column.
pub fn compress_payload(data: &str) -> Result<String, AuditError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data.as_bytes())?;
    Ok(BASE64.encode(encoder.finish()?))
}

pub fn decompress_payload(compressed: &str) -> Result<String, AuditError> {
    let bytes = BASE64
        .decode(compressed)
        .map_err(|e| AuditError::ValidationError(format!("Invalid compressed payload: {}", e)))?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

fn decode_payload(compressed: &str) -> Result<AuditPayload, AuditError> {
    Ok(serde_json::from_str(&decompress_payload(compressed)?)?)
}
