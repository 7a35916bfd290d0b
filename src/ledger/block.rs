//! Ledger block model.
//!
//! One hash chain exists per (entity_type, entity_id) pair; blocks are
//! append-only and immutable after persistence.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::AuditError;

/// Sentinel previous-hash carried by the first block of every chain.
pub const GENESIS_PREVIOUS_HASH: &str = "GENESIS";

/// A persisted block in a per-entity hash chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Store-assigned identity. `None` until the block is persisted.
    pub id: Option<i64>,
    pub compressed_data: String,
    /// 64-char lowercase hex, unique across the ledger.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub modified_by: String,
    pub version: Vec<u8>,
}

/// Caller-supplied input for an append; chaining fields are assigned by
/// the ledger service.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub compressed_data: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub modified_by: String,
    pub version: Vec<u8>,
}

/// Timestamp rendering used both in the hash input and in the persisted
/// row. Must stay byte-stable across a store round trip.
pub fn canonical_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Block {
    /// Keyed hash over the block's chained fields. Store-assigned id and
    /// any signature material are excluded: neither is stable until after
    /// the first save.
    pub fn compute_hash(&self, secret: &[u8]) -> Result<String, AuditError> {
        let raw = format!(
            "{}-{}-{}-{}-{}",
            self.compressed_data,
            canonical_timestamp(self.timestamp),
            self.previous_hash,
            self.entity_type,
            self.modified_by
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| AuditError::CryptographicError(format!("Invalid ledger secret: {}", e)))?;
        mac.update(raw.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            id: None,
            compressed_data: "H4sIAAAA".to_string(),
            hash: String::new(),
            timestamp: Utc::now(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            entity_type: "PatientRecord".to_string(),
            entity_id: Uuid::new_v4(),
            modified_by: "clerk".to_string(),
            version: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let block = sample_block();
        let h1 = block.compute_hash(b"ledger-secret").unwrap();
        let h2 = block.compute_hash(b"ledger-secret").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_hash_ignores_store_identity() {
        let mut block = sample_block();
        let before = block.compute_hash(b"ledger-secret").unwrap();
        block.id = Some(42);
        let after = block.compute_hash(b"ledger-secret").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_hash_covers_chained_fields() {
        let block = sample_block();
        let original = block.compute_hash(b"ledger-secret").unwrap();

        let mut tampered = block.clone();
        tampered.modified_by = "intruder".to_string();
        assert_ne!(original, tampered.compute_hash(b"ledger-secret").unwrap());

        let mut tampered = block;
        tampered.previous_hash = "0".repeat(64);
        assert_ne!(original, tampered.compute_hash(b"ledger-secret").unwrap());
    }

    #[test]
    fn test_canonical_timestamp_round_trip() {
        let now = Utc::now();
        let rendered = canonical_timestamp(now);
        let parsed = DateTime::parse_from_rfc3339(&rendered)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(rendered, canonical_timestamp(parsed));
    }
}
