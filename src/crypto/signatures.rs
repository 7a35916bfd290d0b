//! Dual-signature engine.
//!
//! Every sign operation binds the payload to an expiry and to a versioned
//! snapshot of the key pool, using two independent primitives: an ECDSA
//! P-521 signature (SHA-512 digest) under a deterministically selected
//! pool key, and an HMAC-SHA256 under the pool-wide sign key. Verification
//! re-derives the key selection from the payload's own expiry, so a
//! tampered key index fails before any signature math runs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use p521::ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::Signature;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::keypool::{KeyEntry, KeyPoolManager};
use crate::crypto::snapshot::{KeyPoolSnapshot, SnapshotCache};
use crate::crypto::storage::KeyStorage;
use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// Leading fraction of the pool keys are selected from.
const POOL_SEGMENT_RATIO: f64 = 0.2;

/// Expiry ticks appended to signed payloads: microseconds since the Unix
/// epoch, 8 bytes big-endian.
const TICKS_LEN: usize = 8;

/// Result of a sign operation. `payload` is the exact byte sequence both
/// signatures cover (`data ‖ expiry ticks`); verifiers need it verbatim.
#[derive(Debug, Clone)]
pub struct SignedData {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
    pub snapshot_version: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SignatureEngine {
    pool: Arc<KeyPoolManager>,
    storage: Arc<KeyStorage>,
    snapshots: SnapshotCache,
}

impl SignatureEngine {
    pub fn new(pool: Arc<KeyPoolManager>, storage: Arc<KeyStorage>) -> Self {
        Self::with_cache_capacity(pool, storage, SnapshotCache::DEFAULT_CAPACITY)
    }

    pub fn with_cache_capacity(
        pool: Arc<KeyPoolManager>,
        storage: Arc<KeyStorage>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            pool,
            storage,
            snapshots: SnapshotCache::new(cache_capacity),
        }
    }

    /// Sign `data`, binding it to `timestamp + expiry` and to a fresh
    /// snapshot of the current pool.
    pub fn sign(
        &self,
        data: &[u8],
        timestamp: DateTime<Utc>,
        expiry: Duration,
    ) -> Result<SignedData, AuditError> {
        let snapshot = Arc::new(self.pool.snapshot());
        self.storage.save_snapshot(snapshot.as_ref())?;
        self.snapshots.insert(snapshot.clone());

        let effective_expiry = timestamp
            .checked_add_signed(expiry)
            .ok_or_else(|| AuditError::ExpiryError("Effective expiry out of range".to_string()))?;
        let payload = payload_with_expiry(data, effective_expiry);

        let key_index = select_key_index(&snapshot.key_pool, effective_expiry)?;
        let entry = &snapshot.key_pool[key_index];

        let signing_key = entry.signing_key()?;
        let ecdsa_signature: Signature = signing_key.sign(&payload);

        let mut mac = HmacSha256::new_from_slice(&snapshot.sign_key)
            .map_err(|e| AuditError::CryptographicError(format!("Invalid sign key: {}", e)))?;
        mac.update(&payload);
        let hmac_signature = mac.finalize().into_bytes();

        let signature = package_signatures(
            &ecdsa_signature.to_bytes(),
            &hmac_signature,
            key_index as i32,
        );

        Ok(SignedData {
            payload,
            signature,
            snapshot_version: snapshot.id.to_string(),
            expires_at: effective_expiry,
        })
    }

    /// Verify a signed payload against the snapshot it names. Fails closed:
    /// every expected failure mode returns `false` with the reason logged.
    pub fn verify(&self, payload: &[u8], signature: &[u8], snapshot_version: &str) -> bool {
        let data_expiry = match extract_expiry(payload) {
            Some(expiry) => expiry,
            None => {
                warn!("Invalid payload: missing or malformed expiry ticks");
                return false;
            }
        };

        let now = Utc::now();
        if data_expiry < now {
            warn!(expiry = %data_expiry, %now, "Signature expired");
            return false;
        }

        let (ecdsa_signature, hmac_signature, key_index) = match unpackage_signatures(signature) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "Malformed signature blob");
                return false;
            }
        };

        let snapshot_id = match Uuid::parse_str(snapshot_version) {
            Ok(id) => id,
            Err(_) => {
                warn!(version = snapshot_version, "Invalid snapshot version");
                return false;
            }
        };

        let snapshot = match self.resolve_snapshot(snapshot_id) {
            Some(snapshot) => snapshot,
            None => {
                warn!(%snapshot_id, "Snapshot not found");
                return false;
            }
        };

        let expected_index = match select_key_index(&snapshot.key_pool, data_expiry) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "Key selection failed during verification");
                return false;
            }
        };

        if key_index < 0 || key_index as usize != expected_index {
            warn!(provided = key_index, expected = expected_index, "Key index mismatch");
            return false;
        }

        let entry = &snapshot.key_pool[expected_index];
        // A key must outlive what it signs.
        if entry.expiry <= data_expiry {
            warn!(key_expiry = %entry.expiry, data_expiry = %data_expiry, "Key expires before document");
            return false;
        }

        let mut mac = match HmacSha256::new_from_slice(&snapshot.sign_key) {
            Ok(mac) => mac,
            Err(e) => {
                warn!(error = %e, "Invalid sign key in snapshot");
                return false;
            }
        };
        mac.update(payload);
        if mac.verify_slice(&hmac_signature).is_err() {
            warn!("HMAC validation failed");
            return false;
        }

        let verifying_key = match entry.verifying_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Unusable public key in snapshot");
                return false;
            }
        };
        let ecdsa_signature = match Signature::from_slice(&ecdsa_signature) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(error = %e, "Malformed ECDSA signature");
                return false;
            }
        };

        verifying_key.verify(payload, &ecdsa_signature).is_ok()
    }

    /// Rotate the front segment of the pool. Exposed here so callers hold
    /// one handle for signing and rotation alike.
    pub fn shift_keys(&self) -> Result<usize, AuditError> {
        self.pool.shift_keys()
    }

    /// Regenerate the whole pool from a brand-new master key.
    pub fn regenerate_keys(&self) -> Result<(), AuditError> {
        self.pool.regenerate_keys()
    }

    pub fn pool(&self) -> &KeyPoolManager {
        &self.pool
    }

    fn resolve_snapshot(&self, id: Uuid) -> Option<Arc<KeyPoolSnapshot>> {
        if let Some(snapshot) = self.snapshots.get(&id) {
            return Some(snapshot);
        }

        match self.storage.load_snapshot(id) {
            Ok(Some(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                self.snapshots.insert(snapshot.clone());
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, %id, "Snapshot load failed");
                None
            }
        }
    }
}

/// Builds `data ‖ expiry ticks`, the byte sequence both signatures cover.
pub fn payload_with_expiry(data: &[u8], effective_expiry: DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(data.len() + TICKS_LEN);
    payload.extend_from_slice(data);
    payload.extend_from_slice(&effective_expiry.timestamp_micros().to_be_bytes());
    payload
}

fn extract_expiry(payload: &[u8]) -> Option<DateTime<Utc>> {
    if payload.len() < TICKS_LEN {
        return None;
    }
    let ticks = i64::from_be_bytes(payload[payload.len() - TICKS_LEN..].try_into().ok()?);
    DateTime::from_timestamp_micros(ticks)
}

/// Deterministic key selection. Candidates are restricted to the leading
/// 20% of the pool; the scan starts at a digest of the expiry ticks and
/// walks forward (no wrap) to the first key that outlives the document.
pub fn select_key_index(
    pool: &[KeyEntry],
    document_expiry: DateTime<Utc>,
) -> Result<usize, AuditError> {
    let segment = (pool.len() as f64 * POOL_SEGMENT_RATIO) as usize;
    if segment == 0 {
        return Err(AuditError::CryptographicError(
            "Key pool too small for a selection segment".to_string(),
        ));
    }

    let ticks = document_expiry.timestamp_micros().to_be_bytes();
    let digest = Sha256::digest(ticks);
    let seed = i32::from_be_bytes(digest[..4].try_into().expect("digest is 32 bytes"));
    let start = seed.unsigned_abs() as usize % segment;

    for (index, entry) in pool.iter().enumerate().take(segment).skip(start) {
        if entry.expiry > document_expiry {
            return Ok(index);
        }
    }

    Err(AuditError::CryptographicError(
        "No valid key found in selection segment".to_string(),
    ))
}

/// Blob layout: `i32 sig_len | sig | i32 mac_len | mac | i32 key_index`,
/// big-endian prefixes.
fn package_signatures(ecdsa_signature: &[u8], hmac_signature: &[u8], key_index: i32) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(12 + ecdsa_signature.len() + hmac_signature.len());
    out.extend_from_slice(&(ecdsa_signature.len() as i32).to_be_bytes());
    out.extend_from_slice(ecdsa_signature);
    out.extend_from_slice(&(hmac_signature.len() as i32).to_be_bytes());
    out.extend_from_slice(hmac_signature);
    out.extend_from_slice(&key_index.to_be_bytes());
    out
}

fn unpackage_signatures(blob: &[u8]) -> Result<(Vec<u8>, Vec<u8>, i32), AuditError> {
    fn read_i32(blob: &[u8], cursor: &mut usize) -> Result<i32, AuditError> {
        let end = cursor
            .checked_add(4)
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| AuditError::ValidationError("Signature blob truncated".to_string()))?;
        let value = i32::from_be_bytes(blob[*cursor..end].try_into().expect("4-byte slice"));
        *cursor = end;
        Ok(value)
    }

    fn read_bytes(blob: &[u8], cursor: &mut usize, len: i32) -> Result<Vec<u8>, AuditError> {
        let len: usize = usize::try_from(len)
            .map_err(|_| AuditError::ValidationError("Negative length in blob".to_string()))?;
        let end = cursor
            .checked_add(len)
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| AuditError::ValidationError("Signature blob truncated".to_string()))?;
        let bytes = blob[*cursor..end].to_vec();
        *cursor = end;
        Ok(bytes)
    }

    let mut cursor = 0usize;
    let sig_len = read_i32(blob, &mut cursor)?;
    let ecdsa_signature = read_bytes(blob, &mut cursor, sig_len)?;
    let mac_len = read_i32(blob, &mut cursor)?;
    let hmac_signature = read_bytes(blob, &mut cursor, mac_len)?;
    let key_index = read_i32(blob, &mut cursor)?;

    if cursor != blob.len() {
        return Err(AuditError::ValidationError(
            "Trailing bytes in signature blob".to_string(),
        ));
    }

    Ok((ecdsa_signature, hmac_signature, key_index))
}
