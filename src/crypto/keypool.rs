//! Rotating pool of asymmetric signing keys.
//!
//! The pool is derived from a small set of encrypted seeds plus a master
//! key: every index gets 32 bytes of HKDF entropy which is XOR-mixed into
//! a fresh P-521 private scalar. Rotation shifts the front of the pool to
//! the back on a short cadence; a full regeneration from a brand-new
//! master key happens daily.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Months, Utc};
use hkdf::Hkdf;
use p521::ecdsa::{SigningKey, VerifyingKey};
use p521::FieldBytes;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::crypto::snapshot::KeyPoolSnapshot;
use crate::crypto::storage::KeyStorage;
use crate::error::AuditError;

/// P-521 private scalars are 66 bytes.
const SCALAR_LEN: usize = 66;
const ENTROPY_LEN: usize = 32;
const SIGN_KEY_LEN: usize = 32;

/// One signing key in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub index: usize,
    /// Base64, 66-byte P-521 private scalar (entropy already mixed in).
    pub private_key: String,
    /// Base64, SEC1 uncompressed point.
    pub public_key: String,
    /// Base64, the 32 entropy bytes mixed into this entry's scalar.
    pub entropy: String,
    pub expiry: DateTime<Utc>,
}

impl KeyEntry {
    pub fn signing_key(&self) -> Result<SigningKey, AuditError> {
        let bytes = BASE64.decode(&self.private_key).map_err(|e| {
            AuditError::CryptographicError(format!("Invalid private key encoding: {}", e))
        })?;
        if bytes.len() != SCALAR_LEN {
            return Err(AuditError::CryptographicError(format!(
                "Private scalar must be {} bytes, got {}",
                SCALAR_LEN,
                bytes.len()
            )));
        }
        SigningKey::from_bytes(FieldBytes::from_slice(&bytes))
            .map_err(|e| AuditError::CryptographicError(format!("Invalid private scalar: {}", e)))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, AuditError> {
        let bytes = BASE64.decode(&self.public_key).map_err(|e| {
            AuditError::CryptographicError(format!("Invalid public key encoding: {}", e))
        })?;
        VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| AuditError::CryptographicError(format!("Invalid public key: {}", e)))
    }
}

/// Persisted pool: the entries plus the pool-wide sign key minted with
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFile {
    pub sign_key: Arc<Vec<u8>>,
    pub entries: Arc<Vec<KeyEntry>>,
}

struct PoolState {
    entries: Arc<Vec<KeyEntry>>,
    sign_key: Arc<Vec<u8>>,
}

pub struct KeyPoolManager {
    storage: Arc<KeyStorage>,
    pool_size: usize,
    shift_extension: Duration,
    state: RwLock<PoolState>,
    rotation_lock: Mutex<()>,
}

impl KeyPoolManager {
    /// Load the persisted pool, or generate a fresh one when none exists
    /// (or when the persisted size no longer matches the configuration).
    pub fn initialize(
        storage: Arc<KeyStorage>,
        pool_size: usize,
        shift_interval: StdDuration,
    ) -> Result<Self, AuditError> {
        if pool_size == 0 {
            return Err(AuditError::ConfigError(
                "Pool size must be non-zero".to_string(),
            ));
        }

        let shift_extension = Duration::from_std(shift_interval)
            .map_err(|e| AuditError::ConfigError(format!("Invalid shift interval: {}", e)))?
            + Duration::hours(2);

        let pool_file = if storage.pool_exists() {
            let loaded = storage.load_pool()?;
            if loaded.entries.len() == pool_size {
                loaded
            } else {
                warn!(
                    persisted = loaded.entries.len(),
                    configured = pool_size,
                    "Persisted pool size does not match configuration; regenerating"
                );
                Self::generate_pool_file(&storage, pool_size)?
            }
        } else {
            info!(pool_size, "No persisted key pool; generating");
            Self::generate_pool_file(&storage, pool_size)?
        };

        Ok(Self {
            storage,
            pool_size,
            shift_extension,
            state: RwLock::new(PoolState {
                entries: pool_file.entries,
                sign_key: pool_file.sign_key,
            }),
            rotation_lock: Mutex::new(()),
        })
    }

    /// Immutable, versioned view of the current pool. An atomic read plus
    /// two reference-count bumps; no key material is copied.
    pub fn snapshot(&self) -> KeyPoolSnapshot {
        let state = self.state.read();
        KeyPoolSnapshot {
            id: uuid::Uuid::new_v4(),
            key_pool: state.entries.clone(),
            sign_key: state.sign_key.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn pool_len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn entries(&self) -> Arc<Vec<KeyEntry>> {
        self.state.read().entries.clone()
    }

    pub fn sign_key(&self) -> Arc<Vec<u8>> {
        self.state.read().sign_key.clone()
    }

    /// Rotate the front 5% (minimum one) of the pool to the back,
    /// extending the moved keys' expiry. Returns how many keys moved.
    pub fn shift_keys(&self) -> Result<usize, AuditError> {
        let _rotation = self.rotation_lock.lock();

        let (current, sign_key) = {
            let state = self.state.read();
            (state.entries.clone(), state.sign_key.clone())
        };
        if current.is_empty() {
            return Ok(0);
        }

        let rotate = rotation_count(current.len());
        let new_expiry = Utc::now() + self.shift_extension;

        let mut rotated: Vec<KeyEntry> = Vec::with_capacity(current.len());
        rotated.extend_from_slice(&current[rotate..]);
        for entry in &current[..rotate] {
            let mut moved = entry.clone();
            moved.expiry = new_expiry;
            rotated.push(moved);
        }
        for (position, entry) in rotated.iter_mut().enumerate() {
            entry.index = position;
        }

        let entries = Arc::new(rotated);
        self.storage.save_pool(&PoolFile {
            sign_key: sign_key.clone(),
            entries: entries.clone(),
        })?;
        self.state.write().entries = entries;

        info!(rotated = rotate, new_expiry = %new_expiry, "Signature keys shifted");
        Ok(rotate)
    }

    /// Full regeneration: brand-new master key, brand-new pool, brand-new
    /// sign key. Snapshots already on disk stay loadable; their cleanup is
    /// scheduled separately, after the overlap window.
    pub fn regenerate_keys(&self) -> Result<(), AuditError> {
        let _rotation = self.rotation_lock.lock();

        let pool_file = Self::generate_pool_file(&self.storage, self.pool_size)?;

        let mut state = self.state.write();
        state.entries = pool_file.entries;
        state.sign_key = pool_file.sign_key;

        info!("Full key regeneration completed");
        Ok(())
    }

    fn generate_pool_file(
        storage: &Arc<KeyStorage>,
        pool_size: usize,
    ) -> Result<PoolFile, AuditError> {
        let mut master_key = storage.derive_master_key()?;
        let entries = generate_entries(storage.as_ref(), &master_key, pool_size);
        master_key.zeroize();
        let entries = entries?;
        ensure_pool_size(&entries, pool_size)?;

        let mut sign_key = vec![0u8; SIGN_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut sign_key);

        let pool_file = PoolFile {
            sign_key: Arc::new(sign_key),
            entries: Arc::new(entries),
        };
        storage.save_pool(&pool_file)?;
        Ok(pool_file)
    }
}

/// How many keys a shift moves: 5% of the pool, at least one.
pub fn rotation_count(pool_len: usize) -> usize {
    (pool_len / 20).max(1)
}

pub(crate) fn ensure_pool_size(entries: &[KeyEntry], expected: usize) -> Result<(), AuditError> {
    if entries.len() != expected {
        return Err(AuditError::CryptographicError(format!(
            "Invalid key pool size after regeneration: expected {}, got {}",
            expected,
            entries.len()
        )));
    }
    Ok(())
}

/// Derive the full pool from the seed archive. Parallelized across OS
/// threads; entry order (and therefore index assignment) is preserved.
fn generate_entries(
    storage: &KeyStorage,
    master_key: &[u8],
    pool_size: usize,
) -> Result<Vec<KeyEntry>, AuditError> {
    let seed_entries = storage.load_seed_entries()?;
    let mut seeds = seed_entries
        .iter()
        .map(|entry| storage.decrypt_seed(entry))
        .collect::<Result<Vec<_>, _>>()?;

    let mut call_salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut call_salt);

    let generated_at = Utc::now();
    let ticks = generated_at.timestamp_micros();
    let expiry = generated_at
        .checked_add_months(Months::new(6))
        .ok_or_else(|| AuditError::ExpiryError("Key expiry out of range".to_string()))?;

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(pool_size)
        .max(1);
    let chunk = pool_size.div_ceil(workers);

    let results = std::thread::scope(|scope| {
        let seeds = &seeds;
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let start = worker * chunk;
            let end = ((worker + 1) * chunk).min(pool_size);
            if start >= end {
                break;
            }
            handles.push(scope.spawn(move || -> Result<Vec<KeyEntry>, AuditError> {
                let mut chunk_entries = Vec::with_capacity(end - start);
                for i in start..end {
                    let seed = &seeds[i % seeds.len()];
                    let mut entropy = derive_entropy(seed, master_key, &call_salt, i, ticks)?;
                    let entry = generate_key_entry(i, &entropy, expiry);
                    entropy.zeroize();
                    chunk_entries.push(entry?);
                }
                Ok(chunk_entries)
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    for seed in &mut seeds {
        seed.zeroize();
    }

    let mut entries = Vec::with_capacity(pool_size);
    for result in results {
        let chunk_entries = result.map_err(|_| {
            AuditError::CryptographicError("Key generation worker panicked".to_string())
        })??;
        entries.extend(chunk_entries);
    }
    Ok(entries)
}

/// 32 bytes of per-index entropy: HKDF-SHA512 over the decrypted seed,
/// salted with the master key plus a per-call random salt, bound to the
/// index and the generation timestamp.
fn derive_entropy(
    seed: &[u8],
    master_key: &[u8],
    call_salt: &[u8],
    index: usize,
    ticks: i64,
) -> Result<[u8; ENTROPY_LEN], AuditError> {
    let mut salt = Vec::with_capacity(master_key.len() + call_salt.len());
    salt.extend_from_slice(master_key);
    salt.extend_from_slice(call_salt);

    let mut info = [0u8; 16];
    info[..8].copy_from_slice(&(index as u64).to_be_bytes());
    info[8..].copy_from_slice(&ticks.to_be_bytes());

    let hkdf = Hkdf::<Sha512>::new(Some(&salt), seed);
    let mut okm = [0u8; ENTROPY_LEN];
    hkdf.expand(&info, &mut okm).map_err(|e| {
        AuditError::CryptographicError(format!("Entropy derivation failed: {}", e))
    })?;
    Ok(okm)
}

fn generate_key_entry(
    index: usize,
    entropy: &[u8; ENTROPY_LEN],
    expiry: DateTime<Utc>,
) -> Result<KeyEntry, AuditError> {
    let base = SigningKey::random(&mut OsRng);
    let mut scalar = base.to_bytes().to_vec();

    // Mix entropy into the low half of the scalar only; the high bytes
    // stay untouched so the result remains a valid curve scalar.
    let offset = scalar.len() - entropy.len();
    for (i, byte) in entropy.iter().enumerate() {
        scalar[offset + i] ^= byte;
    }

    let signing = SigningKey::from_bytes(FieldBytes::from_slice(&scalar))
        .map_err(|e| AuditError::CryptographicError(format!("Derived scalar rejected: {}", e)))?;
    let verifying = VerifyingKey::from(&signing);

    let entry = KeyEntry {
        index,
        private_key: BASE64.encode(&scalar),
        public_key: BASE64.encode(verifying.to_encoded_point(false).as_bytes()),
        entropy: BASE64.encode(entropy),
        expiry,
    };
    scalar.zeroize();
    Ok(entry)
}
