//! Durable key material.
//!
//! Everything written to disk goes through one sealed-container format:
//! gzip-compressed JSON encrypted with XChaCha20-Poly1305 under a key
//! derived from the process-wide secret. The seed archive additionally
//! keeps a backup copy so a lost primary can be recreated.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::keypool::PoolFile;
use crate::crypto::snapshot::KeyPoolSnapshot;
use crate::error::AuditError;

const ARCHIVE_SALT: &[u8] = b"recordchain.archive.v1";
const NONCE_LEN: usize = 24;
const MASTER_KEY_LEN: usize = 32;

/// One encrypted seed record inside the key archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedEntry {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    /// Base64, 24 bytes.
    pub nonce: String,
    /// Base64, XChaCha20-Poly1305 ciphertext of the 32-byte seed.
    pub data: String,
}

pub struct KeyStorage {
    passphrase_path: PathBuf,
    seed_archive_path: PathBuf,
    seed_backup_path: PathBuf,
    pool_path: PathBuf,
    snapshot_dir: PathBuf,
    secret: Vec<u8>,
    archive_key: [u8; 32],
}

impl KeyStorage {
    pub fn new(
        secret: &str,
        passphrase_path: impl Into<PathBuf>,
        key_dir: impl Into<PathBuf>,
    ) -> Result<Self, AuditError> {
        if secret.is_empty() {
            return Err(AuditError::ConfigError(
                "Process secret must not be empty".to_string(),
            ));
        }

        let key_dir = key_dir.into();
        std::fs::create_dir_all(&key_dir).map_err(|e| {
            AuditError::StorageError(format!("Failed to create key directory: {}", e))
        })?;
        let snapshot_dir = key_dir.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir).map_err(|e| {
            AuditError::StorageError(format!("Failed to create snapshot directory: {}", e))
        })?;

        let archive_key = derive_key(secret.as_bytes(), ARCHIVE_SALT)?;

        Ok(Self {
            passphrase_path: passphrase_path.into(),
            seed_archive_path: key_dir.join("secure_seeds.bin"),
            seed_backup_path: key_dir.join("secure_seeds_backup.bin"),
            pool_path: key_dir.join("key_pool.bin"),
            snapshot_dir,
            secret: secret.as_bytes().to_vec(),
            archive_key,
        })
    }

    /// Derive a fresh master key from the passphrase file. The salt folds
    /// in the current timestamp, so every call yields new material.
    pub fn derive_master_key(&self) -> Result<[u8; MASTER_KEY_LEN], AuditError> {
        let passphrase = std::fs::read_to_string(&self.passphrase_path).map_err(|e| {
            AuditError::StorageError(format!(
                "Passphrase file {} not readable: {}",
                self.passphrase_path.display(),
                e
            ))
        })?;

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let mut salt = Vec::with_capacity(self.secret.len() + timestamp.len());
        salt.extend_from_slice(&self.secret);
        salt.extend_from_slice(timestamp.as_bytes());

        let mut passphrase = passphrase.trim().as_bytes().to_vec();
        let key = derive_key(&passphrase, &salt);
        passphrase.zeroize();
        key
    }

    pub fn seeds_exist(&self) -> bool {
        self.seed_archive_path.exists() || self.seed_backup_path.exists()
    }

    /// Create the seed archive (and its backup) from fresh random seeds.
    /// Explicit first-run operation; pool generation never creates seeds
    /// on its own.
    pub fn bootstrap_seeds(&self, count: usize) -> Result<(), AuditError> {
        if count == 0 {
            return Err(AuditError::ValidationError(
                "Seed count must be non-zero".to_string(),
            ));
        }

        let cipher = XChaCha20Poly1305::new((&self.archive_key).into());
        let mut entries = Vec::with_capacity(count);
        let mut rng = rand::thread_rng();

        for i in 0..count {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            let mut nonce = [0u8; NONCE_LEN];
            rng.fill_bytes(&mut nonce);

            let ciphertext = cipher
                .encrypt(XNonce::from_slice(&nonce), seed.as_slice())
                .map_err(|_| {
                    AuditError::CryptographicError("Seed encryption failed".to_string())
                })?;
            seed.zeroize();

            entries.push(SeedEntry {
                version: (i + 1).to_string(),
                timestamp: Utc::now(),
                nonce: BASE64.encode(nonce),
                data: BASE64.encode(ciphertext),
            });
        }

        let json = serde_json::to_vec(&entries)?;
        let sealed = self.seal(&json)?;
        write_atomic(&self.seed_archive_path, &sealed)?;
        write_atomic(&self.seed_backup_path, &sealed)?;

        info!(count, "Seed archive created");
        Ok(())
    }

    /// Load the seed archive, falling back to the backup (and recreating
    /// the primary from it) when the primary is missing. Both missing is
    /// fatal.
    pub fn load_seed_entries(&self) -> Result<Vec<SeedEntry>, AuditError> {
        let sealed = if self.seed_archive_path.exists() {
            std::fs::read(&self.seed_archive_path)?
        } else if self.seed_backup_path.exists() {
            warn!("Seed archive missing; recreating from backup");
            let bytes = std::fs::read(&self.seed_backup_path)?;
            write_atomic(&self.seed_archive_path, &bytes)?;
            bytes
        } else {
            return Err(AuditError::StorageError(
                "Seed archive and backup are both missing".to_string(),
            ));
        };

        let json = self.open(&sealed)?;
        let entries: Vec<SeedEntry> = serde_json::from_slice(&json)?;
        if entries.is_empty() {
            return Err(AuditError::StorageError(
                "Seed archive contains no entries".to_string(),
            ));
        }
        Ok(entries)
    }

    /// Decrypt one seed entry back to its 32 raw bytes.
    pub fn decrypt_seed(&self, entry: &SeedEntry) -> Result<Vec<u8>, AuditError> {
        let nonce = BASE64
            .decode(&entry.nonce)
            .map_err(|e| AuditError::ValidationError(format!("Invalid seed nonce: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(AuditError::ValidationError(format!(
                "Seed nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&entry.data)
            .map_err(|e| AuditError::ValidationError(format!("Invalid seed data: {}", e)))?;

        let cipher = XChaCha20Poly1305::new((&self.archive_key).into());
        cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| AuditError::CryptographicError("Seed decryption failed".to_string()))
    }

    pub fn pool_exists(&self) -> bool {
        self.pool_path.exists()
    }

    pub fn save_pool(&self, pool: &PoolFile) -> Result<(), AuditError> {
        let json = serde_json::to_vec(pool)?;
        let sealed = self.seal(&json)?;
        write_atomic(&self.pool_path, &sealed)?;
        Ok(())
    }

    pub fn load_pool(&self) -> Result<PoolFile, AuditError> {
        if !self.pool_path.exists() {
            return Err(AuditError::StorageError(
                "Persisted key pool not found".to_string(),
            ));
        }
        let sealed = std::fs::read(&self.pool_path)?;
        let json = self.open(&sealed)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn save_snapshot(&self, snapshot: &KeyPoolSnapshot) -> Result<(), AuditError> {
        let json = serde_json::to_vec(snapshot)?;
        let sealed = self.seal(&json)?;
        write_atomic(&self.snapshot_path(snapshot.id), &sealed)?;
        Ok(())
    }

    pub fn load_snapshot(&self, id: Uuid) -> Result<Option<KeyPoolSnapshot>, AuditError> {
        let path = self.snapshot_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&path)?;
        let json = self.open(&sealed)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    /// Delete snapshot files created before the cutoff. Runs after the
    /// overlap window that follows a full regeneration.
    pub fn remove_stale_snapshots(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.snapshot_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let sealed = std::fs::read(&path)?;
            let snapshot: KeyPoolSnapshot = match self
                .open(&sealed)
                .and_then(|json| serde_json::from_slice(&json).map_err(AuditError::from))
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot file");
                    continue;
                }
            };

            if snapshot.created_at < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Stale snapshots removed");
        }
        Ok(removed)
    }

    fn snapshot_path(&self, id: Uuid) -> PathBuf {
        self.snapshot_dir.join(format!("snapshot_{}.json", id))
    }

    /// Compress and encrypt an at-rest payload: `nonce ‖ ciphertext(gzip)`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, AuditError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(plaintext)?;
        let compressed = encoder.finish()?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let cipher = XChaCha20Poly1305::new((&self.archive_key).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), compressed.as_slice())
            .map_err(|_| AuditError::CryptographicError("Container sealing failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, AuditError> {
        if sealed.len() <= NONCE_LEN {
            return Err(AuditError::ValidationError(
                "Sealed container is truncated".to_string(),
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new((&self.archive_key).into());
        let compressed = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuditError::CryptographicError("Container opening failed".to_string()))?;

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut plaintext = Vec::new();
        decoder.read_to_end(&mut plaintext)?;
        Ok(plaintext)
    }
}

fn derive_key(material: &[u8], salt: &[u8]) -> Result<[u8; 32], AuditError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(material, salt, &mut key)
        .map_err(|e| AuditError::CryptographicError(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AuditError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
