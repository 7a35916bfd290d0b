use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// Number of signing keys in a full production pool.
pub const DEFAULT_POOL_SIZE: usize = 50_000;

/// Number of encrypted seed entries the pool is derived from.
pub const DEFAULT_SEED_COUNT: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Process-wide secret. Required; there is no default.
    pub secret: String,
    pub passphrase_path: PathBuf,
    pub key_dir: PathBuf,
    pub audit_log_path: PathBuf,
    pub pool_size: usize,
    pub seed_count: usize,
    pub shift_interval: Duration,
    pub regenerate_interval: Duration,
    pub overlap_window: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self, AuditError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://recordchain.db?mode=rwc".to_string());

        let secret = env::var("RECORDCHAIN_SECRET").map_err(|_| {
            AuditError::ConfigError("RECORDCHAIN_SECRET environment secret is missing".to_string())
        })?;

        let passphrase_path = env::var("RECORDCHAIN_PASSPHRASE_FILE")
            .unwrap_or_else(|_| "passphrase.txt".to_string())
            .into();

        let key_dir = env::var("RECORDCHAIN_KEY_DIR")
            .unwrap_or_else(|_| "keys".to_string())
            .into();

        let audit_log_path = env::var("RECORDCHAIN_AUDIT_LOG")
            .unwrap_or_else(|_| "audit.log".to_string())
            .into();

        let pool_size = env::var("RECORDCHAIN_POOL_SIZE")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| AuditError::ConfigError(format!("Invalid pool size: {}", e)))?
            .unwrap_or(DEFAULT_POOL_SIZE);

        let seed_count = env::var("RECORDCHAIN_SEED_COUNT")
            .ok()
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| AuditError::ConfigError(format!("Invalid seed count: {}", e)))?
            .unwrap_or(DEFAULT_SEED_COUNT);

        if pool_size == 0 || seed_count == 0 {
            return Err(AuditError::ConfigError(
                "Pool size and seed count must be non-zero".to_string(),
            ));
        }

        Ok(AppConfig {
            database_url,
            secret,
            passphrase_path,
            key_dir,
            audit_log_path,
            pool_size,
            seed_count,
            shift_interval: Duration::from_secs(2 * 60 * 60),
            regenerate_interval: Duration::from_secs(24 * 60 * 60),
            overlap_window: Duration::from_secs(60 * 60),
        })
    }
}
