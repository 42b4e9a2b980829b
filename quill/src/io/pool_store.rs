//! Credential pool persistence.
//!
//! The state record (`pool.json`) and the secrets (`credentials.json`) are
//! separate files so the record can be shown and shared freely.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::pool::{CredentialPool, PoolRecord, SecretsRecord};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone)]
pub struct PoolStore {
    pub pool_path: PathBuf,
    pub credentials_path: PathBuf,
}

impl PoolStore {
    pub fn new(pool_path: impl Into<PathBuf>, credentials_path: impl Into<PathBuf>) -> Self {
        Self {
            pool_path: pool_path.into(),
            credentials_path: credentials_path.into(),
        }
    }

    /// Load the pool. Missing files mean an empty pool.
    pub fn load(&self) -> Result<CredentialPool> {
        let record: PoolRecord = read_optional_json(&self.pool_path)?.unwrap_or_default();
        let secrets: SecretsRecord =
            read_optional_json(&self.credentials_path)?.unwrap_or_default();
        let pool = CredentialPool::from_records(&record, &secrets);
        debug!(size = pool.size(), current = pool.current_index(), "credential pool loaded");
        Ok(pool)
    }

    /// Persist both halves. Secrets are written first so a crash never leaves
    /// a record pointing at a slot without a secret.
    pub fn save(&self, pool: &CredentialPool) -> Result<()> {
        write_json_atomic(&self.credentials_path, &pool.secrets())?;
        restrict_permissions(&self.credentials_path)?;
        write_json_atomic(&self.pool_path, &pool.record())?;
        debug!(size = pool.size(), current = pool.current_index(), "credential pool saved");
        Ok(())
    }
}

fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restrict permissions {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
