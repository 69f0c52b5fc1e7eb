//! On-disk persistence of the per-drone secret key.
//!
//! Registration provisions a secret key that is the drone's proof of identity
//! for every subsequent session. It is stored as a small JSON record with
//! owner-only permissions and written atomically (temp file + rename) so a
//! crash can never leave a half-written identity behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Default secret file name, relative to the working directory.
pub const SECRET_FILE_NAME: &str = ".drone_secret";

/// Persisted secret record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRecord {
    /// UUID the secret was issued to
    pub drone_uuid: String,
    /// Per-drone secret key from registration
    pub secret_key: String,
    /// Unix seconds at which the record was written
    pub created_at: u64,
}

/// Handle to the secret file location.
///
/// The store does not cache; callers keep the loaded secret in memory for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    /// Store at the default location (`.drone_secret` in the working directory).
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(SECRET_FILE_NAME),
        }
    }

    /// Store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Isolated per-UUID store for test mode: `<dir>/.drone_secret_<uuid>`.
    pub fn test_mode(dir: impl AsRef<Path>, drone_uuid: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| BridgeError::filesystem(dir.display().to_string(), e))?;
        Ok(Self {
            path: dir.join(format!("{}_{}", SECRET_FILE_NAME, drone_uuid)),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if a secret file exists at the store's path.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Loads the persisted record.
    ///
    /// A missing file or a record with empty fields is reported as
    /// `NotRegistered`, distinct from I/O or parse failures.
    pub fn load(&self) -> Result<SecretRecord> {
        if !self.path.exists() {
            return Err(BridgeError::NotRegistered(format!(
                "secret file not found: {}",
                self.path.display()
            )));
        }

        let data = fs::read(&self.path)
            .map_err(|e| BridgeError::filesystem(self.path.display().to_string(), e))?;
        let record: SecretRecord = serde_json::from_slice(&data).map_err(|e| {
            BridgeError::config(format!(
                "failed to parse secret file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if record.drone_uuid.is_empty() || record.secret_key.is_empty() {
            return Err(BridgeError::NotRegistered(
                "secret file is missing uuid or key".to_string(),
            ));
        }

        Ok(record)
    }

    /// Writes the record atomically with owner-only permissions.
    pub fn save(&self, drone_uuid: &str, secret_key: &str) -> Result<()> {
        let record = SecretRecord {
            drone_uuid: drone_uuid.to_string(),
            secret_key: secret_key.to_string(),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let data = serde_json::to_vec_pretty(&record)
            .map_err(|e| BridgeError::internal(format!("failed to marshal secret: {}", e)))?;

        let tmp = self.path.with_file_name(format!(
            "{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| SECRET_FILE_NAME.to_string())
        ));

        fs::write(&tmp, &data)
            .map_err(|e| BridgeError::filesystem(tmp.display().to_string(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&tmp)
                .map_err(|e| BridgeError::filesystem(tmp.display().to_string(), e))?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&tmp, perms)
                .map_err(|e| BridgeError::filesystem(tmp.display().to_string(), e))?;
        }

        fs::rename(&tmp, &self.path)
            .map_err(|e| BridgeError::filesystem(self.path.display().to_string(), e))?;

        debug!(path = %self.path.display(), "secret key saved");
        Ok(())
    }

    /// Removes the secret file if present.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::filesystem(self.path.display().to_string(), e)),
        }
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let store = SecretStore::at(dir.path().join(SECRET_FILE_NAME));

        store
            .save("00000001-0000-0000-0000-000000000001", "secret-key-32-bytes")
            .expect("save");
        let record = store.load().expect("load");

        assert_eq!(record.drone_uuid, "00000001-0000-0000-0000-000000000001");
        assert_eq!(record.secret_key, "secret-key-32-bytes");
        assert!(record.created_at > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let store = SecretStore::at(dir.path().join(SECRET_FILE_NAME));
        store.save("uuid", "key").expect("save");

        let mode = fs::metadata(store.path())
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_is_not_registered() {
        let dir = TempDir::new().expect("tempdir");
        let store = SecretStore::at(dir.path().join(SECRET_FILE_NAME));
        assert!(!store.exists());
        let err = store.load().expect_err("must fail");
        assert!(matches!(err, BridgeError::NotRegistered(_)));
    }

    #[test]
    fn test_empty_fields_are_not_registered() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(SECRET_FILE_NAME);
        fs::write(&path, br#"{"drone_uuid":"","secret_key":"","created_at":0}"#)
            .expect("write");
        let err = SecretStore::at(&path).load().expect_err("must fail");
        assert!(matches!(err, BridgeError::NotRegistered(_)));
    }

    #[test]
    fn test_test_mode_path_is_per_uuid() {
        let dir = TempDir::new().expect("tempdir");
        let store =
            SecretStore::test_mode(dir.path(), "aaaa0000-0000-0000-0000-000000000001")
                .expect("store");
        assert!(store
            .path()
            .to_string_lossy()
            .ends_with(".drone_secret_aaaa0000-0000-0000-0000-000000000001"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = SecretStore::at(dir.path().join(SECRET_FILE_NAME));
        store.save("uuid", "key").expect("save");
        store.delete().expect("delete");
        store.delete().expect("delete again");
        assert!(!store.exists());
    }
}
