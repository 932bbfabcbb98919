//! Session storage: file-based (primary) + OS keychain (secondary)
//!
//! Three records are shared between the app and the tunnel extension: the API
//! credentials, the device keypair, and the current certificate. Consumers
//! receive the store as an injected [`SessionStorage`] handle; nothing in this
//! crate reaches for a global.
//!
//! There is deliberately no cross-record or cross-process locking: the app
//! and the extension may both replace a record and the last write wins. The
//! refresh scheduling margin exists to make such collisions rare.

use crate::api::types::{AuthCredentials, StoredCertificate};
use crate::keys::DeviceKeypair;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use keyring::Entry;
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SERVICE_NAME: &str = "KestrelVPN";
const CREDENTIALS_RECORD: &str = "auth_credentials";
const KEYS_RECORD: &str = "device_keys";
const CERTIFICATE_RECORD: &str = "vpn_certificate";

// Obfuscation key for the on-disk copies; keeps records from being casually
// readable, the keychain layer carries the actual protection.
const OBFUSCATION_KEY: &[u8] = b"KestrelVPNSessionStorage";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage serialization error: {0}")]
    Serialize(String),

    #[error("Storage I/O error: {0}")]
    Io(String),
}

/// Persistence contract for the three session records. Implementations must
/// tolerate concurrent access from multiple processes; readers see either the
/// old or the new record, never a blend.
pub trait SessionStorage: Send + Sync {
    fn fetch_credentials(&self) -> Option<AuthCredentials>;
    fn store_credentials(&self, credentials: &AuthCredentials) -> Result<(), StorageError>;
    fn clear_credentials(&self);

    fn fetch_keys(&self) -> Option<DeviceKeypair>;
    fn store_keys(&self, keys: &DeviceKeypair) -> Result<(), StorageError>;
    fn clear_keys(&self);

    fn fetch_certificate(&self) -> Option<StoredCertificate>;
    fn store_certificate(&self, certificate: &StoredCertificate) -> Result<(), StorageError>;
    fn clear_certificate(&self);
}

/// File storage primary, OS keychain secondary. The file copy is the one that
/// works predictably across hosts; the keychain copy is an extra layer that
/// is skipped with a warning when the backend is unavailable.
pub struct FileStorage {
    data_dir: PathBuf,
    use_keyring: bool,
}

impl FileStorage {
    pub fn new() -> Result<Self, StorageError> {
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join(SERVICE_NAME))
            .ok_or_else(|| StorageError::Io("Could not determine data directory".to_string()))?;

        Self::with_data_dir(data_dir, true)
    }

    /// Storage rooted at an explicit directory. `use_keyring: false` keeps
    /// tests and keychain-less hosts on pure file storage.
    pub fn with_data_dir(data_dir: PathBuf, use_keyring: bool) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| StorageError::Io(format!("Failed to create data directory: {}", e)))?;

        info!("Session storage initialized at {}", data_dir.display());

        Ok(Self {
            data_dir,
            use_keyring,
        })
    }

    fn record_path(&self, record: &str) -> PathBuf {
        self.data_dir.join(format!("{}.dat", record))
    }

    /// Simple XOR obfuscation; symmetric.
    fn obfuscate(data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, &byte)| byte ^ OBFUSCATION_KEY[i % OBFUSCATION_KEY.len()])
            .collect()
    }

    fn keyring_entry(&self, record: &str) -> Option<Entry> {
        if !self.use_keyring {
            return None;
        }
        match Entry::new(SERVICE_NAME, record) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Keyring unavailable for {} ({}), file storage only", record, e);
                None
            }
        }
    }

    fn store_record<T: Serialize>(&self, record: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)
            .map_err(|e| StorageError::Serialize(format!("Failed to serialize {}: {}", record, e)))?;

        let encoded = BASE64.encode(Self::obfuscate(json.as_bytes()));
        let path = self.record_path(record);
        std::fs::write(&path, &encoded).map_err(|e| {
            error!("Failed to write {} file: {}", record, e);
            StorageError::Io(format!("Failed to write {}: {}", record, e))
        })?;
        debug!("Stored {} ({} bytes)", record, encoded.len());

        // Secondary copy; failure here never fails the store.
        if let Some(entry) = self.keyring_entry(record) {
            if let Err(e) = entry.set_password(&json) {
                warn!("Failed to store {} in keyring: {}", record, e);
            }
        }

        Ok(())
    }

    fn load_record<T: DeserializeOwned>(&self, record: &str) -> Option<T> {
        if let Some(value) = self.load_record_from_file(record) {
            return Some(value);
        }

        // Fallback: keychain copy, migrated back to file for next time.
        let entry = self.keyring_entry(record)?;
        match entry.get_password() {
            Ok(json) => match serde_json::from_str::<T>(&json) {
                Ok(value) => {
                    debug!("Loaded {} from keyring, migrating to file", record);
                    let encoded = BASE64.encode(Self::obfuscate(json.as_bytes()));
                    let _ = std::fs::write(self.record_path(record), encoded);
                    Some(value)
                }
                Err(e) => {
                    warn!("Failed to deserialize keyring {}: {}", record, e);
                    None
                }
            },
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!("Keyring read error for {}: {:?}", record, e);
                None
            }
        }
    }

    fn load_record_from_file<T: DeserializeOwned>(&self, record: &str) -> Option<T> {
        let path = self.record_path(record);
        if !path.exists() {
            return None;
        }

        let encoded = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to read {} file: {}", record, e);
                return None;
            }
        };

        let obfuscated = match BASE64.decode(encoded.trim()) {
            Ok(data) => data,
            Err(e) => {
                error!("Corrupt {} file (base64): {}", record, e);
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        let json = match String::from_utf8(Self::obfuscate(&obfuscated)) {
            Ok(s) => s,
            Err(e) => {
                error!("Corrupt {} file (utf8): {}", record, e);
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        match serde_json::from_str::<T>(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Failed to deserialize {}: {}", record, e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn clear_record(&self, record: &str) {
        let path = self.record_path(record);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                error!("Failed to delete {} file: {}", record, e);
            }
        }

        if let Some(entry) = self.keyring_entry(record) {
            match entry.delete_credential() {
                Ok(_) => debug!("Cleared {} from keyring", record),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => warn!("Failed to clear keyring {}: {}", record, e),
            }
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl SessionStorage for FileStorage {
    fn fetch_credentials(&self) -> Option<AuthCredentials> {
        self.load_record(CREDENTIALS_RECORD)
    }

    fn store_credentials(&self, credentials: &AuthCredentials) -> Result<(), StorageError> {
        info!("Storing API credentials for session {}", credentials.session_id);
        self.store_record(CREDENTIALS_RECORD, credentials)
    }

    fn clear_credentials(&self) {
        self.clear_record(CREDENTIALS_RECORD);
    }

    fn fetch_keys(&self) -> Option<DeviceKeypair> {
        self.load_record(KEYS_RECORD)
    }

    fn store_keys(&self, keys: &DeviceKeypair) -> Result<(), StorageError> {
        self.store_record(KEYS_RECORD, keys)
    }

    fn clear_keys(&self) {
        self.clear_record(KEYS_RECORD);
    }

    fn fetch_certificate(&self) -> Option<StoredCertificate> {
        self.load_record(CERTIFICATE_RECORD)
    }

    fn store_certificate(&self, certificate: &StoredCertificate) -> Result<(), StorageError> {
        info!(
            "Storing certificate valid until {}",
            certificate.valid_until
        );
        self.store_record(CERTIFICATE_RECORD, certificate)
    }

    fn clear_certificate(&self) {
        self.clear_record(CERTIFICATE_RECORD);
    }
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryRecords>,
}

#[derive(Default)]
struct MemoryRecords {
    credentials: Option<AuthCredentials>,
    keys: Option<DeviceKeypair>,
    certificate: Option<StoredCertificate>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn fetch_credentials(&self) -> Option<AuthCredentials> {
        self.inner.lock().ok()?.credentials.clone()
    }

    fn store_credentials(&self, credentials: &AuthCredentials) -> Result<(), StorageError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.credentials = Some(credentials.clone());
        }
        Ok(())
    }

    fn clear_credentials(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.credentials = None;
        }
    }

    fn fetch_keys(&self) -> Option<DeviceKeypair> {
        self.inner.lock().ok()?.keys.clone()
    }

    fn store_keys(&self, keys: &DeviceKeypair) -> Result<(), StorageError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.keys = Some(keys.clone());
        }
        Ok(())
    }

    fn clear_keys(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.keys = None;
        }
    }

    fn fetch_certificate(&self) -> Option<StoredCertificate> {
        self.inner.lock().ok()?.certificate.clone()
    }

    fn store_certificate(&self, certificate: &StoredCertificate) -> Result<(), StorageError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.certificate = Some(certificate.clone());
        }
        Ok(())
    }

    fn clear_certificate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.certificate = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_credentials() -> AuthCredentials {
        AuthCredentials {
            user_id: "user-1".to_string(),
            session_id: "session-1".to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: vec!["vpn".to_string()],
        }
    }

    fn make_certificate() -> StoredCertificate {
        StoredCertificate {
            certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            valid_until: Utc::now() + Duration::days(1),
            refresh_time: Utc::now() + Duration::hours(23),
            features: None,
        }
    }

    #[test]
    fn test_obfuscation_roundtrip() {
        let original = b"Hello, session storage!";
        let obfuscated = FileStorage::obfuscate(original);
        assert_ne!(original.as_slice(), obfuscated.as_slice());
        let recovered = FileStorage::obfuscate(&obfuscated);
        assert_eq!(original.as_slice(), recovered.as_slice());
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(storage.fetch_credentials().is_none());
        assert!(storage.fetch_keys().is_none());
        assert!(storage.fetch_certificate().is_none());

        let creds = make_credentials();
        let keys = crate::keys::DeviceKeypair::generate();
        let cert = make_certificate();

        storage.store_credentials(&creds).unwrap();
        storage.store_keys(&keys).unwrap();
        storage.store_certificate(&cert).unwrap();

        assert_eq!(storage.fetch_credentials().unwrap(), creds);
        assert_eq!(storage.fetch_keys().unwrap(), keys);
        assert_eq!(storage.fetch_certificate().unwrap(), cert);

        storage.clear_credentials();
        storage.clear_keys();
        storage.clear_certificate();
        assert!(storage.fetch_credentials().is_none());
        assert!(storage.fetch_keys().is_none());
        assert!(storage.fetch_certificate().is_none());
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_data_dir(dir.path().to_path_buf(), false).unwrap();

        let creds = make_credentials();
        storage.store_credentials(&creds).unwrap();
        assert_eq!(storage.fetch_credentials().unwrap(), creds);

        let cert = make_certificate();
        storage.store_certificate(&cert).unwrap();
        assert_eq!(storage.fetch_certificate().unwrap(), cert);

        storage.clear_credentials();
        assert!(storage.fetch_credentials().is_none());
        // Certificate record untouched by clearing credentials
        assert!(storage.fetch_certificate().is_some());
    }

    #[test]
    fn test_file_storage_overwrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_data_dir(dir.path().to_path_buf(), false).unwrap();

        let mut creds = make_credentials();
        storage.store_credentials(&creds).unwrap();

        creds.access_token = "rotated".to_string();
        storage.store_credentials(&creds).unwrap();

        assert_eq!(storage.fetch_credentials().unwrap().access_token, "rotated");
    }

    #[test]
    fn test_file_storage_discards_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_data_dir(dir.path().to_path_buf(), false).unwrap();

        storage.store_credentials(&make_credentials()).unwrap();
        let path = storage.record_path(CREDENTIALS_RECORD);
        std::fs::write(&path, "!!! not base64 !!!").unwrap();

        assert!(storage.fetch_credentials().is_none());
        // Corrupt file is removed so the next fetch is a clean miss
        assert!(!path.exists());
    }

    #[test]
    fn test_file_storage_records_are_obfuscated_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_data_dir(dir.path().to_path_buf(), false).unwrap();

        storage.store_credentials(&make_credentials()).unwrap();
        let raw = std::fs::read_to_string(storage.record_path(CREDENTIALS_RECORD)).unwrap();
        assert!(!raw.contains("access"));
        assert!(!raw.contains("session-1"));
    }
}
