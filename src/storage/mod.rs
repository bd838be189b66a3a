//! Key-value persistence for attestation and session state.
//!
//! Two scopes:
//! - **durable** ([`FileStore`]): survives restarts; holds the device id and
//!   the session record
//! - **ephemeral** ([`MemoryStore`]): lives as long as the owning
//!   `AttestationContext`; holds the fingerprint and the geolocation entry

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Durable key: per-installation device identifier.
pub const DEVICE_ID_KEY: &str = "device_id";
/// Durable key: bearer token.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Durable key: cached user record (JSON).
pub const CACHED_USER_KEY: &str = "user";
/// Durable key: last activity timestamp (epoch ms).
pub const LAST_ACTIVITY_KEY: &str = "last_activity";
/// Durable key: token expiry timestamp (epoch ms).
pub const TOKEN_EXPIRY_KEY: &str = "token_expiry";
/// Durable key: authentication cookie mirroring the token.
pub const AUTH_COOKIE_KEY: &str = "auth_cookie";
/// Durable key: persisted client-state snapshot.
pub const CLIENT_STATE_KEY: &str = "client_state";

/// Ephemeral key: session fingerprint.
pub const FINGERPRINT_KEY: &str = "device_fingerprint";
/// Ephemeral key: cached geolocation entry.
pub const GEO_POSITION_KEY: &str = "geo_position";

/// Durable keys that make up a session. Never includes the device id.
pub const SESSION_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    CACHED_USER_KEY,
    LAST_ACTIVITY_KEY,
    TOKEN_EXPIRY_KEY,
];

/// String key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Returns whether it was present.
    fn remove(&self, key: &str) -> Result<bool>;

    fn keys(&self) -> Result<Vec<String>>;
}

// ── In-memory store ──────────────────────────────────────────────

/// Process-local store, used for session-lifetime values.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

// ── File-backed store ────────────────────────────────────────────

/// Store file name inside the data directory.
const STORE_FILENAME: &str = "signet_store.json";

/// JSON-file store. Every mutation rewrites the file via temp + rename.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
        let path = data_dir.join(STORE_FILENAME);

        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt store file {}", path.display()))?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let existed = entries.remove(key).is_some();
        if existed {
            self.flush(&entries)?;
        }
        Ok(existed)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.remove("k").unwrap());
        assert!(!store.remove("k").unwrap());
    }

    #[test]
    fn memory_store_keys_sorted() {
        let store = MemoryStore::new();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::open(tmp.path()).unwrap();
            store.set(DEVICE_ID_KEY, "dev-1").unwrap();
            store.set(ACCESS_TOKEN_KEY, "tok").unwrap();
        }
        let store = FileStore::open(tmp.path()).unwrap();
        assert_eq!(store.get(DEVICE_ID_KEY).unwrap().as_deref(), Some("dev-1"));
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("tok"));
    }

    #[test]
    fn file_store_remove_persists() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.set(ACCESS_TOKEN_KEY, "tok").unwrap();
        assert!(store.remove(ACCESS_TOKEN_KEY).unwrap());

        let reopened = FileStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.get(ACCESS_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(STORE_FILENAME), "{not json").unwrap();
        let err = FileStore::open(tmp.path()).err().unwrap();
        assert!(err.to_string().contains("Corrupt store file"));
    }

    #[test]
    fn file_store_accepts_empty_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(STORE_FILENAME), "").unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.set("k", "v").unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn session_keys_exclude_device_id() {
        assert!(!SESSION_KEYS.contains(&DEVICE_ID_KEY));
    }
}
