//! Installation-scoped device identity.
//!
//! The first call on a fresh installation generates a UUID v4 and persists
//! it under [`DEVICE_ID_KEY`]; every later call returns the same value until
//! the durable store is wiped. Without a usable durable store (server or
//! headless contexts) the fixed [`SERVER_DEVICE_ID`] is returned instead.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::{KeyValueStore, DEVICE_ID_KEY};

/// Returned when no durable store is available.
pub const SERVER_DEVICE_ID: &str = "server";

pub struct IdentityStore {
    durable: Option<Arc<dyn KeyValueStore>>,
    /// Serializes the read-then-create sequence.
    create_lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(durable: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            durable,
            create_lock: Mutex::new(()),
        }
    }

    /// Get or create the persistent device ID.
    pub fn get_device_id(&self) -> String {
        let Some(store) = self.durable.as_ref() else {
            return SERVER_DEVICE_ID.to_string();
        };

        let _guard = self.create_lock.lock();
        match store.get(DEVICE_ID_KEY) {
            Ok(Some(id)) if !id.trim().is_empty() => return id.trim().to_string(),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Device id unreadable; using server sentinel");
                return SERVER_DEVICE_ID.to_string();
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = store.set(DEVICE_ID_KEY, &id) {
            tracing::warn!(error = %e, "Device id not persisted; using server sentinel");
            return SERVER_DEVICE_ID.to_string();
        }
        tracing::info!(device_id = %id, "Generated new device id");
        id
    }
}
