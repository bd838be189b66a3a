//! TTL-bounded cache for the last acquired position.
//!
//! Last write wins. Entries older than the TTL are treated as absent but are
//! not eagerly deleted; the next successful acquisition overwrites them.
//! The entry is mirrored into the ephemeral store so a restarted attester
//! within the same session picks it up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::storage::{KeyValueStore, GEO_POSITION_KEY};

/// A captured position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub lat: f64,
    pub lng: f64,
    pub captured_at: DateTime<Utc>,
}

impl GeoPosition {
    pub fn new(lat: f64, lng: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            lat,
            lng,
            captured_at,
        }
    }

    /// `now - captured_at < ttl`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age_ms = (now - self.captured_at).num_milliseconds();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        age_ms < ttl_ms
    }
}

pub struct GeoCache {
    slot: RwLock<Option<GeoPosition>>,
    ttl: Duration,
    ephemeral: Arc<dyn KeyValueStore>,
}

impl GeoCache {
    pub fn new(ttl: Duration, ephemeral: Arc<dyn KeyValueStore>) -> Self {
        Self {
            slot: RwLock::new(None),
            ttl,
            ephemeral,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replace the cached position.
    pub fn store(&self, position: GeoPosition) {
        *self.slot.write() = Some(position);
        match serde_json::to_string(&position) {
            Ok(raw) => {
                if let Err(e) = self.ephemeral.set(GEO_POSITION_KEY, &raw) {
                    tracing::debug!(error = %e, "Failed to mirror geo position");
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to encode geo position"),
        }
    }

    /// The cached position if it is still fresh at `now`.
    pub fn fresh_at(&self, now: DateTime<Utc>) -> Option<GeoPosition> {
        let slot = *self.slot.read();
        slot.filter(|p| p.is_fresh_at(now, self.ttl))
    }

    /// Load the mirrored entry from the ephemeral store if still fresh.
    pub fn load_persisted(&self, now: DateTime<Utc>) -> bool {
        let raw = match self.ephemeral.get(GEO_POSITION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!(error = %e, "Geo cache unreadable");
                return false;
            }
        };

        match serde_json::from_str::<GeoPosition>(&raw) {
            Ok(position) if position.is_fresh_at(now, self.ttl) => {
                *self.slot.write() = Some(position);
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding malformed geo cache entry");
                self.remove_mirror();
                false
            }
        }
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
        self.remove_mirror();
    }

    fn remove_mirror(&self) {
        if let Err(e) = self.ephemeral.remove(GEO_POSITION_KEY) {
            tracing::debug!(error = %e, "Failed to remove mirrored geo position");
        }
    }
}
