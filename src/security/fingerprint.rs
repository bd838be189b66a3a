//! Session-scoped environment fingerprint.
//!
//! Collects an ordered set of environment attributes, joins them into a
//! canonical string and digests it with the context's crypto provider. The
//! result (`fp-<hex>`) is cached in the ephemeral store, so it is computed
//! at most once per session.
//!
//! Attribute order is part of the format: changing it changes every
//! fingerprint.

use std::sync::Arc;

use super::crypto::CryptoProvider;
use crate::storage::{KeyValueStore, FINGERPRINT_KEY};

/// Prefix on every fingerprint value.
pub const FINGERPRINT_PREFIX: &str = "fp-";

/// Hex characters kept from the digest.
const FINGERPRINT_HEX_LEN: usize = 32;

/// Inputs to the fingerprint. Hosts with a display fill in the screen fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentAttributes {
    pub user_agent: String,
    pub locale: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u8,
    /// Local time minus UTC, in minutes.
    pub timezone_offset_minutes: i32,
}

impl EnvironmentAttributes {
    /// Collect attributes from the current process environment.
    pub fn detect(app_version: &str) -> Self {
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .find_map(|k| std::env::var(k).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| "en-US".to_string());

        let offset_secs = chrono::Local::now().offset().local_minus_utc();

        Self {
            user_agent: format!(
                "signet-client/{app_version} ({}; {})",
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            locale,
            screen_width: 0,
            screen_height: 0,
            color_depth: 24,
            timezone_offset_minutes: offset_secs / 60,
        }
    }

    /// Override the display geometry reported by the host application.
    pub fn with_screen(mut self, width: u32, height: u32, color_depth: u8) -> Self {
        self.screen_width = width;
        self.screen_height = height;
        self.color_depth = color_depth;
        self
    }

    /// `|`-joined attributes in fixed order.
    pub fn canonical(&self) -> String {
        [
            self.user_agent.clone(),
            self.locale.clone(),
            format!("{}x{}", self.screen_width, self.screen_height),
            self.color_depth.to_string(),
            self.timezone_offset_minutes.to_string(),
        ]
        .join("|")
    }
}

pub struct FingerprintGenerator {
    crypto: Arc<dyn CryptoProvider>,
    ephemeral: Arc<dyn KeyValueStore>,
    attributes: EnvironmentAttributes,
}

impl FingerprintGenerator {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        ephemeral: Arc<dyn KeyValueStore>,
        attributes: EnvironmentAttributes,
    ) -> Self {
        Self {
            crypto,
            ephemeral,
            attributes,
        }
    }

    pub fn attributes(&self) -> &EnvironmentAttributes {
        &self.attributes
    }

    /// Cached fingerprint for this session, computing it on first use.
    pub async fn get_fingerprint(&self) -> String {
        match self.ephemeral.get(FINGERPRINT_KEY) {
            Ok(Some(cached)) if cached.starts_with(FINGERPRINT_PREFIX) => return cached,
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Fingerprint cache unreadable; recomputing"),
        }

        let fingerprint = self.compute();
        if let Err(e) = self.ephemeral.set(FINGERPRINT_KEY, &fingerprint) {
            tracing::warn!(error = %e, "Failed to cache fingerprint");
        }
        fingerprint
    }

    /// Fingerprint of the current attributes, bypassing the cache.
    pub fn compute(&self) -> String {
        let digest = self.crypto.digest(self.attributes.canonical().as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_HEX_LEN);
        format!("{FINGERPRINT_PREFIX}{hex}")
    }
}
