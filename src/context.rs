//! Client context.
//!
//! [`AttestationContext`] owns every piece of attestation state for one
//! client: device identity, the session fingerprint cache, the geolocation
//! poller and the invalidation latch. Two contexts never share state, so a
//! test or an embedding host can run several side by side.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::{SessionInvalidator, SessionStatus, SessionStore, SessionTerminated};
use crate::config::ClientConfig;
use crate::gateway::{DeviceInfo, DeviceMetadataHeaders};
use crate::geo::{provider_from_config, GeolocationAttester, LocationProvider};
use crate::security::{
    select_provider, CryptoCapability, CryptoProvider, EnvironmentAttributes,
    FingerprintGenerator, IdentityStore, SecurityEnvelope, SignatureEngine,
};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};

/// Where the context keeps durable state.
enum DurableChoice {
    /// `<data_dir>/signet_store.json`.
    File,
    Store(Arc<dyn KeyValueStore>),
    /// Server / non-interactive use: no persistent identity.
    None,
}

pub struct ContextBuilder {
    config: ClientConfig,
    durable: DurableChoice,
    location: Option<Arc<dyn LocationProvider>>,
    attributes: Option<EnvironmentAttributes>,
    device: Option<DeviceInfo>,
}

impl ContextBuilder {
    /// Use `store` for durable state instead of the data-dir file.
    pub fn durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = DurableChoice::Store(store);
        self
    }

    /// Run without durable storage. The device id becomes the server
    /// sentinel and sessions live only in memory.
    pub fn headless(mut self) -> Self {
        self.durable = DurableChoice::None;
        self
    }

    pub fn location_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(provider);
        self
    }

    pub fn environment(mut self, attributes: EnvironmentAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn device_info(mut self, device: DeviceInfo) -> Self {
        self.device = Some(device);
        self
    }

    pub fn build(self) -> Result<AttestationContext> {
        let config = self.config;
        config.validate()?;

        let durable: Option<Arc<dyn KeyValueStore>> = match self.durable {
            DurableChoice::File => {
                let dir = config.resolved_data_dir();
                let store: Arc<dyn KeyValueStore> = Arc::new(
                    FileStore::open(&dir)
                        .with_context(|| format!("Failed to open store in {}", dir.display()))?,
                );
                Some(store)
            }
            DurableChoice::Store(store) => Some(store),
            DurableChoice::None => None,
        };
        let ephemeral: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let crypto = select_provider(config.crypto_backend);
        let identity = Arc::new(IdentityStore::new(durable.clone()));
        let attributes = self
            .attributes
            .unwrap_or_else(|| EnvironmentAttributes::detect(&config.app_version));
        let fingerprint = Arc::new(FingerprintGenerator::new(
            crypto.clone(),
            ephemeral.clone(),
            attributes,
        ));
        let signer = Arc::new(SignatureEngine::new(
            crypto.clone(),
            config.signing_secret.clone(),
            identity.clone(),
            fingerprint.clone(),
        ));

        let location = self
            .location
            .unwrap_or_else(|| Arc::from(provider_from_config(&config.geolocation)));
        let geo = Arc::new(GeolocationAttester::new(
            location,
            ephemeral.clone(),
            config.geolocation.ttl(),
            config.geolocation.acquire_timeout(),
        ));

        let session_backing: Arc<dyn KeyValueStore> = match &durable {
            Some(store) => store.clone(),
            None => Arc::new(MemoryStore::new()),
        };
        let session = Arc::new(SessionStore::new(session_backing));
        let invalidator = Arc::new(SessionInvalidator::new(session.clone()));

        tracing::debug!(
            crypto = crypto.name(),
            capability = %crypto.capability(),
            durable = durable.is_some(),
            "Attestation context ready"
        );

        Ok(AttestationContext {
            device: self.device.unwrap_or_else(DeviceInfo::detect),
            config,
            crypto,
            durable: durable.is_some(),
            identity,
            fingerprint,
            signer,
            geo,
            session,
            invalidator,
        })
    }
}

pub struct AttestationContext {
    config: ClientConfig,
    crypto: Arc<dyn CryptoProvider>,
    durable: bool,
    device: DeviceInfo,
    identity: Arc<IdentityStore>,
    fingerprint: Arc<FingerprintGenerator>,
    signer: Arc<SignatureEngine>,
    geo: Arc<GeolocationAttester>,
    session: Arc<SessionStore>,
    invalidator: Arc<SessionInvalidator>,
}

impl AttestationContext {
    pub fn builder(config: ClientConfig) -> ContextBuilder {
        ContextBuilder {
            config,
            durable: DurableChoice::File,
            location: None,
            attributes: None,
            device: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn crypto_capability(&self) -> CryptoCapability {
        self.crypto.capability()
    }

    pub fn crypto_provider_name(&self) -> &str {
        self.crypto.name()
    }

    /// Whether identity and session survive restarts.
    pub fn has_durable_storage(&self) -> bool {
        self.durable
    }

    pub fn device_id(&self) -> String {
        self.identity.get_device_id()
    }

    pub async fn fingerprint(&self) -> String {
        self.fingerprint.get_fingerprint().await
    }

    pub fn signer(&self) -> &SignatureEngine {
        &self.signer
    }

    pub fn geo(&self) -> &GeolocationAttester {
        &self.geo
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn invalidator(&self) -> &SessionInvalidator {
        &self.invalidator
    }

    /// Receive session-termination events for navigation.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionTerminated> {
        self.invalidator.subscribe()
    }

    /// Begin background work (geolocation polling). Idempotent.
    pub fn start(&self) -> bool {
        self.geo.start()
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        self.geo.stop();
    }

    /// Persist a new session and re-arm the invalidation latch.
    pub fn establish_session(
        &self,
        token: &str,
        user: Option<&serde_json::Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.session
            .establish(token, user, expires_at)
            .context("Failed to persist session")?;
        self.invalidator.rearm();
        tracing::info!(expires_at = ?expires_at, "Session established");
        Ok(())
    }

    /// Local logout: clear session state without a termination signal,
    /// stop polling and forget the cached position.
    pub fn end_session(&self) {
        let report = self.session.clear();
        for error in &report.errors {
            tracing::warn!(error = %error, "Session clear incomplete");
        }
        self.geo.stop();
        self.geo.clear();
        tracing::info!(removed = report.removed, "Signed out");
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status(Utc::now())
    }

    /// Metadata headers for the next request.
    pub async fn metadata_headers(&self) -> DeviceMetadataHeaders {
        let position = self.geo.current_position();
        DeviceMetadataHeaders {
            device_id: self.identity.get_device_id(),
            fingerprint: self.fingerprint.get_fingerprint().await,
            device_name: self.device.device_name.clone(),
            device_model: self.device.device_model.clone(),
            platform: self.device.platform.clone(),
            os_name: self.device.os_name.clone(),
            os_version: self.device.os_version.clone(),
            app_version: self.config.app_version.clone(),
            latitude: position.map(|p| p.lat),
            longitude: position.map(|p| p.lng),
        }
    }

    /// Security envelope, or `None` when envelope headers are bypassed.
    pub async fn security_envelope(
        &self,
        body: Option<&crate::security::RequestBody>,
    ) -> Option<SecurityEnvelope> {
        if self.config.bypass_security_headers {
            return None;
        }
        Some(self.signer.build_security_envelope(body).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CryptoBackend;
    use crate::geo::{DeniedLocationProvider, FixedLocationProvider};
    use crate::security::SERVER_DEVICE_ID;
    use crate::storage::{ACCESS_TOKEN_KEY, DEVICE_ID_KEY};
    use serde_json::json;

    fn device() -> DeviceInfo {
        DeviceInfo {
            device_name: "test-host".into(),
            device_model: "x86_64".into(),
            platform: "desktop".into(),
            os_name: "Linux".into(),
            os_version: "6.1".into(),
        }
    }

    fn context(durable: Arc<dyn KeyValueStore>) -> AttestationContext {
        AttestationContext::builder(ClientConfig::default())
            .durable_store(durable)
            .location_provider(Arc::new(DeniedLocationProvider))
            .device_info(device())
            .build()
            .unwrap()
    }

    #[test]
    fn default_backend_is_strong() {
        let ctx = context(Arc::new(MemoryStore::new()));
        assert_eq!(ctx.crypto_capability(), CryptoCapability::Strong);
    }

    #[test]
    fn fallback_backend_reports_degraded() {
        let config = ClientConfig {
            crypto_backend: CryptoBackend::Fallback,
            allow_weak_crypto: true,
            ..ClientConfig::default()
        };
        let ctx = AttestationContext::builder(config)
            .durable_store(Arc::new(MemoryStore::new()))
            .location_provider(Arc::new(DeniedLocationProvider))
            .build()
            .unwrap();
        assert!(ctx.crypto_capability().is_degraded());
    }

    #[test]
    fn fallback_without_opt_in_is_rejected() {
        let config = ClientConfig {
            crypto_backend: CryptoBackend::Fallback,
            ..ClientConfig::default()
        };
        assert!(AttestationContext::builder(config)
            .durable_store(Arc::new(MemoryStore::new()))
            .build()
            .is_err());
    }

    #[test]
    fn headless_uses_sentinel_device_id() {
        let ctx = AttestationContext::builder(ClientConfig::default())
            .headless()
            .location_provider(Arc::new(DeniedLocationProvider))
            .build()
            .unwrap();
        assert!(!ctx.has_durable_storage());
        assert_eq!(ctx.device_id(), SERVER_DEVICE_ID);
    }

    #[test]
    fn file_backed_identity_survives_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            ..ClientConfig::default()
        };
        let first = AttestationContext::builder(config.clone())
            .location_provider(Arc::new(DeniedLocationProvider))
            .build()
            .unwrap()
            .device_id();
        let second = AttestationContext::builder(config)
            .location_provider(Arc::new(DeniedLocationProvider))
            .build()
            .unwrap()
            .device_id();
        assert_eq!(first, second);
        assert_ne!(first, SERVER_DEVICE_ID);
    }

    #[test]
    fn contexts_do_not_share_state() {
        let a = context(Arc::new(MemoryStore::new()));
        let b = context(Arc::new(MemoryStore::new()));
        assert_ne!(a.device_id(), b.device_id());

        a.establish_session("tok", None, None).unwrap();
        a.invalidator().invalidate("unauthorized");
        assert!(a.invalidator().is_invalidated());
        assert!(!b.invalidator().is_invalidated());
    }

    #[test]
    fn establish_session_rearms_latch() {
        let ctx = context(Arc::new(MemoryStore::new()));
        ctx.establish_session("tok-1", None, None).unwrap();
        assert!(ctx.invalidator().invalidate("unauthorized"));

        ctx.establish_session("tok-2", Some(&json!({"id": 1})), None)
            .unwrap();
        assert!(!ctx.invalidator().is_invalidated());
        assert_eq!(ctx.session().access_token().as_deref(), Some("tok-2"));
    }

    #[tokio::test]
    async fn end_session_clears_without_signal() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ctx = context(durable.clone());
        let mut rx = ctx.subscribe();
        let device_id = ctx.device_id();
        ctx.establish_session("tok", None, None).unwrap();

        ctx.end_session();
        assert_eq!(durable.get(ACCESS_TOKEN_KEY).unwrap(), None);
        assert_eq!(durable.get(DEVICE_ID_KEY).unwrap(), Some(device_id));
        assert!(rx.try_recv().is_err());
        assert!(!ctx.session_status().authenticated);
    }

    #[tokio::test]
    async fn metadata_carries_fresh_position_only() {
        let ctx = AttestationContext::builder(ClientConfig::default())
            .durable_store(Arc::new(MemoryStore::new()))
            .location_provider(Arc::new(FixedLocationProvider::new(37.5665, 126.978)))
            .device_info(device())
            .build()
            .unwrap();

        let before = ctx.metadata_headers().await;
        assert_eq!(before.latitude, None);

        ctx.geo().refresh_now().await.unwrap();
        let after = ctx.metadata_headers().await;
        assert_eq!(after.latitude, Some(37.5665));
        assert_eq!(after.longitude, Some(126.978));
        assert_eq!(after.device_name, "test-host");
        assert_eq!(after.device_id, ctx.device_id());
        assert!(after.fingerprint.starts_with("fp-"));
    }

    #[tokio::test]
    async fn bypass_skips_envelope() {
        let config = ClientConfig {
            bypass_security_headers: true,
            ..ClientConfig::default()
        };
        let ctx = AttestationContext::builder(config)
            .durable_store(Arc::new(MemoryStore::new()))
            .location_provider(Arc::new(DeniedLocationProvider))
            .build()
            .unwrap();
        assert!(ctx.security_envelope(None).await.is_none());
    }

    #[tokio::test]
    async fn start_and_shutdown_drive_geo_polling() {
        let ctx = context(Arc::new(MemoryStore::new()));
        assert!(ctx.start());
        assert!(ctx.geo().is_initialized());
        ctx.shutdown();
        assert!(!ctx.geo().is_initialized());
    }
}
