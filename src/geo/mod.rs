//! Best-effort geolocation attestation.
//!
//! A [`GeolocationAttester`] keeps one recent position in a TTL cache and
//! refreshes it from a [`LocationProvider`]:
//! - once immediately on `start()`
//! - every TTL interval while running
//! - immediately when the host reports a return to the foreground
//!
//! Acquisition failures are swallowed. The cache keeps whatever it had, and
//! a stale entry simply stops producing `x-latitude` / `x-longitude`.

pub mod cache;
pub mod provider;

pub use cache::{GeoCache, GeoPosition};
pub use provider::{
    provider_from_config, Coordinates, DeniedLocationProvider, FixedLocationProvider,
    HttpLocationProvider, LocationError, LocationProvider,
};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::storage::KeyValueStore;

/// Handles for the running poll task.
struct Poller {
    cancel: CancellationToken,
    foreground: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct GeolocationAttester {
    provider: Arc<dyn LocationProvider>,
    cache: Arc<GeoCache>,
    acquire_timeout: Duration,
    initialized: AtomicBool,
    poller: Mutex<Option<Poller>>,
}

impl GeolocationAttester {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        ephemeral: Arc<dyn KeyValueStore>,
        ttl: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cache: Arc::new(GeoCache::new(ttl, ephemeral)),
            acquire_timeout,
            initialized: AtomicBool::new(false),
            poller: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn ttl(&self) -> Duration {
        self.cache.ttl()
    }

    /// Start background polling. Returns `false` if already running or if
    /// called outside a tokio runtime.
    pub fn start(&self) -> bool {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return false;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Geolocation polling needs a tokio runtime; not started");
            self.initialized.store(false, Ordering::SeqCst);
            return false;
        };

        if self.cache.load_persisted(chrono::Utc::now()) {
            tracing::debug!("Restored cached geo position");
        }

        let cancel = CancellationToken::new();
        let foreground = Arc::new(Notify::new());
        let handle = runtime.spawn(poll_loop(
            self.provider.clone(),
            self.cache.clone(),
            self.cache.ttl(),
            self.acquire_timeout,
            cancel.clone(),
            foreground.clone(),
        ));

        *self.poller.lock() = Some(Poller {
            cancel,
            foreground,
            handle,
        });
        tracing::debug!(provider = self.provider.name(), "Geolocation polling started");
        true
    }

    /// Stop polling. The cache is kept; `start()` may be called again.
    pub fn stop(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.cancel.cancel();
            poller.handle.abort();
            tracing::debug!("Geolocation polling stopped");
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Re-acquire now because the host returned to the foreground.
    pub fn notify_foreground(&self) {
        if let Some(poller) = self.poller.lock().as_ref() {
            poller.foreground.notify_one();
        }
    }

    /// Acquire once, outside the poll loop.
    pub async fn refresh_now(&self) -> Option<GeoPosition> {
        acquire_once(self.provider.as_ref(), &self.cache, self.acquire_timeout)
            .await
            .ok()
    }

    /// The cached position, only if still within TTL.
    pub fn current_position(&self) -> Option<GeoPosition> {
        self.cache.fresh_at(chrono::Utc::now())
    }

    /// Forget the cached position (logout).
    pub fn clear(&self) {
        self.cache.clear();
    }

    #[cfg(test)]
    fn cache(&self) -> &GeoCache {
        &self.cache
    }
}

impl Drop for GeolocationAttester {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.cancel.cancel();
            poller.handle.abort();
        }
    }
}

async fn poll_loop(
    provider: Arc<dyn LocationProvider>,
    cache: Arc<GeoCache>,
    ttl: Duration,
    acquire_timeout: Duration,
    cancel: CancellationToken,
    foreground: Arc<Notify>,
) {
    // First tick fires immediately.
    let mut interval = tokio::time::interval(ttl);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
            () = foreground.notified() => {
                tracing::debug!("Foreground return; refreshing position");
                interval.reset();
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = acquire_once(provider.as_ref(), &cache, acquire_timeout) => {}
        }
    }
}

async fn acquire_once(
    provider: &dyn LocationProvider,
    cache: &GeoCache,
    acquire_timeout: Duration,
) -> Result<GeoPosition, LocationError> {
    let result = match tokio::time::timeout(acquire_timeout, provider.current_position()).await {
        Ok(result) => result,
        Err(_) => Err(LocationError::Timeout),
    };

    match result {
        Ok(coords) => {
            let position = GeoPosition::new(coords.lat, coords.lng, chrono::Utc::now());
            cache.store(position);
            Ok(position)
        }
        Err(e) => {
            tracing::debug!(provider = provider.name(), error = %e, "Location acquisition failed");
            Err(e)
        }
    }
}
