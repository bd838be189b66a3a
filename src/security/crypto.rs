//! Crypto capability providers.
//!
//! Every digest, HMAC and random byte used by the attestation layer goes
//! through a [`CryptoProvider`] chosen once when the context is built:
//! - [`RustCryptoProvider`]: `hmac` + `sha2`, randomness from `rand`
//! - [`RingProvider`]: `ring`, randomness from the OS via `SystemRandom`
//! - [`DegradedProvider`]: non-cryptographic hashes, for builds or hosts
//!   where neither of the above may be used. Signatures it produces are
//!   plain keyed hashes, not MACs.
//!
//! The two strong providers produce byte-identical digests and HMACs.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::CryptoBackend;

type HmacSha256 = Hmac<Sha256>;

/// Strength of the active crypto provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoCapability {
    /// Real SHA-256 / HMAC-SHA256 and a CSPRNG.
    Strong,
    /// Fallback hashes and a time-seeded PRNG.
    Degraded,
}

impl CryptoCapability {
    pub fn is_degraded(self) -> bool {
        self == Self::Degraded
    }
}

impl std::fmt::Display for CryptoCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Strong => "strong",
            Self::Degraded => "degraded",
        })
    }
}

/// Digest / HMAC / randomness capability.
pub trait CryptoProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn capability(&self) -> CryptoCapability;

    fn digest(&self, data: &[u8]) -> Vec<u8>;

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;

    fn fill_random(&self, buf: &mut [u8]);
}

/// Build the provider for a configured backend.
pub fn select_provider(backend: CryptoBackend) -> Arc<dyn CryptoProvider> {
    let provider: Arc<dyn CryptoProvider> = match backend {
        CryptoBackend::Auto | CryptoBackend::RustCrypto => Arc::new(RustCryptoProvider),
        CryptoBackend::Ring => Arc::new(RingProvider::new()),
        CryptoBackend::Fallback => Arc::new(DegradedProvider::new()),
    };

    if provider.capability().is_degraded() {
        tracing::warn!(
            provider = provider.name(),
            "Using degraded crypto provider; request signatures are not MACs"
        );
    } else {
        tracing::debug!(provider = provider.name(), "Crypto provider selected");
    }
    provider
}

// ── RustCrypto ───────────────────────────────────────────────────

pub struct RustCryptoProvider;

impl CryptoProvider for RustCryptoProvider {
    fn name(&self) -> &'static str {
        "rustcrypto"
    }

    fn capability(&self) -> CryptoCapability {
        CryptoCapability::Strong
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can accept any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        use rand::RngExt;
        rand::rng().fill(buf);
    }
}

// ── ring ─────────────────────────────────────────────────────────

pub struct RingProvider {
    rng: ring::rand::SystemRandom,
    fallback: WeakRandom,
}

impl RingProvider {
    pub fn new() -> Self {
        Self {
            rng: ring::rand::SystemRandom::new(),
            fallback: WeakRandom::seeded(),
        }
    }
}

impl Default for RingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for RingProvider {
    fn name(&self) -> &'static str {
        "ring"
    }

    fn capability(&self) -> CryptoCapability {
        CryptoCapability::Strong
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        ring::digest::digest(&ring::digest::SHA256, data)
            .as_ref()
            .to_vec()
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key);
        ring::hmac::sign(&key, data).as_ref().to_vec()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        use ring::rand::SecureRandom;
        if self.rng.fill(buf).is_err() {
            tracing::warn!("OS random source failed; using time-seeded fallback for this value");
            self.fallback.fill(buf);
        }
    }
}

// ── Degraded ─────────────────────────────────────────────────────

/// Non-cryptographic provider. Deterministic hashes, predictable randomness.
pub struct DegradedProvider {
    rng: WeakRandom,
}

impl DegradedProvider {
    pub fn new() -> Self {
        Self {
            rng: WeakRandom::seeded(),
        }
    }
}

impl Default for DegradedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoProvider for DegradedProvider {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn capability(&self) -> CryptoCapability {
        CryptoCapability::Degraded
    }

    /// 32-bit multiplicative string hash (`h * 31 + byte`).
    fn digest(&self, data: &[u8]) -> Vec<u8> {
        let hash = data
            .iter()
            .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
        hash.to_be_bytes().to_vec()
    }

    /// FNV-1a over `key || 0x00 || data`. Not a MAC.
    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut hash = fnv1a(FNV_OFFSET, key);
        hash = fnv1a(hash, &[0]);
        hash = fnv1a(hash, data);
        hash.to_be_bytes().to_vec()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.rng.fill(buf);
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// xorshift64* seeded from the clock. Unique per call, not unpredictable.
struct WeakRandom {
    state: Mutex<u64>,
}

impl WeakRandom {
    fn seeded() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seed = nanos ^ (u64::from(std::process::id()) << 32) ^ 0x9e37_79b9_7f4a_7c15;
        Self {
            state: Mutex::new(if seed == 0 { 0x2545_f491_4f6c_dd1d } else { seed }),
        }
    }

    fn next(&self) -> u64 {
        let mut state = self.state.lock();
        let mut x = *state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        *state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn fill(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}
