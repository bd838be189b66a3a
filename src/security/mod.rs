//! Device attestation primitives.
//!
//! Provides:
//! - Crypto capability selection (RustCrypto, ring, or a degraded fallback)
//! - Installation-scoped device identity
//! - Session-scoped environment fingerprint
//! - Nonce / request-id generation and HMAC-SHA256 body signing
//!
//! ## Design Decisions
//! - All hashing goes through one [`CryptoProvider`] picked at context
//!   construction, so the weak path is observable instead of silent.
//! - The signing secret is shared with the backend; this module only
//!   produces signatures, it never verifies them.

pub mod crypto;
pub mod fingerprint;
pub mod identity;
pub mod signing;

pub use crypto::{select_provider, CryptoCapability, CryptoProvider};
pub use fingerprint::{EnvironmentAttributes, FingerprintGenerator};
pub use identity::{IdentityStore, SERVER_DEVICE_ID};
pub use signing::{RequestBody, SecurityEnvelope, SignatureEngine};
