//! Request signing and the per-request security envelope.
//!
//! Each outgoing request gets a one-shot [`SecurityEnvelope`]:
//!
//! | header          | value                                         |
//! |-----------------|-----------------------------------------------|
//! | `x-timestamp`   | epoch milliseconds                            |
//! | `x-nonce`       | UUID-v4-shaped random token                   |
//! | `x-signature`   | hex HMAC-SHA256(secret, canonical body) or "" |
//! | `x-request-id`  | `req-<ms>-<base36>` correlation id            |
//! | `x-device-id`   | installation id                               |
//! | `x-device-fingerprint` | session fingerprint                    |
//!
//! Bodies are canonicalized before signing: text as-is, JSON with object
//! keys sorted recursively and no insignificant whitespace. The pipeline
//! sends exactly the canonical string it signed.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

use super::crypto::CryptoProvider;
use super::fingerprint::FingerprintGenerator;
use super::identity::IdentityStore;

/// Random suffix length of a request id.
const REQUEST_ID_SUFFIX_LEN: usize = 9;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A request body as signed and sent.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Text(String),
    Json(serde_json::Value),
}

impl RequestBody {
    /// Serialize any value into a JSON body.
    pub fn json<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Parse `raw` as JSON, falling back to a text body.
    pub fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).map_or_else(|_| Self::Text(raw.to_string()), Self::Json)
    }

    /// The exact string that is signed and transmitted.
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => {
                let mut out = String::new();
                write_canonical_json(v, &mut out);
                out
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text/plain; charset=utf-8",
            Self::Json(_) => "application/json",
        }
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

fn write_canonical_json(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Per-request security metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEnvelope {
    pub timestamp: String,
    pub nonce: String,
    /// Empty when the request has no body.
    pub signature: String,
    pub request_id: String,
    pub device_id: String,
    pub fingerprint: String,
}

impl SecurityEnvelope {
    /// Header name/value pairs for this envelope.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-timestamp", self.timestamp.clone()),
            ("x-nonce", self.nonce.clone()),
            ("x-signature", self.signature.clone()),
            ("x-request-id", self.request_id.clone()),
            ("x-device-id", self.device_id.clone()),
            ("x-device-fingerprint", self.fingerprint.clone()),
        ]
    }
}

pub struct SignatureEngine {
    crypto: Arc<dyn CryptoProvider>,
    secret: String,
    identity: Arc<IdentityStore>,
    fingerprint: Arc<FingerprintGenerator>,
}

impl SignatureEngine {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        secret: String,
        identity: Arc<IdentityStore>,
        fingerprint: Arc<FingerprintGenerator>,
    ) -> Self {
        Self {
            crypto,
            secret,
            identity,
            fingerprint,
        }
    }

    /// Fresh UUID-v4-shaped nonce.
    pub fn generate_nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        self.crypto.fill_random(&mut bytes);
        uuid::Builder::from_random_bytes(bytes)
            .into_uuid()
            .to_string()
    }

    /// Correlation id: `req-<epoch_ms>-<9 base36 chars>`.
    pub fn generate_request_id(&self) -> String {
        let mut bytes = [0u8; REQUEST_ID_SUFFIX_LEN];
        self.crypto.fill_random(&mut bytes);
        let suffix: String = bytes
            .iter()
            .map(|b| BASE36[usize::from(*b) % BASE36.len()] as char)
            .collect();
        format!("req-{}-{suffix}", now_millis())
    }

    /// Lowercase hex HMAC-SHA256 of the canonical body under `secret`.
    pub fn generate_signature(&self, body: &RequestBody, secret: &str) -> String {
        hex::encode(
            self.crypto
                .hmac(secret.as_bytes(), body.canonical().as_bytes()),
        )
    }

    /// Signature under the configured secret.
    pub fn sign(&self, body: &RequestBody) -> String {
        self.generate_signature(body, &self.secret)
    }

    /// Assemble the envelope for one outgoing request.
    pub async fn build_security_envelope(&self, body: Option<&RequestBody>) -> SecurityEnvelope {
        SecurityEnvelope {
            timestamp: now_millis().to_string(),
            nonce: self.generate_nonce(),
            signature: body.map(|b| self.sign(b)).unwrap_or_default(),
            request_id: self.generate_request_id(),
            device_id: self.identity.get_device_id(),
            fingerprint: self.fingerprint.get_fingerprint().await,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
