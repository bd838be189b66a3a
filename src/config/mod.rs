//! Client configuration.
//!
//! Loaded from a TOML file (explicit `--config` path, or `config.toml` in the
//! platform config directory) and then overridden by `SIGNET_*` environment
//! variables. Every field has a default so an empty file is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default API version prefix appended to the base URL.
const DEFAULT_API_PREFIX: &str = "/api/v1";

/// Default overall request timeout: 30 seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default geolocation cache TTL: 5 minutes.
const DEFAULT_GEO_TTL_SECS: u64 = 300;

/// Default upper bound on a single location acquisition.
const DEFAULT_GEO_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Which crypto implementation backs digests, HMACs and random bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoBackend {
    /// Pick the strongest backend available in this build.
    #[default]
    Auto,
    /// Pure-Rust `hmac` + `sha2`.
    RustCrypto,
    /// `ring`.
    Ring,
    /// Non-cryptographic keyed hash. Requires `allow_weak_crypto = true`.
    Fallback,
}

impl std::str::FromStr for CryptoBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "rustcrypto" => Ok(Self::RustCrypto),
            "ring" => Ok(Self::Ring),
            "fallback" => Ok(Self::Fallback),
            other => bail!(
                "Unknown crypto backend '{other}'. Supported values: auto, rustcrypto, ring, fallback"
            ),
        }
    }
}

/// Fixed coordinates used instead of a live location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedPosition {
    pub lat: f64,
    pub lng: f64,
}

/// Geolocation attestation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// When false, every acquisition reports permission denied.
    pub enabled: bool,
    /// Cache validity window and polling interval, in seconds.
    pub ttl_secs: u64,
    /// Upper bound on a single acquisition, in seconds.
    pub acquire_timeout_secs: u64,
    /// Static position (takes precedence over `lookup_url`).
    pub fixed_position: Option<FixedPosition>,
    /// HTTP endpoint returning `{"lat": .., "lng": ..}` for this host.
    pub lookup_url: Option<String>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: DEFAULT_GEO_TTL_SECS,
            acquire_timeout_secs: DEFAULT_GEO_ACQUIRE_TIMEOUT_SECS,
            fixed_position: None,
            lookup_url: None,
        }
    }
}

impl GeoConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend origin, e.g. `https://api.example.com`.
    pub base_url: String,
    /// API version path prefix, e.g. `/api/v1`.
    pub api_prefix: String,
    /// Overall per-request timeout, in seconds.
    pub request_timeout_secs: u64,
    /// Shared HMAC secret for request signing.
    pub signing_secret: String,
    /// Development escape hatch: skip the security envelope headers.
    pub bypass_security_headers: bool,
    /// Reported in `x-app-version`.
    pub app_version: String,
    pub crypto_backend: CryptoBackend,
    /// Permit the non-cryptographic fallback backend.
    pub allow_weak_crypto: bool,
    /// Directory for the durable store. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    pub geolocation: GeoConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            signing_secret: String::new(),
            bypass_security_headers: false,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            crypto_backend: CryptoBackend::Auto,
            allow_weak_crypto: false,
            data_dir: None,
            geolocation: GeoConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `path` (or the default location if it
    /// exists), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `SIGNET_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("SIGNET_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = lookup("SIGNET_API_PREFIX") {
            self.api_prefix = v;
        }
        if let Some(v) = lookup("SIGNET_SIGNING_SECRET") {
            self.signing_secret = v;
        }
        if let Some(v) = lookup("SIGNET_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = v
                .trim()
                .parse()
                .with_context(|| format!("SIGNET_REQUEST_TIMEOUT_SECS is not a number: {v}"))?;
        }
        if let Some(v) = lookup("SIGNET_BYPASS_SECURITY_HEADERS") {
            self.bypass_security_headers = parse_bool(&v);
        }
        if let Some(v) = lookup("SIGNET_APP_VERSION") {
            self.app_version = v;
        }
        if let Some(v) = lookup("SIGNET_CRYPTO_BACKEND") {
            self.crypto_backend = v.parse()?;
        }
        if let Some(v) = lookup("SIGNET_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            bail!("base_url cannot be empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than zero");
        }
        if self.geolocation.ttl_secs == 0 {
            bail!("geolocation.ttl_secs must be greater than zero");
        }
        if self.crypto_backend == CryptoBackend::Fallback && !self.allow_weak_crypto {
            bail!(
                "crypto_backend = 'fallback' produces unkeyed-strength signatures; \
                 set allow_weak_crypto = true to use it"
            );
        }
        if self.signing_secret.is_empty() && !self.bypass_security_headers {
            tracing::warn!("signing_secret is empty; request signatures will use an empty key");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL joined with the API prefix, without a trailing slash.
    pub fn api_root(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let prefix = self.api_prefix.trim_matches('/');
        if prefix.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{prefix}")
        }
    }

    /// Directory holding the durable store file.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| project_dirs().map(|d| d.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from(".signet"))
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "signet", "signet")
}

/// `config.toml` inside the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let cfg = ClientConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.geolocation.ttl(), Duration::from_secs(300));
        assert!(!cfg.bypass_security_headers);
    }

    #[test]
    fn parses_toml_with_partial_fields() {
        let cfg = ClientConfig::from_toml(
            r#"
            base_url = "https://api.bank.test/"
            signing_secret = "s3cret"
            crypto_backend = "ring"

            [geolocation]
            ttl_secs = 60
            fixed_position = { lat = 37.5, lng = 127.0 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.crypto_backend, CryptoBackend::Ring);
        assert_eq!(cfg.geolocation.ttl_secs, 60);
        assert_eq!(cfg.geolocation.acquire_timeout_secs, 10);
        assert_eq!(
            cfg.geolocation.fixed_position,
            Some(FixedPosition { lat: 37.5, lng: 127.0 })
        );
        assert_eq!(cfg.api_root(), "https://api.bank.test/api/v1");
    }

    #[test]
    fn api_root_handles_empty_prefix() {
        let cfg = ClientConfig {
            base_url: "https://api.bank.test".into(),
            api_prefix: String::new(),
            ..ClientConfig::default()
        };
        assert_eq!(cfg.api_root(), "https://api.bank.test");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("SIGNET_BASE_URL", "https://override.test"),
            ("SIGNET_REQUEST_TIMEOUT_SECS", "5"),
            ("SIGNET_BYPASS_SECURITY_HEADERS", "true"),
            ("SIGNET_CRYPTO_BACKEND", "rustcrypto"),
        ]
        .into_iter()
        .collect();
        let mut cfg = ClientConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.base_url, "https://override.test");
        assert_eq!(cfg.request_timeout_secs, 5);
        assert!(cfg.bypass_security_headers);
        assert_eq!(cfg.crypto_backend, CryptoBackend::RustCrypto);
    }

    #[test]
    fn bad_timeout_override_errors() {
        let mut cfg = ClientConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "SIGNET_REQUEST_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn fallback_backend_requires_opt_in() {
        let mut cfg = ClientConfig {
            crypto_backend: CryptoBackend::Fallback,
            ..ClientConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.allow_weak_crypto = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = ClientConfig {
            request_timeout_secs: 0,
            ..ClientConfig::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("request_timeout_secs"));
    }

    #[test]
    fn unknown_backend_errors() {
        let err = "quantum".parse::<CryptoBackend>().unwrap_err();
        assert!(err.to_string().contains("Unknown crypto backend"));
    }

    #[test]
    fn load_reads_explicit_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "base_url = \"https://file.test\"\n").unwrap();
        let cfg = ClientConfig::from_file(&path).unwrap();
        assert_eq!(cfg.base_url, "https://file.test");
    }
}
