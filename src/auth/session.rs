//! Durable session record.
//!
//! Keys (durable store):
//! - `access_token`: bearer token
//! - `user`: cached user record (JSON)
//! - `last_activity`, `token_expiry`: epoch milliseconds
//! - `auth_cookie`: cookie mirroring the token, with its own expiry
//! - `client_state`: persisted client-state snapshot

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{
    KeyValueStore, ACCESS_TOKEN_KEY, AUTH_COOKIE_KEY, CACHED_USER_KEY, CLIENT_STATE_KEY,
    LAST_ACTIVITY_KEY, SESSION_KEYS, TOKEN_EXPIRY_KEY,
};

/// Cookie lifetime when the server gives no expiry: 7 days.
const DEFAULT_COOKIE_TTL_SECS: i64 = 7 * 24 * 3600;

/// Authentication cookie mirroring the bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookie {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthCookie {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Snapshot of the local session for status views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub token_expired: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Outcome of clearing session state.
#[derive(Debug, Clone, Default)]
pub struct ClearReport {
    /// Keys that were present and removed.
    pub removed: usize,
    /// Non-fatal storage errors.
    pub errors: Vec<String>,
}

impl ClearReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct SessionStore {
    durable: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self { durable }
    }

    /// Persist a freshly issued session.
    pub fn establish(
        &self,
        token: &str,
        user: Option<&serde_json::Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        self.durable.set(ACCESS_TOKEN_KEY, token)?;
        match user {
            Some(user) => self.durable.set(CACHED_USER_KEY, &user.to_string())?,
            None => {
                self.durable.remove(CACHED_USER_KEY)?;
            }
        }
        self.durable
            .set(LAST_ACTIVITY_KEY, &now.timestamp_millis().to_string())?;
        match expires_at {
            Some(exp) => self
                .durable
                .set(TOKEN_EXPIRY_KEY, &exp.timestamp_millis().to_string())?,
            None => {
                self.durable.remove(TOKEN_EXPIRY_KEY)?;
            }
        }

        let cookie = AuthCookie {
            value: token.to_string(),
            expires_at: expires_at
                .unwrap_or_else(|| now + chrono::Duration::seconds(DEFAULT_COOKIE_TTL_SECS)),
        };
        self.durable
            .set(AUTH_COOKIE_KEY, &serde_json::to_string(&cookie)?)?;
        Ok(())
    }

    /// Bearer token, if a session exists.
    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY).filter(|t| !t.is_empty())
    }

    pub fn cached_user(&self) -> Option<serde_json::Value> {
        self.read(CACHED_USER_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.read_millis(LAST_ACTIVITY_KEY)
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.read_millis(TOKEN_EXPIRY_KEY)
    }

    pub fn auth_cookie(&self) -> Option<AuthCookie> {
        self.read(AUTH_COOKIE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    /// Record activity on the current session. No-op without a session.
    pub fn touch(&self) {
        if self.access_token().is_none() {
            return;
        }
        let now = Utc::now().timestamp_millis().to_string();
        if let Err(e) = self.durable.set(LAST_ACTIVITY_KEY, &now) {
            tracing::debug!(error = %e, "Failed to record session activity");
        }
    }

    pub fn save_client_state(&self, state: &serde_json::Value) -> Result<()> {
        self.durable.set(CLIENT_STATE_KEY, &state.to_string())
    }

    pub fn client_state(&self) -> Option<serde_json::Value> {
        self.read(CLIENT_STATE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    pub fn status(&self, now: DateTime<Utc>) -> SessionStatus {
        let token_expiry = self.token_expiry();
        SessionStatus {
            authenticated: self.access_token().is_some(),
            token_expired: token_expiry.is_some_and(|exp| exp <= now),
            last_activity: self.last_activity(),
            token_expiry,
        }
    }

    /// Remove every session key, expire the cookie and drop the client-state
    /// snapshot. Keeps going past individual failures.
    pub fn clear(&self) -> ClearReport {
        let mut report = ClearReport::default();

        for key in SESSION_KEYS.iter().copied().chain([CLIENT_STATE_KEY]) {
            match self.durable.remove(key) {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(format!("Failed to remove {key}: {e}")),
            }
        }

        let expired = AuthCookie {
            value: String::new(),
            expires_at: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
        };
        let cookie_result = serde_json::to_string(&expired)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.durable.set(AUTH_COOKIE_KEY, &raw));
        if let Err(e) = cookie_result {
            report.errors.push(format!("Failed to expire auth cookie: {e}"));
        }

        report
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.durable.get(key) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(key, error = %e, "Session key unreadable");
                None
            }
        }
    }

    fn read_millis(&self, key: &str) -> Option<DateTime<Utc>> {
        self.read(key)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, DEVICE_ID_KEY};
    use serde_json::json;

    fn store() -> (Arc<dyn KeyValueStore>, SessionStore) {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (durable.clone(), SessionStore::new(durable))
    }

    #[test]
    fn establish_writes_all_keys() {
        let (durable, session) = store();
        let exp = Utc::now() + chrono::Duration::hours(1);
        session
            .establish("tok-1", Some(&json!({"id": 7, "name": "Kim"})), Some(exp))
            .unwrap();

        assert_eq!(session.access_token().as_deref(), Some("tok-1"));
        assert_eq!(session.cached_user().unwrap()["id"], 7);
        assert!(session.last_activity().is_some());
        assert_eq!(
            session.token_expiry().unwrap().timestamp_millis(),
            exp.timestamp_millis()
        );
        let cookie = session.auth_cookie().unwrap();
        assert_eq!(cookie.value, "tok-1");
        assert!(!cookie.is_expired_at(Utc::now()));
        assert!(durable.get(AUTH_COOKIE_KEY).unwrap().is_some());
    }

    #[test]
    fn cookie_defaults_to_a_week() {
        let (_, session) = store();
        session.establish("tok", None, None).unwrap();
        let cookie = session.auth_cookie().unwrap();
        assert!(cookie.expires_at > Utc::now() + chrono::Duration::days(6));
        assert!(session.token_expiry().is_none());
    }

    #[test]
    fn clear_removes_session_but_keeps_device_id() {
        let (durable, session) = store();
        durable.set(DEVICE_ID_KEY, "dev-1").unwrap();
        session.establish("tok", Some(&json!({"id": 1})), None).unwrap();
        session.save_client_state(&json!({"cart": []})).unwrap();

        let report = session.clear();
        assert!(report.success());
        assert_eq!(report.removed, 4);

        for key in SESSION_KEYS {
            assert_eq!(durable.get(key).unwrap(), None, "{key} survived");
        }
        assert!(session.client_state().is_none());
        assert_eq!(durable.get(DEVICE_ID_KEY).unwrap().as_deref(), Some("dev-1"));

        let cookie = session.auth_cookie().unwrap();
        assert!(cookie.value.is_empty());
        assert!(cookie.is_expired_at(Utc::now()));
    }

    #[test]
    fn clear_is_idempotent() {
        let (_, session) = store();
        session.establish("tok", None, None).unwrap();
        session.clear();
        let second = session.clear();
        assert!(second.success());
        assert_eq!(second.removed, 0);
        assert!(session.access_token().is_none());
    }

    #[test]
    fn touch_without_session_is_noop() {
        let (durable, session) = store();
        session.touch();
        assert_eq!(durable.get(LAST_ACTIVITY_KEY).unwrap(), None);
    }

    #[test]
    fn status_reports_expiry() {
        let (_, session) = store();
        assert!(!session.status(Utc::now()).authenticated);

        let exp = Utc::now() + chrono::Duration::minutes(5);
        session.establish("tok", None, Some(exp)).unwrap();
        let now = Utc::now();
        let status = session.status(now);
        assert!(status.authenticated);
        assert!(!status.token_expired);
        assert!(session.status(exp + chrono::Duration::seconds(1)).token_expired);
    }

    #[test]
    fn empty_token_is_no_session() {
        let (durable, session) = store();
        durable.set(ACCESS_TOKEN_KEY, "").unwrap();
        assert!(session.access_token().is_none());
    }
}
