//! Client-side session lifecycle.
//!
//! Provides:
//! - Durable session record (token, cached user, activity, expiry, cookie)
//! - Exactly-once session invalidation with a termination broadcast
//! - Sign-in / sign-out flows over the request pipeline
//!
//! ## Design Decisions
//! - Sign-in accepts the token under `token`, `accessToken` or
//!   `access_token`, at the top level or inside `data`, since backends
//!   disagree on the envelope.
//! - Sign-out is local-first: a failed logout call never keeps the user
//!   signed in, and it never raises a termination event.

pub mod invalidator;
pub mod session;

pub use invalidator::{SessionInvalidator, SessionTerminated, REASON_UNAUTHORIZED};
pub use session::{AuthCookie, ClearReport, SessionStatus, SessionStore};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::gateway::{ApiError, ApiRequest, RequestPipeline};

pub const LOGIN_PATH: &str = "/auth/login";
pub const LOGOUT_PATH: &str = "/auth/logout";

const TOKEN_FIELDS: [&str; 3] = ["token", "accessToken", "access_token"];

/// Username / password pair posted to the login endpoint.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A successful sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedIn {
    pub user: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SignInError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("sign-in response did not include an access token")]
    MissingToken,
    #[error("failed to persist session: {0}")]
    Persist(String),
}

/// Authenticate and establish a session.
pub async fn sign_in(
    pipeline: &RequestPipeline,
    credentials: &Credentials,
) -> Result<SignedIn, SignInError> {
    let body = serde_json::to_value(credentials).map_err(|e| ApiError::Decode {
        status: 0,
        message: e.to_string(),
    })?;
    let response = pipeline.send(ApiRequest::post(LOGIN_PATH, body)).await?;

    let token = extract_token(&response.body).ok_or(SignInError::MissingToken)?;
    let user = extract_user(&response.body);
    let expires_at = extract_expiry(&response.body, Utc::now());

    let ctx = pipeline.context();
    ctx.establish_session(&token, user.as_ref(), expires_at)
        .map_err(|e| SignInError::Persist(format!("{e:#}")))?;
    ctx.start();

    tracing::info!(username = %credentials.username, "Signed in");
    Ok(SignedIn { user, expires_at })
}

/// End the session. The server call is best-effort; local state is always
/// cleared and geolocation polling stops.
pub async fn sign_out(pipeline: &RequestPipeline) {
    let ctx = pipeline.context();
    if ctx.session().access_token().is_some() {
        let request =
            ApiRequest::post(LOGOUT_PATH, Value::Object(serde_json::Map::new()))
                .without_session_invalidation();
        if let Err(e) = pipeline.send(request).await {
            tracing::warn!(error = %e, "Logout request failed; clearing local session anyway");
        }
    }
    ctx.end_session();
}

fn candidates(body: &Value) -> impl Iterator<Item = &Value> {
    [Some(body), body.get("data")].into_iter().flatten()
}

fn extract_token(body: &Value) -> Option<String> {
    candidates(body).find_map(|obj| {
        TOKEN_FIELDS.iter().find_map(|field| {
            obj.get(*field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
    })
}

fn extract_user(body: &Value) -> Option<Value> {
    candidates(body)
        .find_map(|obj| obj.get("user"))
        .filter(|u| u.is_object())
        .cloned()
}

/// `expiresIn` (seconds from now) or `expiresAt` (RFC 3339 or epoch ms).
fn extract_expiry(body: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    candidates(body).find_map(|obj| {
        if let Some(secs) = obj.get("expiresIn").and_then(Value::as_i64) {
            return chrono::Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
        }
        match obj.get("expiresAt")? {
            Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    })
}
