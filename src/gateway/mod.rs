//! Request pipeline.
//!
//! Every outbound call goes through [`RequestPipeline::send`]:
//!
//! 1. device metadata headers
//! 2. security envelope headers, unless `bypass_security_headers` is set
//! 3. `Authorization: Bearer <token>` when a session exists
//!
//! Responses are classified into [`ApiError`]. A 401 on a session-bearing
//! path hands off to the [`SessionInvalidator`](crate::auth::SessionInvalidator)
//! before the error is returned; a 401 on a session-less path (sign-in,
//! registration, password reset) is returned untouched.
//!
//! ## Design
//! - One overall timeout per request. No retry, no backoff, no queueing.
//! - The body on the wire is the canonical string that was signed.

pub mod error;
pub mod headers;

pub use error::{ApiError, ErrorEnvelope};
pub use headers::{DeviceInfo, DeviceMetadataHeaders};

use anyhow::Context as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::auth::REASON_UNAUTHORIZED;
use crate::context::AttestationContext;
use crate::security::RequestBody;

/// Endpoints that are called without a session. A 401 from these means bad
/// credentials, not an expired session.
pub const SESSION_LESS_PATHS: [&str; 9] = [
    "/auth/login",
    "/auth/signin",
    "/auth/register",
    "/auth/register/verify-otp",
    "/auth/register/resend-otp",
    "/auth/register/complete",
    "/auth/forgot-password",
    "/auth/verify-reset-otp",
    "/auth/reset-password",
];

/// An outbound call, relative to the API root.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// When false, a 401 is returned as [`ApiError::CredentialAuth`] and the
    /// session is left alone.
    pub invalidate_on_unauthorized: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            invalidate_on_unauthorized: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: impl Into<RequestBody>) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Never tear down the session on a 401 from this request.
    #[must_use]
    pub fn without_session_invalidation(mut self) -> Self {
        self.invalidate_on_unauthorized = false;
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// A 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed JSON, a JSON string for non-JSON bodies, or null when empty.
    pub body: serde_json::Value,
}

impl ApiResponse {
    /// The `data` member of a `{success, data}` envelope, or the whole body.
    pub fn data(&self) -> &serde_json::Value {
        self.body.get("data").unwrap_or(&self.body)
    }
}

pub struct RequestPipeline {
    ctx: Arc<AttestationContext>,
    http: reqwest::Client,
    api_root: String,
    api_prefix: String,
}

impl RequestPipeline {
    pub fn new(ctx: Arc<AttestationContext>) -> anyhow::Result<Self> {
        let config = ctx.config();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let prefix = config.api_prefix.trim_matches('/');
        let api_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("/{prefix}")
        };

        Ok(Self {
            api_root: config.api_root(),
            api_prefix,
            ctx,
            http,
        })
    }

    pub fn context(&self) -> &Arc<AttestationContext> {
        &self.ctx
    }

    /// Absolute URL for `path`. Absolute URLs pass through unchanged.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }

    pub fn is_session_less(&self, path: &str) -> bool {
        is_session_less_path(path, &self.api_prefix)
    }

    /// Headers for one request carrying `body`.
    pub async fn compose_headers(&self, body: Option<&RequestBody>) -> HeaderMap {
        let mut map = HeaderMap::new();

        let metadata = self.ctx.metadata_headers().await;
        headers::apply(&mut map, metadata.headers());

        if let Some(envelope) = self.ctx.security_envelope(body).await {
            headers::apply(&mut map, envelope.headers());
        }

        if let Some(token) = self.ctx.session().access_token() {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    map.insert(AUTHORIZATION, value);
                }
                Err(_) => tracing::warn!("Stored access token is not a valid header value"),
            }
        }

        map
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let ApiRequest {
            method,
            path,
            query,
            body,
            invalidate_on_unauthorized,
        } = request;

        let url = self.url_for(&path);
        let headers = self.compose_headers(body.as_ref()).await;

        let mut builder = self.http.request(method.clone(), &url).headers(headers);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(body) = &body {
            builder = builder
                .header(CONTENT_TYPE, body.content_type())
                .body(body.canonical());
        }

        tracing::debug!(%method, path = %path, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::transport(&e))?;
        let invalidate = invalidate_on_unauthorized && !self.is_session_less(&path);
        self.classify(&path, invalidate, response).await
    }

    /// Send and decode the response's `data` member (or whole body) as `T`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        serde_json::from_value(response.data().clone()).map_err(|e| ApiError::Decode {
            status: response.status,
            message: e.to_string(),
        })
    }

    async fn classify(
        &self,
        path: &str,
        invalidate_on_unauthorized: bool,
        response: reqwest::Response,
    ) -> Result<ApiResponse, ApiError> {
        let status = response.status();

        if status.is_success() {
            let raw = response
                .bytes()
                .await
                .map_err(|e| ApiError::transport(&e))?;
            self.ctx.session().touch();
            return Ok(ApiResponse {
                status: status.as_u16(),
                body: parse_payload(&raw),
            });
        }

        // The status alone decides a failure; an unreadable body only loses the payload.
        let payload = match response.bytes().await {
            Ok(raw) => parse_payload(&raw),
            Err(e) => {
                tracing::debug!(path, status = status.as_u16(), error = %e, "Failed to read error body");
                serde_json::Value::Null
            }
        };
        Err(self.failure(path, status, payload, invalidate_on_unauthorized))
    }

    /// Map a non-2xx status and its payload to an error. A 401 with
    /// invalidation enabled tears the session down.
    fn failure(
        &self,
        path: &str,
        status: StatusCode,
        payload: serde_json::Value,
        invalidate_on_unauthorized: bool,
    ) -> ApiError {
        let message = extract_message(status, &payload);

        if status == StatusCode::UNAUTHORIZED {
            if !invalidate_on_unauthorized {
                tracing::debug!(path, "Unauthorized without session invalidation");
                return ApiError::CredentialAuth { message, payload };
            }
            self.ctx.invalidator().invalidate(REASON_UNAUTHORIZED);
            return ApiError::SessionAuth { message, payload };
        }

        tracing::debug!(path, status = status.as_u16(), message = %message, "Request failed");
        ApiError::Server {
            status: status.as_u16(),
            message,
            payload,
        }
    }
}

/// Whether `path` is on the session-less allow-list. Query, API prefix and
/// trailing slash are ignored; matching is otherwise exact.
pub fn is_session_less_path(path: &str, api_prefix: &str) -> bool {
    let without_query = path.split(['?', '#']).next().unwrap_or_default();
    let path = match reqwest::Url::parse(without_query) {
        Ok(url) => url.path().to_string(),
        Err(_) => without_query.to_string(),
    };
    let path = format!("/{}", path.trim_matches('/'));

    let prefix = api_prefix.trim_matches('/');
    let relative = if prefix.is_empty() {
        path.as_str()
    } else {
        match path.strip_prefix(&format!("/{prefix}")) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path.as_str(),
        }
    };

    let relative = relative.trim_matches('/');
    SESSION_LESS_PATHS
        .iter()
        .any(|allowed| allowed.trim_start_matches('/') == relative)
}

fn parse_payload(raw: &[u8]) -> serde_json::Value {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(raw).into_owned()))
}

fn extract_message(status: StatusCode, payload: &serde_json::Value) -> String {
    error::extract_server_message(payload)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| format!("Request failed with status code {}", status.as_u16()))
}
