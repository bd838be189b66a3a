//! Normalized request failures.

use serde::{Deserialize, Serialize};

/// Every way a pipeline call can fail, as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No response: offline, DNS, connect failure or timeout.
    #[error("{message}")]
    Transport { message: String, timed_out: bool },

    /// 401 from a session-less endpoint (bad credentials). Nothing cleared.
    #[error("{message}")]
    CredentialAuth {
        message: String,
        payload: serde_json::Value,
    },

    /// 401 on a session-bearing endpoint. The session has been invalidated.
    #[error("{message}")]
    SessionAuth {
        message: String,
        payload: serde_json::Value,
    },

    /// Any other non-2xx response.
    #[error("{message} (HTTP {status})")]
    Server {
        status: u16,
        message: String,
        payload: serde_json::Value,
    },

    /// 2xx response whose body did not match the expected shape.
    #[error("failed to decode response: {message}")]
    Decode { status: u16, message: String },
}

/// `{success: false, message, statusCode, data}` shape handed to UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub message: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    pub(crate) fn transport(err: &reqwest::Error) -> Self {
        tracing::debug!(error = %err, "Request produced no response");
        if err.is_timeout() {
            Self::Transport {
                message: "Request timed out. Please try again.".into(),
                timed_out: true,
            }
        } else {
            Self::Transport {
                message: "Unable to reach the server. Please check your connection.".into(),
                timed_out: false,
            }
        }
    }

    /// HTTP status, or 0 when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Transport { .. } => 0,
            Self::CredentialAuth { .. } | Self::SessionAuth { .. } => 401,
            Self::Server { status, .. } | Self::Decode { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. }
            | Self::CredentialAuth { message, .. }
            | Self::SessionAuth { message, .. }
            | Self::Server { message, .. }
            | Self::Decode { message, .. } => message,
        }
    }

    /// Raw server payload, if a response was received.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::CredentialAuth { payload, .. }
            | Self::SessionAuth { payload, .. }
            | Self::Server { payload, .. } => Some(payload),
            Self::Transport { .. } | Self::Decode { .. } => None,
        }
    }

    /// Whether this failure tore down the local session.
    pub fn ended_session(&self) -> bool {
        matches!(self, Self::SessionAuth { .. })
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            success: false,
            message: self.message().to_string(),
            status_code: self.status_code(),
            data: self.payload().cloned(),
        }
    }
}

/// Pull a human-readable message out of a server error body.
///
/// Recognizes `{"message": ..}`, `{"error": ".."}` and
/// `{"error": {"message": ..}}`.
pub(crate) fn extract_server_message(payload: &serde_json::Value) -> Option<String> {
    let non_empty = |v: &serde_json::Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    payload
        .get("message")
        .and_then(non_empty)
        .or_else(|| payload.get("error").and_then(non_empty))
        .or_else(|| {
            payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(non_empty)
        })
}
