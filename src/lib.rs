//! Client-side request authentication and device attestation.
//!
//! Every outbound call passes through a [`RequestPipeline`], which attaches
//! device metadata, a signed one-shot security envelope and the bearer
//! token, then classifies the response. A 401 on a session-bearing endpoint
//! tears the local session down exactly once and broadcasts
//! [`SessionTerminated`](auth::SessionTerminated).

pub mod auth;
pub mod config;
pub mod context;
pub mod gateway;
pub mod geo;
pub mod security;
pub mod storage;

pub use auth::{sign_in, sign_out, Credentials, SessionTerminated};
pub use config::ClientConfig;
pub use context::AttestationContext;
pub use gateway::{ApiError, ApiRequest, ApiResponse, RequestPipeline};
pub use security::{CryptoCapability, RequestBody};
