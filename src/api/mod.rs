//! Auth API — the network seam of the session service.
//!
//! `AuthApi` is the trait the session talks to; [`http::HttpAuthApi`] is the
//! reqwest implementation and tests substitute hand-written mocks.

pub mod http;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::models::{AuthUser, Credentials, DeviceSession};

pub use http::HttpAuthApi;

/// Successful answer to a login call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Some servers embed the profile; it is used until `/auth/me` answers.
    #[serde(default)]
    pub user: Option<AuthUser>,
    /// Access token lifetime in seconds, for opaque tokens without `exp`.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Successful answer to a refresh call. A missing refresh token means the
/// server does not rotate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// An arbitrary JSON call made on behalf of the signed-in user.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base URL, e.g. `/documents`.
    pub path: String,
    pub body: Option<Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::GET, path: path.into(), body: None }
    }

    #[must_use]
    pub fn new(method: Method, path: impl Into<String>, body: Option<Value>) -> Self {
        Self { method, path: path.into(), body }
    }
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &Credentials, device_id: &str) -> Result<LoginResponse, ApiError>;

    /// Revoke this device's session.
    async fn logout(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), ApiError>;

    /// Revoke every session of the user.
    async fn logout_all(&self, access_token: &str) -> Result<(), ApiError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;

    async fn current_user(&self, access_token: &str) -> Result<AuthUser, ApiError>;

    async fn forgot_password(&self, email: &str) -> Result<(), ApiError>;

    async fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), ApiError>;

    async fn list_sessions(&self, access_token: &str) -> Result<Vec<DeviceSession>, ApiError>;

    async fn revoke_session(&self, access_token: &str, session_id: &str) -> Result<(), ApiError>;

    /// Issue a generic JSON request. Empty bodies decode as `Value::Null`.
    async fn send(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<Value, ApiError>;
}
