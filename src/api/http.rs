//! reqwest implementation of [`AuthApi`].
//!
//! Thin HTTP wrapper over the auth endpoints. Status handling and body
//! decoding are pure functions (`error_from_response`, `parse_body`) so they
//! can be tested without a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::{ApiRequest, AuthApi, LoginResponse, TokenPair};
use crate::config::{AuthConfig, HttpTimeouts};
use crate::error::ApiError;
use crate::models::{AuthUser, Credentials, DeviceSession};

const USER_AGENT: &str = concat!("authsession/", env!("CARGO_PKG_VERSION"));

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpAuthApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    /// # Errors
    ///
    /// Returns an error for a non-HTTP base URL or if the client fails to build.
    pub fn new(base_url: &str, timeouts: HttpTimeouts) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ApiError::InvalidUrl(base_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: base_url.to_owned() })
    }

    /// # Errors
    ///
    /// See [`HttpAuthApi::new`].
    pub fn from_config(config: &AuthConfig) -> Result<Self, ApiError> {
        Self::new(&config.api_base_url, config.timeouts)
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
        body: Option<&Value>,
    ) -> Result<String, ApiError> {
        let url = join_url(&self.base_url, path);
        debug!(%method, %url, "auth api request");

        let mut request = self.http.request(method, url.as_str());
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_transport_error)?;

        if !(200..300).contains(&status) {
            return Err(error_from_response(status, &text));
        }
        Ok(text)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        access_token: Option<&str>,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        let text = self.execute(method, path, access_token, body).await?;
        parse_body(&text)
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials, device_id: &str) -> Result<LoginResponse, ApiError> {
        let body = json!({
            "email": credentials.email,
            "password": credentials.password,
            "remember_me": credentials.remember_me,
            "device_id": device_id,
        });
        self.call(Method::POST, "/auth/login", None, Some(&body)).await
    }

    async fn logout(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), ApiError> {
        let body = json!({ "refresh_token": refresh_token });
        self.execute(Method::POST, "/auth/logout", Some(access_token), Some(&body))
            .await
            .map(drop)
    }

    async fn logout_all(&self, access_token: &str) -> Result<(), ApiError> {
        self.execute(Method::POST, "/auth/logout-all", Some(access_token), None)
            .await
            .map(drop)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        let body = json!({ "refresh_token": refresh_token });
        self.call(Method::POST, "/auth/refresh", None, Some(&body)).await
    }

    async fn current_user(&self, access_token: &str) -> Result<AuthUser, ApiError> {
        self.call(Method::GET, "/auth/me", Some(access_token), None).await
    }

    async fn forgot_password(&self, email: &str) -> Result<(), ApiError> {
        let body = json!({ "email": email });
        self.execute(Method::POST, "/auth/forgot-password", None, Some(&body))
            .await
            .map(drop)
    }

    async fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), ApiError> {
        let body = json!({ "token": reset_token, "password": new_password });
        self.execute(Method::POST, "/auth/reset-password", None, Some(&body))
            .await
            .map(drop)
    }

    async fn list_sessions(&self, access_token: &str) -> Result<Vec<DeviceSession>, ApiError> {
        let value: Value = self.call(Method::GET, "/auth/sessions", Some(access_token), None).await?;
        parse_session_list(value)
    }

    async fn revoke_session(&self, access_token: &str, session_id: &str) -> Result<(), ApiError> {
        let path = format!("/auth/sessions/{session_id}");
        self.execute(Method::DELETE, &path, Some(access_token), None)
            .await
            .map(drop)
    }

    async fn send(&self, request: &ApiRequest, access_token: Option<&str>) -> Result<Value, ApiError> {
        self.call(request.method.clone(), &request.path, access_token, request.body.as_ref())
            .await
    }
}

// =============================================================================
// HELPERS
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Join a base URL and a path with exactly one slash between them.
fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn map_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Request(e.to_string())
    }
}

/// Build a status error, lifting `code` and `message` (or `error`) out of a
/// JSON body when there is one.
fn error_from_response(status: u16, body: &str) -> ApiError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .or(parsed.error)
        .filter(|m| !m.trim().is_empty());
    ApiError::Status { status, code: parsed.code, message }
}

/// Decode a success body. An empty body decodes as JSON `null`.
fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    let text = if text.trim().is_empty() { "null" } else { text };
    serde_json::from_str(text).map_err(|e| ApiError::Parse(e.to_string()))
}

/// Accept either a bare array or `{ "sessions": [...] }`.
fn parse_session_list(value: Value) -> Result<Vec<DeviceSession>, ApiError> {
    let list = match value {
        Value::Object(mut map) => map.remove("sessions").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list).map_err(|e| ApiError::Parse(e.to_string()))
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
