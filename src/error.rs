//! Error types for the auth session lifecycle.
//!
//! DESIGN
//! ======
//! Two layers. `ApiError` is the transport view raised by the HTTP client
//! (status codes, timeouts, undecodable bodies). `AuthError` is the single
//! shape surfaced to callers and retained by the session for banner display;
//! it carries one of four kinds plus the server's code and details when present.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::StorageError;

// =============================================================================
// API ERROR
// =============================================================================

/// Errors produced by HTTP calls against the auth API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The configured base URL cannot be used.
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),

    /// The request never produced a response (DNS, connect, TLS, reset).
    #[error("request failed: {0}")]
    Request(String),

    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("API response error: status {status}")]
    Status {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    /// The response body could not be decoded.
    #[error("response parse failed: {0}")]
    Parse(String),

    /// An authorized call was attempted without an access token.
    #[error("no access token available")]
    MissingToken,
}

impl ApiError {
    /// Bare status error without a server-provided body.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self::Status { status, code: None, message: None }
    }

    /// HTTP status code, if the server answered.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. } | Self::MissingToken)
    }

    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Status { status: 403, .. })
    }

    fn server_code(&self) -> Option<String> {
        match self {
            Self::Status { code, .. } => code.clone(),
            _ => None,
        }
    }

    fn server_message(&self) -> Option<String> {
        match self {
            Self::Status { message, .. } => message.clone(),
            _ => None,
        }
    }
}

// =============================================================================
// AUTH ERROR
// =============================================================================

/// Classification of a failed auth operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorKind {
    InvalidCredentials,
    TooManyAttempts,
    AccountLocked,
    Unknown,
}

impl AuthErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error shape returned by every fallible session operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AuthError {
    #[must_use]
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), code: None, details: None }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Local lockout rejection; `locked_until` is epoch milliseconds.
    #[must_use]
    pub fn account_locked(locked_until: i64) -> Self {
        Self::new(AuthErrorKind::AccountLocked, "too many failed sign-in attempts; try again later")
            .with_details(serde_json::json!({ "locked_until": locked_until }))
    }

    /// The failure that tripped the local lockout.
    #[must_use]
    pub fn too_many_attempts(locked_until: i64) -> Self {
        Self::new(AuthErrorKind::TooManyAttempts, "too many failed sign-in attempts")
            .with_details(serde_json::json!({ "locked_until": locked_until }))
    }

    #[must_use]
    pub fn session_expired() -> Self {
        Self::new(AuthErrorKind::Unknown, "session expired; sign in again").with_code("SESSION_EXPIRED")
    }

    /// Classify a failed login call.
    ///
    /// 400 and 401 mean the credentials were rejected; 423 and 429 are the
    /// server's own lockout and throttling answers.
    #[must_use]
    pub fn from_login_error(err: &ApiError) -> Self {
        let kind = match err.status_code() {
            Some(400 | 401) => AuthErrorKind::InvalidCredentials,
            Some(429) => AuthErrorKind::TooManyAttempts,
            Some(423) => AuthErrorKind::AccountLocked,
            _ => AuthErrorKind::Unknown,
        };
        let message = err.server_message().unwrap_or_else(|| match kind {
            AuthErrorKind::InvalidCredentials => "invalid email or password".to_owned(),
            _ => err.to_string(),
        });
        Self { kind, message, code: err.server_code(), details: None }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        let kind = match err.status_code() {
            Some(429) => AuthErrorKind::TooManyAttempts,
            Some(423) => AuthErrorKind::AccountLocked,
            _ => AuthErrorKind::Unknown,
        };
        let message = err.server_message().unwrap_or_else(|| err.to_string());
        Self { kind, message, code: err.server_code(), details: None }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        Self::new(AuthErrorKind::Unknown, err.to_string()).with_code("STORAGE")
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
