//! Session data model shared by storage, the API client and the session service.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::duration_ms;

/// Cached projection of the server's user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A user profile together with the time it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUser {
    pub user: AuthUser,
    /// Epoch milliseconds.
    pub cached_at: i64,
}

impl CachedUser {
    /// Fresh while its age does not exceed `ttl`. Timestamps from the future
    /// count as stale.
    #[must_use]
    pub fn is_fresh_at(&self, now_ms: i64, ttl: Duration) -> bool {
        let age = now_ms - self.cached_at;
        (0..=duration_ms(ttl)).contains(&age)
    }
}

/// Local record of the signed-in session on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub device_id: String,
    /// Epoch milliseconds of the last recorded user activity.
    pub last_activity: i64,
    /// Epoch milliseconds at which the current access token expires.
    pub expires_at: i64,
    pub remember_me: bool,
}

impl Session {
    #[must_use]
    pub fn new(device_id: String, now_ms: i64, expires_at: i64, remember_me: bool) -> Self {
        Self { device_id, last_activity: now_ms, expires_at, remember_me }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity = self.last_activity.max(now_ms);
    }

    #[must_use]
    pub fn idle_for(&self, now_ms: i64) -> Duration {
        let idle = now_ms.saturating_sub(self.last_activity).max(0);
        Duration::from_millis(u64::try_from(idle).unwrap_or(0))
    }

    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Login form input.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>, remember_me: bool) -> Self {
        Self { email: email.into(), password: password.into(), remember_me }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// One server-side session belonging to the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub id: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub last_active_at: Option<String>,
    #[serde(default)]
    pub current: bool,
}
