//! Token storage — where credentials and session blobs live.
//!
//! Each write picks exactly one area: durable when the user asked to be
//! remembered, session-scoped otherwise. The copy in the other area is
//! removed so a later read can never resurrect a stale token. Reads prefer
//! the durable area.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use super::{KeyValueStore, StorageError};
use crate::lockout::LoginAttempts;
use crate::models::{CachedUser, Session};

pub const ACCESS_TOKEN_KEY: &str = "auth.access_token";
pub const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";
pub const USER_KEY: &str = "auth.user";
pub const SESSION_KEY: &str = "auth.session";
pub const DEVICE_ID_KEY: &str = "auth.device_id";
pub const LOGIN_ATTEMPTS_KEY: &str = "auth.login_attempts";

#[derive(Clone)]
pub struct TokenStorage {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl TokenStorage {
    #[must_use]
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    // -------------------------------------------------------------------------
    // tokens
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn set_access_token(&self, token: &str, persist: bool) -> Result<(), StorageError> {
        self.put(ACCESS_TOKEN_KEY, token, persist)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn set_refresh_token(&self, token: &str, persist: bool) -> Result<(), StorageError> {
        self.put(REFRESH_TOKEN_KEY, token, persist)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn access_token(&self) -> Result<Option<String>, StorageError> {
        self.read(ACCESS_TOKEN_KEY)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn refresh_token(&self) -> Result<Option<String>, StorageError> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Whether the refresh token lives in the durable area.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn is_persistent(&self) -> Result<bool, StorageError> {
        Ok(self.durable.get(REFRESH_TOKEN_KEY)?.is_some())
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn clear_tokens(&self) -> Result<(), StorageError> {
        self.remove(ACCESS_TOKEN_KEY)?;
        self.remove(REFRESH_TOKEN_KEY)
    }

    // -------------------------------------------------------------------------
    // user cache and session record
    // -------------------------------------------------------------------------

    /// Cached profile, if present and decodable.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn cached_user(&self) -> Result<Option<CachedUser>, StorageError> {
        self.read_json(USER_KEY)
    }

    /// # Errors
    ///
    /// Propagates backing store and encoding failures.
    pub fn store_user(&self, cached: &CachedUser, persist: bool) -> Result<(), StorageError> {
        self.put_json(USER_KEY, cached, persist)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn clear_user(&self) -> Result<(), StorageError> {
        self.remove(USER_KEY)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn session(&self) -> Result<Option<Session>, StorageError> {
        self.read_json(SESSION_KEY)
    }

    /// # Errors
    ///
    /// Propagates backing store and encoding failures.
    pub fn store_session(&self, session: &Session) -> Result<(), StorageError> {
        self.put_json(SESSION_KEY, session, session.remember_me)
    }

    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn clear_session(&self) -> Result<(), StorageError> {
        self.remove(SESSION_KEY)
    }

    // -------------------------------------------------------------------------
    // device identity and lockout counter (always durable)
    // -------------------------------------------------------------------------

    /// Stable identifier for this installation, generated on first use.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn device_id(&self) -> Result<String, StorageError> {
        if let Some(id) = self.durable.get(DEVICE_ID_KEY)? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.durable.set(DEVICE_ID_KEY, &id)?;
        Ok(id)
    }

    /// Persisted failure counter; absent or undecodable means no failures.
    ///
    /// # Errors
    ///
    /// Propagates backing store failures.
    pub fn login_attempts(&self) -> Result<LoginAttempts, StorageError> {
        let Some(raw) = self.durable.get(LOGIN_ATTEMPTS_KEY)? else {
            return Ok(LoginAttempts::default());
        };
        Ok(decode_or_discard(LOGIN_ATTEMPTS_KEY, &raw).unwrap_or_default())
    }

    /// # Errors
    ///
    /// Propagates backing store and encoding failures.
    pub fn store_login_attempts(&self, attempts: &LoginAttempts) -> Result<(), StorageError> {
        if *attempts == LoginAttempts::default() {
            return self.durable.delete(LOGIN_ATTEMPTS_KEY);
        }
        self.durable.set(LOGIN_ATTEMPTS_KEY, &serde_json::to_string(attempts)?)
    }

    /// Drop tokens, cached user and session record. The device id and the
    /// lockout counter survive.
    ///
    /// # Errors
    ///
    /// Returns the first backing store failure after attempting every key.
    pub fn clear_all(&self) -> Result<(), StorageError> {
        let results = [self.clear_tokens(), self.clear_user(), self.clear_session()];
        results.into_iter().collect()
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    fn areas(&self, persist: bool) -> (&dyn KeyValueStore, &dyn KeyValueStore) {
        if persist {
            (self.durable.as_ref(), self.session.as_ref())
        } else {
            (self.session.as_ref(), self.durable.as_ref())
        }
    }

    fn put(&self, key: &str, value: &str, persist: bool) -> Result<(), StorageError> {
        let (target, other) = self.areas(persist);
        target.set(key, value)?;
        other.delete(key)
    }

    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        if let Some(value) = self.durable.get(key)? {
            return Ok(Some(value));
        }
        self.session.get(key)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let durable = self.durable.delete(key);
        let session = self.session.delete(key);
        durable.and(session)
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T, persist: bool) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.put(key, &raw, persist)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        Ok(self
            .read(key)?
            .and_then(|raw| decode_or_discard(key, &raw)))
    }
}

fn decode_or_discard<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "discarding undecodable stored value");
            None
        }
    }
}

#[cfg(test)]
#[path = "tokens_test.rs"]
mod tests;
