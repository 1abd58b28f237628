//! Session configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000/api";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 5 * 60;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_USER_CACHE_TTL_SECS: u64 = 30 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid AUTH_API_BASE_URL '{0}' (expected http:// or https://)")]
    InvalidBaseUrl(String),
    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self { request_secs: DEFAULT_REQUEST_TIMEOUT_SECS, connect_secs: DEFAULT_CONNECT_TIMEOUT_SECS }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Base URL every auth endpoint is joined onto, without a trailing slash.
    pub api_base_url: String,
    pub timeouts: HttpTimeouts,
    /// Consecutive failed logins before the local lockout engages.
    pub max_login_attempts: u32,
    /// How long the local lockout lasts.
    pub lockout: Duration,
    /// Refresh proactively once the access token is this close to expiry.
    pub refresh_threshold: Duration,
    /// Poll period of the expiry monitor.
    pub monitor_interval: Duration,
    /// Cached user profiles older than this are refetched.
    pub user_cache_ttl: Duration,
    /// Expire the session after this much inactivity. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            timeouts: HttpTimeouts::default(),
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            lockout: Duration::from_secs(DEFAULT_LOCKOUT_SECS),
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            user_cache_ttl: Duration::from_secs(DEFAULT_USER_CACHE_TTL_SECS),
            idle_timeout: None,
        }
    }
}

impl AuthConfig {
    /// Build typed config from environment variables.
    ///
    /// All optional:
    /// - `AUTH_API_BASE_URL`: default `http://127.0.0.1:3000/api`
    /// - `AUTH_REQUEST_TIMEOUT_SECS`: default 30
    /// - `AUTH_CONNECT_TIMEOUT_SECS`: default 10
    /// - `AUTH_MAX_LOGIN_ATTEMPTS`: default 5
    /// - `AUTH_LOCKOUT_SECS`: default 900
    /// - `AUTH_REFRESH_THRESHOLD_SECS`: default 300
    /// - `AUTH_MONITOR_INTERVAL_SECS`: default 30
    /// - `AUTH_USER_CACHE_TTL_SECS`: default 1800
    /// - `AUTH_IDLE_TIMEOUT_SECS`: default 0 (disabled)
    ///
    /// # Errors
    ///
    /// Returns an error for a non-HTTP base URL or a zero attempt limit or
    /// monitor interval.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base_url = std::env::var("AUTH_API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_owned());
        let idle_secs = env_parse("AUTH_IDLE_TIMEOUT_SECS", 0_u64);

        let config = Self {
            api_base_url: normalize_base_url(&api_base_url)?,
            timeouts: HttpTimeouts {
                request_secs: env_parse("AUTH_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
                connect_secs: env_parse("AUTH_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
            },
            max_login_attempts: env_parse("AUTH_MAX_LOGIN_ATTEMPTS", DEFAULT_MAX_LOGIN_ATTEMPTS),
            lockout: Duration::from_secs(env_parse("AUTH_LOCKOUT_SECS", DEFAULT_LOCKOUT_SECS)),
            refresh_threshold: Duration::from_secs(env_parse(
                "AUTH_REFRESH_THRESHOLD_SECS",
                DEFAULT_REFRESH_THRESHOLD_SECS,
            )),
            monitor_interval: Duration::from_secs(env_parse(
                "AUTH_MONITOR_INTERVAL_SECS",
                DEFAULT_MONITOR_INTERVAL_SECS,
            )),
            user_cache_ttl: Duration::from_secs(env_parse("AUTH_USER_CACHE_TTL_SECS", DEFAULT_USER_CACHE_TTL_SECS)),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the base URL, applying the same normalization as `from_env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBaseUrl`] for non-HTTP URLs.
    pub fn with_base_url(mut self, url: &str) -> Result<Self, ConfigError> {
        self.api_base_url = normalize_base_url(url)?;
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] when a value that must be positive is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_login_attempts == 0 {
            return Err(ConfigError::Zero { key: "AUTH_MAX_LOGIN_ATTEMPTS" });
        }
        // tokio::time::interval panics on a zero period.
        if self.monitor_interval.is_zero() {
            return Err(ConfigError::Zero { key: "AUTH_MONITOR_INTERVAL_SECS" });
        }
        Ok(())
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl(raw.to_owned()));
    }
    Ok(trimmed.to_owned())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
