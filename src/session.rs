//! Auth session service — login, logout, silent refresh, lockout, user cache
//! and expiry monitoring.
//!
//! DESIGN
//! ======
//! `AuthSession` is a cheap clonable handle over one shared core. Callers only
//! see the action methods; every field is private. Mutable state sits behind a
//! std `Mutex` that is never held across an await point, so network calls
//! always happen between short critical sections.
//!
//! Token storage is the source of truth for credentials. The in-memory copies
//! are a read-through cache, and every transition to `Unauthenticated` (or
//! `Expired`) wipes both.
//!
//! REFRESH
//! =======
//! Refreshes are single-flight. A tokio mutex serialises callers and a
//! completion counter lets anyone who queued behind an in-flight refresh adopt
//! its outcome instead of issuing another request. Resets bump an epoch; a
//! refresh that lands after a reset is discarded rather than resurrecting the
//! session.
//!
//! MONITOR
//! =======
//! Entering `Authenticated` spawns a polling task that holds only a `Weak`
//! reference to the core. Leaving that state aborts it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use reqwest::Method;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, AuthApi, LoginResponse, TokenPair};
use crate::clock::{Clock, SystemClock, duration_ms};
use crate::config::AuthConfig;
use crate::error::{ApiError, AuthError, AuthErrorKind};
use crate::events::{AuthEvent, EventBus};
use crate::guard;
use crate::lockout::{LockState, LockoutPolicy, LoginAttempts};
use crate::models::{AuthUser, CachedUser, Credentials, DeviceSession, Session};
use crate::storage::TokenStorage;
use crate::token;

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    #[default]
    Idle,
    Loading,
    Authenticated,
    Unauthenticated,
    Error,
    Expired,
}

impl AuthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Authenticated => "authenticated",
            Self::Unauthenticated => "unauthenticated",
            Self::Error => "error",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SERVICE
// =============================================================================

#[derive(Clone)]
pub struct AuthSession {
    core: Arc<Core>,
}

struct Core {
    api: Arc<dyn AuthApi>,
    storage: TokenStorage,
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: Mutex<State>,
    /// Serialises refresh calls.
    refresh_gate: tokio::sync::Mutex<()>,
    /// Number of refreshes that have run to completion.
    refreshes_completed: AtomicU64,
    /// Outcome of the most recently completed refresh.
    last_refresh_ok: AtomicBool,
    /// Bumped by every reset; in-flight work compares it to detect one.
    reset_epoch: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct State {
    status: AuthStatus,
    user: Option<AuthUser>,
    session: Option<Session>,
    error: Option<AuthError>,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.monitor).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AuthSession {
    #[must_use]
    pub fn new(api: Arc<dyn AuthApi>, storage: TokenStorage, config: AuthConfig) -> Self {
        Self::with_clock(api, storage, config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        api: Arc<dyn AuthApi>,
        storage: TokenStorage,
        config: AuthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                api,
                storage,
                config,
                clock,
                events: EventBus::new(),
                state: Mutex::new(State::default()),
                refresh_gate: tokio::sync::Mutex::new(()),
                refreshes_completed: AtomicU64::new(0),
                last_refresh_ok: AtomicBool::new(false),
                reset_epoch: AtomicU64::new(0),
                monitor: Mutex::new(None),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // observers
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn status(&self) -> AuthStatus {
        self.state().status
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.status() == AuthStatus::Authenticated
    }

    #[must_use]
    pub fn user(&self) -> Option<AuthUser> {
        self.state().user.clone()
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.state().session.clone()
    }

    #[must_use]
    pub fn error(&self) -> Option<AuthError> {
        self.state().error.clone()
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.core.config
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.core.events.subscribe()
    }

    /// Whether the expiry monitor task is currently running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        lock(&self.core.monitor)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // -------------------------------------------------------------------------
    // permission predicates over the cached user
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn has_role<S: AsRef<str>>(&self, roles: &[S], require_all: bool) -> bool {
        guard::has_role(self.state().user.as_ref(), roles, require_all)
    }

    #[must_use]
    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        guard::has_any_role(self.state().user.as_ref(), roles)
    }

    #[must_use]
    pub fn has_permission<S: AsRef<str>>(&self, permissions: &[S], require_all: bool) -> bool {
        guard::has_permission(self.state().user.as_ref(), permissions, require_all)
    }

    #[must_use]
    pub fn has_any_permission<S: AsRef<str>>(&self, permissions: &[S]) -> bool {
        guard::has_any_permission(self.state().user.as_ref(), permissions)
    }

    // -------------------------------------------------------------------------
    // restore
    // -------------------------------------------------------------------------

    /// Resolve the current status from stored credentials.
    ///
    /// A valid access token with a fresh cached profile authenticates without
    /// any network call. An expired access token with a refresh token present
    /// triggers one silent refresh.
    pub async fn check_auth_status(&self) -> AuthStatus {
        self.set_status(AuthStatus::Loading);

        let storage = &self.core.storage;
        let access = storage.access_token().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read access token");
            None
        });
        let refresh = storage.refresh_token().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read refresh token");
            None
        });
        if access.is_none() && refresh.is_none() {
            debug!("no stored credentials");
            self.reset(AuthStatus::Unauthenticated);
            return self.status();
        }

        let now = self.now();
        let session = match self.restore_session(access.as_deref(), now) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to restore session record");
                self.reset(AuthStatus::Unauthenticated);
                return self.status();
            }
        };
        {
            let mut st = self.state();
            st.access_token.clone_from(&access);
            st.refresh_token.clone_from(&refresh);
            st.session = Some(session);
        }

        let access_valid = access
            .as_deref()
            .is_some_and(|t| self.access_valid_at(t, now));

        if !access_valid {
            if refresh.is_none() {
                info!("stored access token expired and no refresh token");
                self.reset(AuthStatus::Unauthenticated);
                return self.status();
            }
            debug!("stored access token expired; attempting silent refresh");
            if self.refresh_access_token().await.is_err() {
                return self.status();
            }
        }

        match self.ensure_user().await {
            Ok(user) => {
                info!(user_id = %user.id, "session restored");
                self.set_status(AuthStatus::Authenticated);
            }
            Err(e) => {
                warn!(error = %e, "could not load user profile; signing out");
                self.reset(AuthStatus::Unauthenticated);
            }
        }
        self.status()
    }

    fn restore_session(&self, access: Option<&str>, now: i64) -> Result<Session, AuthError> {
        let storage = &self.core.storage;
        if let Some(session) = storage.session()? {
            return Ok(session);
        }
        let expires_at = access.and_then(token::expiration).unwrap_or(now);
        Ok(Session::new(storage.device_id()?, now, expires_at, storage.is_persistent()?))
    }

    /// Fresh cached profile, else the network. A stale cache counts as no
    /// cache at all.
    async fn ensure_user(&self) -> Result<AuthUser, AuthError> {
        if let Some(cached) = self.read_cached_user() {
            if cached.is_fresh_at(self.now(), self.core.config.user_cache_ttl) {
                self.state().user = Some(cached.user.clone());
                return Ok(cached.user);
            }
            debug!("cached profile stale; refetching");
        }
        Ok(self.fetch_user().await?)
    }

    // -------------------------------------------------------------------------
    // login / logout
    // -------------------------------------------------------------------------

    /// Sign in. Rejected without a network call while the local lockout holds.
    ///
    /// # Errors
    ///
    /// Returns the classified [`AuthError`], which is also retained as the
    /// current error.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let policy = self.lockout_policy();
        let mut attempts = self.load_attempts();
        let before = attempts.clone();

        if let LockState::Locked { until } = attempts.check_at(self.now()) {
            warn!(locked_until = until, "login rejected: locked out");
            let err = AuthError::account_locked(until);
            // A live session is left alone; only a signed-out caller enters `Error`.
            if self.is_authenticated() {
                return Err(err);
            }
            return Err(self.fail(err));
        }
        if attempts != before {
            info!("login lockout elapsed; counter reset");
            self.save_attempts(&attempts);
        }

        self.state().error = None;
        self.set_status(AuthStatus::Loading);

        let device_id = match self.core.storage.device_id() {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e.into())),
        };

        match self.core.api.login(credentials, &device_id).await {
            Ok(response) => {
                if let Err(err) = self.complete_login(response, credentials.remember_me, device_id) {
                    if let Err(e) = self.core.storage.clear_all() {
                        warn!(error = %e, "failed to clear partial login state");
                    }
                    return Err(self.fail(err));
                }
                attempts.reset();
                self.save_attempts(&attempts);

                match self.fetch_user().await {
                    Ok(_) => Ok(()),
                    Err(e) if self.user().is_some() => {
                        warn!(error = %e, "profile fetch after login failed; using embedded profile");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(error = %e, "profile fetch after login failed; signing out");
                        self.reset(AuthStatus::Unauthenticated);
                        Err(self.fail(e.into()))
                    }
                }
            }
            Err(api_err) => {
                let mut err = AuthError::from_login_error(&api_err);
                let state = attempts.record_failure_at(policy, self.now());
                self.save_attempts(&attempts);

                match state {
                    LockState::Locked { until } if err.kind == AuthErrorKind::InvalidCredentials => {
                        err = AuthError::too_many_attempts(until);
                    }
                    LockState::Open if err.kind == AuthErrorKind::InvalidCredentials => {
                        err = err.with_details(serde_json::json!({
                            "remaining_attempts": attempts.remaining(policy),
                        }));
                    }
                    _ => {}
                }
                warn!(kind = %err.kind, attempts = attempts.count, error = %api_err, "login failed");
                Err(self.fail(err))
            }
        }
    }

    fn complete_login(&self, response: LoginResponse, remember_me: bool, device_id: String) -> Result<(), AuthError> {
        let storage = &self.core.storage;
        let now = self.now();

        storage.set_access_token(&response.access_token, remember_me)?;
        storage.set_refresh_token(&response.refresh_token, remember_me)?;

        let expires_at = expiry_of(&response.access_token, response.expires_in, now);
        let session = Session::new(device_id, now, expires_at, remember_me);
        storage.store_session(&session)?;

        if let Some(user) = &response.user {
            self.cache_user(user, remember_me);
        }

        {
            let mut st = self.state();
            st.access_token = Some(response.access_token);
            st.refresh_token = Some(response.refresh_token);
            st.session = Some(session);
            st.user = response.user;
            st.error = None;
        }
        self.set_status(AuthStatus::Authenticated);
        info!(remember_me, "login succeeded");
        Ok(())
    }

    /// Sign out. The server-side revoke is best effort; local state is
    /// cleared regardless of its outcome.
    pub async fn logout(&self, everywhere: bool) {
        let access = self.current_access_token();
        let refresh = self.current_refresh_token();

        if let Some(access) = access {
            let result = if everywhere {
                self.core.api.logout_all(&access).await
            } else {
                self.core.api.logout(&access, refresh.as_deref()).await
            };
            if let Err(e) = result {
                warn!(error = %e, everywhere, "server-side logout failed; clearing local session anyway");
            }
        }

        self.reset(AuthStatus::Unauthenticated);
        info!(everywhere, "logged out");
    }

    /// Clear the current error. Leaving the `Error` state resets the session.
    pub fn dismiss_error(&self) {
        let in_error = {
            let mut st = self.state();
            st.error = None;
            st.status == AuthStatus::Error
        };
        if in_error {
            self.reset(AuthStatus::Unauthenticated);
        }
    }

    // -------------------------------------------------------------------------
    // refresh
    // -------------------------------------------------------------------------

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one network call. Failure resets the session
    /// and emits [`AuthEvent::TokenInvalid`].
    ///
    /// # Errors
    ///
    /// Returns a session-expired error when the refresh is rejected or no
    /// refresh token exists.
    pub async fn refresh_access_token(&self) -> Result<(), AuthError> {
        let seen = self.core.refreshes_completed.load(Ordering::SeqCst);
        let _gate = self.core.refresh_gate.lock().await;

        if self.core.refreshes_completed.load(Ordering::SeqCst) != seen {
            debug!("joined refresh completed by a concurrent caller");
            return if self.core.last_refresh_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(AuthError::session_expired())
            };
        }

        let result = self.refresh_once().await;
        self.core
            .last_refresh_ok
            .store(result.is_ok(), Ordering::SeqCst);
        self.core
            .refreshes_completed
            .fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn refresh_once(&self) -> Result<(), AuthError> {
        let Some(refresh_token) = self.current_refresh_token() else {
            info!("no refresh token; resetting session");
            self.reset(AuthStatus::Unauthenticated);
            self.core.events.emit(AuthEvent::TokenInvalid);
            return Err(AuthError::session_expired());
        };
        let epoch = self.core.reset_epoch.load(Ordering::SeqCst);

        match self.core.api.refresh(&refresh_token).await {
            Ok(pair) => self.apply_refresh(pair, epoch),
            Err(_) if self.core.reset_epoch.load(Ordering::SeqCst) != epoch => {
                info!("session reset during refresh; discarding failure");
                Err(AuthError::session_expired())
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed; resetting session");
                self.reset(AuthStatus::Unauthenticated);
                self.core.events.emit(AuthEvent::TokenInvalid);
                Err(AuthError::session_expired())
            }
        }
    }

    /// Store a refreshed token pair unless a reset happened since `epoch`.
    ///
    /// Resets bump the epoch and clear storage under the state lock, so the
    /// check and the writes here cannot interleave with one.
    fn apply_refresh(&self, pair: TokenPair, epoch: u64) -> Result<(), AuthError> {
        let now = self.now();
        let storage = &self.core.storage;
        let mut st = self.state();
        if self.core.reset_epoch.load(Ordering::SeqCst) != epoch {
            info!("session reset during refresh; discarding result");
            return Err(AuthError::session_expired());
        }

        let persist = match st.session.as_ref() {
            Some(session) => session.remember_me,
            None => storage.is_persistent()?,
        };
        storage.set_access_token(&pair.access_token, persist)?;
        if let Some(rotated) = &pair.refresh_token {
            storage.set_refresh_token(rotated, persist)?;
        }

        let expires_at = expiry_of(&pair.access_token, pair.expires_in, now);
        if let Some(session) = st.session.as_mut() {
            session.expires_at = expires_at;
            if let Err(e) = storage.store_session(session) {
                warn!(error = %e, "failed to persist refreshed session");
            }
        }
        st.access_token = Some(pair.access_token);
        if let Some(rotated) = pair.refresh_token {
            st.refresh_token = Some(rotated);
        }
        drop(st);

        debug!(expires_at, "access token refreshed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // user profile
    // -------------------------------------------------------------------------

    /// The signed-in user's profile, from cache unless stale or `force`.
    ///
    /// # Errors
    ///
    /// Returns an error when a refetch is needed and fails.
    pub async fn get_user(&self, force: bool) -> Result<AuthUser, AuthError> {
        if !force {
            if let Some(cached) = self.read_cached_user() {
                if cached.is_fresh_at(self.now(), self.core.config.user_cache_ttl) {
                    self.state().user = Some(cached.user.clone());
                    return Ok(cached.user);
                }
                debug!("cached profile stale; refetching");
            }
        }
        Ok(self.fetch_user().await?)
    }

    async fn fetch_user(&self) -> Result<AuthUser, ApiError> {
        let epoch = self.core.reset_epoch.load(Ordering::SeqCst);
        let api = Arc::clone(&self.core.api);
        let user = self
            .authorized(|token| {
                let api = Arc::clone(&api);
                async move { api.current_user(&token).await }
            })
            .await?;

        let persist = self.remember_me();
        let mut st = self.state();
        if self.core.reset_epoch.load(Ordering::SeqCst) != epoch {
            debug!("session reset during profile fetch; not caching");
            return Ok(user);
        }
        self.cache_user(&user, persist);
        st.user = Some(user.clone());
        Ok(user)
    }

    fn cache_user(&self, user: &AuthUser, persist: bool) {
        let cached = CachedUser { user: user.clone(), cached_at: self.now() };
        if let Err(e) = self.core.storage.store_user(&cached, persist) {
            warn!(error = %e, "failed to cache user profile");
        }
    }

    fn read_cached_user(&self) -> Option<CachedUser> {
        self.core.storage.cached_user().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read cached user");
            None
        })
    }

    // -------------------------------------------------------------------------
    // activity and expiry monitoring
    // -------------------------------------------------------------------------

    /// Note user activity for the idle timeout.
    pub fn record_activity(&self) {
        let now = self.now();
        let session = {
            let mut st = self.state();
            let Some(session) = st.session.as_mut() else {
                return;
            };
            session.touch(now);
            session.clone()
        };
        if let Err(e) = self.core.storage.store_session(&session) {
            warn!(error = %e, "failed to persist session activity");
        }
    }

    /// One monitor pass: expire idle sessions, refresh tokens close to expiry.
    pub async fn check_token_expiry(&self) {
        if self.status() != AuthStatus::Authenticated {
            return;
        }
        let now = self.now();

        if let Some(idle_timeout) = self.core.config.idle_timeout {
            let idle = self.state().session.as_ref().map(|s| s.idle_for(now));
            if idle.is_some_and(|idle| idle >= idle_timeout) {
                info!(idle_secs = idle_timeout.as_secs(), "session idle timeout");
                self.reset(AuthStatus::Expired);
                self.core.events.emit(AuthEvent::SessionTimeout);
                return;
            }
        }

        let Some(access) = self.current_access_token() else {
            return;
        };
        let threshold = self.core.config.refresh_threshold.as_secs();
        if token::is_due_at(self.access_expires_at(&access), threshold, now) {
            debug!(threshold_secs = threshold, "access token near expiry; refreshing");
            if let Err(e) = self.refresh_access_token().await {
                warn!(error = %e, "proactive refresh failed");
            }
        }
    }

    fn start_monitor(&self) {
        let mut slot = lock(&self.core.monitor);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; expiry monitor not started");
            return;
        };

        let weak: Weak<Core> = Arc::downgrade(&self.core);
        let period = self.core.config.monitor_interval;
        debug!(interval_secs = period.as_secs(), "expiry monitor started");

        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(core) = weak.upgrade() else {
                    break;
                };
                AuthSession { core }.check_token_expiry().await;
            }
        }));
    }

    fn stop_monitor(&self) {
        if let Some(handle) = lock(&self.core.monitor).take() {
            handle.abort();
            debug!("expiry monitor stopped");
        }
    }

    // -------------------------------------------------------------------------
    // password recovery and device sessions
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns the classified API failure.
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        self.core.api.forgot_password(email).await?;
        info!("password reset requested");
        Ok(())
    }

    /// Set a new password with a reset token. Success clears the local
    /// lockout counter.
    ///
    /// # Errors
    ///
    /// Returns the classified API failure.
    pub async fn reset_password(&self, reset_token: &str, new_password: &str) -> Result<(), AuthError> {
        self.core
            .api
            .reset_password(reset_token, new_password)
            .await?;
        self.save_attempts(&LoginAttempts::default());
        info!("password reset completed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the classified API failure.
    pub async fn list_sessions(&self) -> Result<Vec<DeviceSession>, AuthError> {
        let api = Arc::clone(&self.core.api);
        Ok(self
            .authorized(|token| {
                let api = Arc::clone(&api);
                async move { api.list_sessions(&token).await }
            })
            .await?)
    }

    /// # Errors
    ///
    /// Returns the classified API failure.
    pub async fn revoke_session(&self, session_id: &str) -> Result<(), AuthError> {
        let api = Arc::clone(&self.core.api);
        self.authorized(|token| {
            let api = Arc::clone(&api);
            let session_id = session_id.to_owned();
            async move { api.revoke_session(&token, &session_id).await }
        })
        .await?;
        info!(session_id, "device session revoked");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // authorized requests
    // -------------------------------------------------------------------------

    /// Issue a JSON request as the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns the API failure after the retry policy in `authorized`.
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        let api = Arc::clone(&self.core.api);
        let request = Arc::new(ApiRequest::new(method, path, body));
        self.authorized(|token| {
            let api = Arc::clone(&api);
            let request = Arc::clone(&request);
            async move { api.send(&request, Some(&token)).await }
        })
        .await
    }

    /// Run `call` with the current access token.
    ///
    /// A 401 triggers one refresh (skipped when another caller already
    /// replaced the token) and one retry. A second 401 emits
    /// [`AuthEvent::Unauthorized`] and resets; a 403 emits
    /// [`AuthEvent::Forbidden`].
    async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.current_access_token().ok_or(ApiError::MissingToken)?;
        let first = call(token.clone()).await;

        let err = match first {
            Err(e) if e.is_unauthorized() => e,
            other => return self.observe(other),
        };

        if self.current_access_token().as_deref() == Some(token.as_str()) {
            debug!("request unauthorized; refreshing access token");
            if self.refresh_access_token().await.is_err() {
                self.core.events.emit(AuthEvent::Unauthorized);
                return Err(err);
            }
        }

        let retry_token = self.current_access_token().ok_or(ApiError::MissingToken)?;
        match call(retry_token).await {
            Err(e) if e.is_unauthorized() => {
                warn!("request still unauthorized after refresh; signing out");
                self.core.events.emit(AuthEvent::Unauthorized);
                self.reset(AuthStatus::Unauthenticated);
                Err(e)
            }
            other => self.observe(other),
        }
    }

    fn observe<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(e) = &result {
            if e.is_forbidden() {
                self.core.events.emit(AuthEvent::Forbidden);
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // state helpers
    // -------------------------------------------------------------------------

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.core.state)
    }

    fn now(&self) -> i64 {
        self.core.clock.now_ms()
    }

    /// Expiry of `access` in epoch milliseconds. Opaque tokens carry no `exp`
    /// claim, so the session record's expiry stands in for it.
    fn access_expires_at(&self, access: &str) -> Option<i64> {
        token::expiration(access).or_else(|| self.state().session.as_ref().map(|s| s.expires_at))
    }

    fn access_valid_at(&self, access: &str, now: i64) -> bool {
        match token::expiration(access) {
            Some(exp) => exp > now,
            None => self
                .state()
                .session
                .as_ref()
                .is_some_and(|s| !s.is_expired_at(now)),
        }
    }

    /// Which storage area credentials belong in. Without a session record
    /// the stored refresh token decides.
    fn remember_me(&self) -> bool {
        if let Some(remember) = self.state().session.as_ref().map(|s| s.remember_me) {
            return remember;
        }
        self.core.storage.is_persistent().unwrap_or(false)
    }

    fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: self.core.config.max_login_attempts,
            lock_duration: self.core.config.lockout,
        }
    }

    fn load_attempts(&self) -> LoginAttempts {
        self.core
            .storage
            .login_attempts()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to read login attempts");
                LoginAttempts::default()
            })
    }

    fn save_attempts(&self, attempts: &LoginAttempts) {
        if let Err(e) = self.core.storage.store_login_attempts(attempts) {
            warn!(error = %e, "failed to persist login attempts");
        }
    }

    fn current_access_token(&self) -> Option<String> {
        if let Some(token) = self.state().access_token.clone() {
            return Some(token);
        }
        let stored = self.core.storage.access_token().ok().flatten()?;
        self.state().access_token = Some(stored.clone());
        Some(stored)
    }

    fn current_refresh_token(&self) -> Option<String> {
        if let Some(token) = self.state().refresh_token.clone() {
            return Some(token);
        }
        let stored = self.core.storage.refresh_token().ok().flatten()?;
        self.state().refresh_token = Some(stored.clone());
        Some(stored)
    }

    /// Record `err` as the current error and enter `Error`.
    fn fail(&self, err: AuthError) -> AuthError {
        self.state().error = Some(err.clone());
        self.set_status(AuthStatus::Error);
        err
    }

    fn set_status(&self, next: AuthStatus) {
        let prev = std::mem::replace(&mut self.state().status, next);
        if prev != next {
            debug!(from = %prev, to = %next, "auth status changed");
        }
        if next == AuthStatus::Authenticated {
            self.start_monitor();
        } else {
            self.stop_monitor();
        }
    }

    /// Drop every trace of the session, locally and in storage. Idempotent.
    fn reset(&self, status: AuthStatus) {
        {
            let mut st = self.state();
            self.core.reset_epoch.fetch_add(1, Ordering::SeqCst);
            st.user = None;
            st.session = None;
            st.error = None;
            st.access_token = None;
            st.refresh_token = None;
            if let Err(e) = self.core.storage.clear_all() {
                warn!(error = %e, "failed to clear persisted auth state");
            }
        }
        self.set_status(status);
    }
}

/// Access token expiry: the `exp` claim, else `expires_in`, else already due.
fn expiry_of(access_token: &str, expires_in: Option<u64>, now: i64) -> i64 {
    token::expiration(access_token)
        .or_else(|| {
            expires_in.map(|secs| now.saturating_add(duration_ms(std::time::Duration::from_secs(secs))))
        })
        .unwrap_or(now)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
