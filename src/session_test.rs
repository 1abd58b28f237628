use super::*;

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::api::TokenPair;
use crate::clock::ManualClock;
use crate::storage::tokens::{ACCESS_TOKEN_KEY, DEVICE_ID_KEY};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::token::test_helpers::token_expiring_at;

const NOW: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

// =============================================================================
// mock api
// =============================================================================

#[derive(Default)]
struct MockApi {
    login_results: Mutex<VecDeque<Result<LoginResponse, ApiError>>>,
    refresh_results: Mutex<VecDeque<Result<TokenPair, ApiError>>>,
    user_results: Mutex<VecDeque<Result<AuthUser, ApiError>>>,
    send_results: Mutex<VecDeque<Result<Value, ApiError>>>,
    logout_error: Mutex<Option<ApiError>>,
    refresh_delay: Option<Duration>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    me_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    logout_all_calls: AtomicUsize,
    send_tokens: Mutex<Vec<String>>,
}

impl MockApi {
    fn push_login(&self, result: Result<LoginResponse, ApiError>) {
        self.login_results.lock().unwrap().push_back(result);
    }

    fn push_refresh(&self, result: Result<TokenPair, ApiError>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    fn push_send(&self, result: Result<Value, ApiError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    fn logins(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn profile_fetches(&self) -> usize {
        self.me_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for MockApi {
    async fn login(&self, _credentials: &Credentials, _device_id: &str) -> Result<LoginResponse, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.login_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::status(401)))
    }

    async fn logout(&self, _access_token: &str, _refresh_token: Option<&str>) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.logout_error.lock().unwrap().take().map_or(Ok(()), Err)
    }

    async fn logout_all(&self, _access_token: &str) -> Result<(), ApiError> {
        self.logout_all_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        self.refresh_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::status(401)))
    }

    async fn current_user(&self, _access_token: &str) -> Result<AuthUser, ApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        self.user_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(user()))
    }

    async fn forgot_password(&self, _email: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn reset_password(&self, _reset_token: &str, _new_password: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn list_sessions(&self, _access_token: &str) -> Result<Vec<DeviceSession>, ApiError> {
        Ok(vec![DeviceSession {
            id: "s-1".into(),
            device: Some("laptop".into()),
            ip_address: None,
            last_active_at: None,
            current: true,
        }])
    }

    async fn revoke_session(&self, _access_token: &str, _session_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn send(&self, _request: &ApiRequest, access_token: Option<&str>) -> Result<Value, ApiError> {
        self.send_tokens
            .lock()
            .unwrap()
            .push(access_token.unwrap_or_default().to_owned());
        self.send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }
}

// =============================================================================
// fixture
// =============================================================================

fn user() -> AuthUser {
    AuthUser {
        id: "u-1".into(),
        email: "ada@example.test".into(),
        name: Some("Ada".into()),
        roles: vec!["admin".into()],
        permissions: vec!["docs:read".into()],
    }
}

fn login_ok(access_token: String) -> Result<LoginResponse, ApiError> {
    Ok(LoginResponse {
        access_token,
        refresh_token: "r-1".into(),
        user: Some(user()),
        expires_in: None,
    })
}

fn pair(access_token: String) -> Result<TokenPair, ApiError> {
    Ok(TokenPair { access_token, refresh_token: Some("r-2".into()), expires_in: None })
}

fn creds(remember_me: bool) -> Credentials {
    Credentials::new("ada@example.test", "secret", remember_me)
}

struct Fixture {
    api: Arc<MockApi>,
    clock: Arc<ManualClock>,
    durable: Arc<MemoryStore>,
    session_area: Arc<MemoryStore>,
    storage: TokenStorage,
    auth: AuthSession,
}

fn fixture(api: MockApi) -> Fixture {
    fixture_with(api, AuthConfig::default())
}

fn fixture_with(api: MockApi, config: AuthConfig) -> Fixture {
    let api = Arc::new(api);
    let clock = Arc::new(ManualClock::new(NOW));
    let durable = Arc::new(MemoryStore::new());
    let session_area = Arc::new(MemoryStore::new());
    let storage = TokenStorage::new(durable.clone(), session_area.clone());
    let auth = AuthSession::with_clock(api.clone(), storage.clone(), config, clock.clone());
    Fixture { api, clock, durable, session_area, storage, auth }
}

impl Fixture {
    /// Credentials left behind by an earlier remembered login.
    fn seed_tokens(&self, access_exp_ms: i64) {
        self.storage
            .set_access_token(&token_expiring_at(access_exp_ms), true)
            .unwrap();
        self.storage.set_refresh_token("r-1", true).unwrap();
    }

    async fn sign_in(&self, access_exp_ms: i64) {
        self.api.push_login(login_ok(token_expiring_at(access_exp_ms)));
        self.auth.login(&creds(true)).await.unwrap();
    }
}

// =============================================================================
// login
// =============================================================================

#[tokio::test]
async fn login_stores_tokens_and_session() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;

    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);
    assert!(fx.auth.is_authenticated());
    assert!(fx.auth.is_monitoring());
    assert_eq!(fx.auth.user().unwrap().id, "u-1");

    let session = fx.auth.session().unwrap();
    assert_eq!(session.expires_at, NOW + HOUR_MS);
    assert_eq!(session.last_activity, NOW);
    assert!(session.remember_me);
    assert_eq!(Some(session.device_id), fx.durable.get(DEVICE_ID_KEY).unwrap());

    assert!(fx.durable.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    assert!(fx.session_area.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    assert_eq!(fx.api.profile_fetches(), 1);
}

#[tokio::test]
async fn login_without_remember_me_uses_session_area() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(login_ok(token_expiring_at(NOW + HOUR_MS)));
    fx.auth.login(&creds(false)).await.unwrap();

    assert!(fx.durable.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    assert!(fx.session_area.get(ACCESS_TOKEN_KEY).unwrap().is_some());
    assert!(!fx.storage.is_persistent().unwrap());
}

#[tokio::test]
async fn opaque_token_expiry_comes_from_expires_in() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(Ok(LoginResponse {
        access_token: "opaque".into(),
        refresh_token: "r-1".into(),
        user: None,
        expires_in: Some(600),
    }));
    fx.auth.login(&creds(true)).await.unwrap();
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + 600_000);
}

#[tokio::test]
async fn failed_logins_count_down_then_lock() {
    let fx = fixture(MockApi::default());

    for remaining in (1..=4).rev() {
        let err = fx.auth.login(&creds(false)).await.unwrap_err();
        assert_eq!(err.kind, AuthErrorKind::InvalidCredentials);
        assert_eq!(err.details, Some(json!({ "remaining_attempts": remaining })));
    }

    let err = fx.auth.login(&creds(false)).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::TooManyAttempts);

    let err = fx.auth.login(&creds(false)).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::AccountLocked);
    assert_eq!(err.details, Some(json!({ "locked_until": NOW + 900_000 })));

    assert_eq!(fx.api.logins(), 5, "locked attempt must not reach the server");
    assert_eq!(fx.auth.status(), AuthStatus::Error);
    assert_eq!(fx.auth.error(), Some(err));
}

#[tokio::test]
async fn lockout_lifts_after_window() {
    let fx = fixture(MockApi::default());
    for _ in 0..5 {
        let _ = fx.auth.login(&creds(false)).await;
    }
    fx.clock.advance(Duration::from_secs(900));

    fx.api.push_login(login_ok(token_expiring_at(NOW + 2 * HOUR_MS)));
    fx.auth.login(&creds(false)).await.unwrap();
    assert_eq!(fx.api.logins(), 6);
    assert_eq!(fx.storage.login_attempts().unwrap(), LoginAttempts::default());
}

#[tokio::test]
async fn server_throttling_is_surfaced() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(Err(ApiError::status(429)));
    let err = fx.auth.login(&creds(false)).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::TooManyAttempts);
    assert!(err.details.is_none());
}

#[tokio::test]
async fn dismiss_error_leaves_error_state() {
    let fx = fixture(MockApi::default());
    let _ = fx.auth.login(&creds(false)).await;
    assert_eq!(fx.auth.status(), AuthStatus::Error);

    fx.auth.dismiss_error();
    assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
    assert!(fx.auth.error().is_none());
    // The lockout counter is not part of the session.
    assert_eq!(fx.storage.login_attempts().unwrap().count, 1);
}

#[tokio::test]
async fn reset_password_clears_attempts() {
    let fx = fixture(MockApi::default());
    let _ = fx.auth.login(&creds(false)).await;
    let _ = fx.auth.login(&creds(false)).await;
    assert_eq!(fx.storage.login_attempts().unwrap().count, 2);

    fx.auth.reset_password("reset-token", "new-secret").await.unwrap();
    assert_eq!(fx.storage.login_attempts().unwrap(), LoginAttempts::default());
}

// =============================================================================
// logout
// =============================================================================

#[tokio::test]
async fn logout_clears_state_when_server_fails() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    let device_id = fx.storage.device_id().unwrap();
    *fx.api.logout_error.lock().unwrap() = Some(ApiError::status(500));

    fx.auth.logout(false).await;

    assert_eq!(fx.api.logout_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
    assert!(fx.auth.user().is_none());
    assert!(fx.auth.session().is_none());
    assert!(!fx.auth.is_monitoring());
    assert!(fx.storage.access_token().unwrap().is_none());
    assert!(fx.storage.cached_user().unwrap().is_none());
    assert_eq!(fx.storage.device_id().unwrap(), device_id);
}

#[tokio::test]
async fn logout_everywhere_revokes_all_sessions() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    fx.auth.logout(true).await;
    assert_eq!(fx.api.logout_all_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.api.logout_calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// refresh
// =============================================================================

#[tokio::test]
async fn concurrent_refreshes_share_one_call() {
    let fx = fixture(MockApi { refresh_delay: Some(Duration::from_millis(50)), ..MockApi::default() });
    fx.seed_tokens(NOW - 1000);
    fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

    let (a, b, c) = tokio::join!(
        fx.auth.refresh_access_token(),
        fx.auth.refresh_access_token(),
        fx.auth.refresh_access_token(),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(fx.api.refreshes(), 1);

    // Rotated tokens stay in the durable area.
    assert_eq!(fx.durable.get(crate::storage::tokens::REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("r-2"));
    assert!(fx.storage.is_persistent().unwrap());
}

#[tokio::test]
async fn failed_refresh_resets_and_signals() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW - 1000);
    let mut rx = fx.auth.subscribe();

    let err = fx.auth.refresh_access_token().await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("SESSION_EXPIRED"));
    assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
    assert!(fx.storage.refresh_token().unwrap().is_none());
    assert_eq!(rx.try_recv().unwrap(), AuthEvent::TokenInvalid);
}

#[tokio::test]
async fn refresh_landing_after_logout_is_discarded() {
    let fx = fixture(MockApi { refresh_delay: Some(Duration::from_millis(50)), ..MockApi::default() });
    fx.seed_tokens(NOW - 1000);
    fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

    let (result, ()) = tokio::join!(fx.auth.refresh_access_token(), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.auth.logout(false).await;
    });

    assert!(result.is_err());
    assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
    assert!(fx.storage.access_token().unwrap().is_none());
}

// =============================================================================
// restore
// =============================================================================

#[tokio::test]
async fn restore_without_tokens_is_unauthenticated() {
    let fx = fixture(MockApi::default());
    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Unauthenticated);
    assert_eq!(fx.api.profile_fetches(), 0);
}

#[tokio::test]
async fn restore_with_fresh_cache_skips_network() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW + HOUR_MS);
    fx.storage
        .store_user(&CachedUser { user: user(), cached_at: NOW - 60_000 }, true)
        .unwrap();

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Authenticated);
    assert_eq!(fx.api.profile_fetches(), 0);
    assert_eq!(fx.api.refreshes(), 0);
    assert_eq!(fx.auth.user(), Some(user()));
}

#[tokio::test]
async fn restore_with_expired_access_refreshes_once() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW - 1000);
    fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Authenticated);
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(fx.api.profile_fetches(), 1);
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + HOUR_MS);
}

#[tokio::test]
async fn restore_expired_without_refresh_token() {
    let fx = fixture(MockApi::default());
    fx.storage
        .set_access_token(&token_expiring_at(NOW - 1000), true)
        .unwrap();

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Unauthenticated);
    assert_eq!(fx.api.refreshes(), 0);
    assert!(fx.storage.access_token().unwrap().is_none());
}

#[tokio::test]
async fn restore_with_stale_cache_and_failed_refetch_signs_out() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW + HOUR_MS);
    fx.storage
        .store_user(&CachedUser { user: user(), cached_at: NOW - 2 * HOUR_MS }, true)
        .unwrap();
    fx.api
        .user_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::Timeout));

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Unauthenticated);
    assert_eq!(fx.api.profile_fetches(), 1);
    assert!(fx.auth.user().is_none());
    assert!(!fx.auth.has_any_role(&["admin"]));
    assert!(fx.storage.cached_user().unwrap().is_none());
}

#[tokio::test]
async fn restore_with_stale_cache_refetches_profile() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW + HOUR_MS);
    let mut stale = user();
    stale.roles = vec!["viewer".into()];
    fx.storage
        .store_user(&CachedUser { user: stale, cached_at: NOW - 2 * HOUR_MS }, true)
        .unwrap();

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Authenticated);
    assert_eq!(fx.auth.user(), Some(user()));
    assert_eq!(fx.storage.cached_user().unwrap().unwrap().cached_at, NOW);
}

#[tokio::test]
async fn restore_with_unexpired_opaque_token_skips_refresh() {
    let fx = fixture(MockApi::default());
    fx.storage.set_access_token("opaque-a", true).unwrap();
    fx.storage.set_refresh_token("r-1", true).unwrap();
    fx.storage
        .store_session(&Session::new("dev-1".into(), NOW - 60_000, NOW + HOUR_MS, true))
        .unwrap();

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Authenticated);
    assert_eq!(fx.api.refreshes(), 0);
}

#[tokio::test]
async fn restore_with_expired_opaque_token_refreshes() {
    let fx = fixture(MockApi::default());
    fx.storage.set_access_token("opaque-a", true).unwrap();
    fx.storage.set_refresh_token("r-1", true).unwrap();
    fx.storage
        .store_session(&Session::new("dev-1".into(), NOW - HOUR_MS, NOW - 1000, true))
        .unwrap();
    fx.api.push_refresh(Ok(TokenPair { access_token: "opaque-b".into(), refresh_token: None, expires_in: Some(3600) }));

    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Authenticated);
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + HOUR_MS);
}

// =============================================================================
// user cache
// =============================================================================

#[tokio::test]
async fn cached_profile_expires_after_ttl() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + 2 * HOUR_MS).await;
    assert_eq!(fx.api.profile_fetches(), 1);

    fx.clock.advance(Duration::from_secs(10 * 60));
    fx.auth.get_user(false).await.unwrap();
    assert_eq!(fx.api.profile_fetches(), 1);

    fx.clock.advance(Duration::from_secs(21 * 60));
    fx.auth.get_user(false).await.unwrap();
    assert_eq!(fx.api.profile_fetches(), 2);

    fx.auth.get_user(true).await.unwrap();
    assert_eq!(fx.api.profile_fetches(), 3);
}

#[tokio::test]
async fn permission_checks_use_signed_in_user() {
    let fx = fixture(MockApi::default());
    assert!(!fx.auth.has_any_role(&["admin"]));

    fx.sign_in(NOW + HOUR_MS).await;
    assert!(fx.auth.has_role(&["admin"], true));
    assert!(!fx.auth.has_role(&["admin", "owner"], true));
    assert!(fx.auth.has_any_permission(&["docs:write", "docs:read"]));
    assert!(!fx.auth.has_permission(&["docs:write"], false));
}

// =============================================================================
// authorized requests
// =============================================================================

#[tokio::test]
async fn request_retries_once_after_refresh() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    let first = fx.storage.access_token().unwrap().unwrap();
    let second = token_expiring_at(NOW + 2 * HOUR_MS);
    fx.api.push_send(Err(ApiError::status(401)));
    fx.api.push_send(Ok(json!({ "ok": true })));
    fx.api.push_refresh(pair(second.clone()));

    let value = fx.auth.request(Method::GET, "/documents", None).await.unwrap();
    assert_eq!(value, json!({ "ok": true }));
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(*fx.api.send_tokens.lock().unwrap(), vec![first, second]);
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);
}

#[tokio::test]
async fn second_unauthorized_signs_out() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    let mut rx = fx.auth.subscribe();
    fx.api.push_send(Err(ApiError::status(401)));
    fx.api.push_send(Err(ApiError::status(401)));
    fx.api.push_refresh(pair(token_expiring_at(NOW + 2 * HOUR_MS)));

    let err = fx.auth.request(Method::GET, "/documents", None).await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
    assert_eq!(rx.try_recv().unwrap(), AuthEvent::Unauthorized);
}

#[tokio::test]
async fn forbidden_signals_without_signing_out() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    let mut rx = fx.auth.subscribe();
    fx.api.push_send(Err(ApiError::status(403)));

    let err = fx.auth.request(Method::DELETE, "/documents/1", None).await.unwrap_err();
    assert!(err.is_forbidden());
    assert_eq!(rx.try_recv().unwrap(), AuthEvent::Forbidden);
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);
    assert_eq!(fx.api.refreshes(), 0);
}

#[tokio::test]
async fn request_without_session_is_missing_token() {
    let fx = fixture(MockApi::default());
    let err = fx.auth.request(Method::GET, "/documents", None).await.unwrap_err();
    assert!(matches!(err, ApiError::MissingToken));
}

#[tokio::test]
async fn device_sessions_pass_through() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    let sessions = fx.auth.list_sessions().await.unwrap();
    assert_eq!(sessions[0].id, "s-1");
    fx.auth.revoke_session("s-1").await.unwrap();
}

// =============================================================================
// expiry monitoring
// =============================================================================

#[tokio::test]
async fn expiry_check_refreshes_near_expiry() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + 4 * 60_000).await;
    fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

    fx.auth.check_token_expiry().await;
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + HOUR_MS);

    // Comfortably valid now; nothing to do.
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.api.refreshes(), 1);
}

#[tokio::test]
async fn expiry_check_ignores_signed_out_session() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW - 1000);
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.api.refreshes(), 0);
}

#[tokio::test]
async fn idle_timeout_expires_session() {
    let config = AuthConfig { idle_timeout: Some(Duration::from_secs(15 * 60)), ..AuthConfig::default() };
    let fx = fixture_with(MockApi::default(), config);
    fx.sign_in(NOW + 2 * HOUR_MS).await;
    let mut rx = fx.auth.subscribe();

    fx.clock.advance(Duration::from_secs(10 * 60));
    fx.auth.record_activity();
    fx.clock.advance(Duration::from_secs(10 * 60));
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);

    fx.clock.advance(Duration::from_secs(6 * 60));
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.auth.status(), AuthStatus::Expired);
    assert!(!fx.auth.is_monitoring());
    assert!(fx.storage.access_token().unwrap().is_none());
    assert_eq!(rx.try_recv().unwrap(), AuthEvent::SessionTimeout);
}

#[test]
fn monitor_needs_a_runtime() {
    let fx = fixture(MockApi::default());
    fx.auth.set_status(AuthStatus::Authenticated);
    assert!(!fx.auth.is_monitoring());
}

#[tokio::test]
async fn opaque_token_is_refreshed_only_near_its_expiry() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(Ok(LoginResponse {
        access_token: "opaque-a".into(),
        refresh_token: "r-1".into(),
        user: None,
        expires_in: Some(3600),
    }));
    fx.auth.login(&creds(true)).await.unwrap();

    fx.clock.advance(Duration::from_secs(30));
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.api.refreshes(), 0);
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);

    fx.api.push_refresh(Ok(TokenPair { access_token: "opaque-b".into(), refresh_token: None, expires_in: Some(3600) }));
    fx.clock.advance(Duration::from_secs(56 * 60));
    fx.auth.check_token_expiry().await;
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + 30_000 + 56 * 60_000 + HOUR_MS);
}

#[tokio::test(start_paused = true)]
async fn monitor_task_polls_on_its_interval() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + 4 * 60_000).await;
    fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

    // The immediate first tick does not run a check.
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(fx.api.refreshes(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(fx.api.refreshes(), 1);
    assert_eq!(fx.auth.session().unwrap().expires_at, NOW + HOUR_MS);

    fx.auth.logout(false).await;
    assert!(!fx.auth.is_monitoring());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.api.refreshes(), 1);
}

#[tokio::test]
async fn refresh_result_is_not_stored_after_reset() {
    let fx = fixture(MockApi::default());
    fx.seed_tokens(NOW - 1000);
    let epoch = fx.auth.core.reset_epoch.load(Ordering::SeqCst);

    fx.auth.logout(false).await;
    let pair = TokenPair {
        access_token: token_expiring_at(NOW + HOUR_MS),
        refresh_token: Some("r-2".into()),
        expires_in: None,
    };
    let err = fx.auth.apply_refresh(pair, epoch).unwrap_err();

    assert_eq!(err.code.as_deref(), Some("SESSION_EXPIRED"));
    assert!(fx.storage.access_token().unwrap().is_none());
    assert!(fx.storage.refresh_token().unwrap().is_none());
    assert_eq!(fx.auth.check_auth_status().await, AuthStatus::Unauthenticated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logout_racing_refresh_leaves_no_tokens() {
    for _ in 0..20 {
        let fx = fixture(MockApi { refresh_delay: Some(Duration::from_millis(1)), ..MockApi::default() });
        fx.seed_tokens(NOW - 1000);
        fx.api.push_refresh(pair(token_expiring_at(NOW + HOUR_MS)));

        let refresher = fx.auth.clone();
        let task = tokio::spawn(async move { refresher.refresh_access_token().await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        fx.auth.logout(false).await;
        let _ = task.await.unwrap();

        // Whichever finished first, the logout wins.
        assert_eq!(fx.auth.status(), AuthStatus::Unauthenticated);
        assert!(fx.storage.access_token().unwrap().is_none());
        assert!(fx.storage.refresh_token().unwrap().is_none());
    }
}

#[tokio::test]
async fn login_without_any_profile_signs_out() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(Ok(LoginResponse {
        access_token: token_expiring_at(NOW + HOUR_MS),
        refresh_token: "r-1".into(),
        user: None,
        expires_in: None,
    }));
    fx.api
        .user_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::status(500)));

    assert!(fx.auth.login(&creds(true)).await.is_err());
    assert_eq!(fx.auth.status(), AuthStatus::Error);
    assert!(fx.auth.user().is_none());
    assert!(!fx.auth.is_monitoring());
    assert!(fx.storage.access_token().unwrap().is_none());
}

#[tokio::test]
async fn login_with_embedded_profile_survives_failed_fetch() {
    let fx = fixture(MockApi::default());
    fx.api.push_login(login_ok(token_expiring_at(NOW + HOUR_MS)));
    fx.api
        .user_results
        .lock()
        .unwrap()
        .push_back(Err(ApiError::status(500)));

    fx.auth.login(&creds(true)).await.unwrap();
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);
    assert_eq!(fx.auth.user(), Some(user()));
}

#[tokio::test]
async fn locked_login_leaves_live_session_alone() {
    let fx = fixture(MockApi::default());
    fx.sign_in(NOW + HOUR_MS).await;
    fx.storage
        .store_login_attempts(&LoginAttempts {
            count: 5,
            last_attempt_at: Some(NOW),
            locked_until: Some(NOW + 900_000),
        })
        .unwrap();

    let err = fx.auth.login(&creds(true)).await.unwrap_err();
    assert_eq!(err.kind, AuthErrorKind::AccountLocked);
    assert_eq!(fx.api.logins(), 1);
    assert_eq!(fx.auth.status(), AuthStatus::Authenticated);
    assert!(fx.auth.is_monitoring());
    assert!(fx.auth.error().is_none());
    assert!(fx.storage.access_token().unwrap().is_some());
}

#[tokio::test]
async fn route_guard_reads_live_session() {
    use crate::guard::{Access, Requirement, Route, RouteGuard};

    let fx = fixture(MockApi::default());
    let guard = RouteGuard::default();
    let admin = Route::protected("/admin", Requirement::roles(["admin"]));
    let owners = Route::protected("/billing", Requirement::roles(["owner"]));

    assert_eq!(guard.check_session(&admin, &fx.auth), Access::Pending);
    fx.auth.check_auth_status().await;
    assert_eq!(
        guard.check_session(&admin, &fx.auth),
        Access::Redirect { to: guard.login_path().to_owned(), return_to: "/admin".into() }
    );

    fx.sign_in(NOW + HOUR_MS).await;
    assert_eq!(guard.check_session(&admin, &fx.auth), Access::Allow);
    assert_eq!(guard.check_session(&owners, &fx.auth), Access::Forbidden);
}
