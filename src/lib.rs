//! Client-side authentication session management.
//!
//! SYSTEM CONTEXT
//! ==============
//! An application talks to a token-issuing auth API. This crate owns the
//! client half of that conversation: storing tokens in a durable or
//! session-scoped area, checking their expiry, refreshing them silently, and
//! gating access by role or permission.
//!
//! ```text
//! AuthSession ──► AuthApi (HttpAuthApi / mocks)
//!      │
//!      ├──► TokenStorage ──► KeyValueStore (FileStore, MemoryStore)
//!      ├──► EventBus ──► subscribers
//!      └──► monitor task (expiry + idle timeout)
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod lockout;
pub mod models;
pub mod session;
pub mod storage;
pub mod token;

pub use api::{ApiRequest, AuthApi, HttpAuthApi, LoginResponse, TokenPair};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthConfig;
pub use error::{ApiError, AuthError, AuthErrorKind};
pub use events::{AuthEvent, EventBus};
pub use guard::{Access, Requirement, Route, RouteGuard};
pub use models::{AuthUser, CachedUser, Credentials, DeviceSession, Session};
pub use session::{AuthSession, AuthStatus};
pub use storage::{FileStore, KeyValueStore, MemoryStore, TokenStorage};
