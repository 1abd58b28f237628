//! Cross-component auth signals.
//!
//! Observers (route guards, request layers, UI shells) subscribe to a
//! broadcast channel instead of polling session state.

use std::fmt;

use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEvent {
    /// A request was rejected with 401 and could not be recovered by refresh.
    Unauthorized,
    /// A request was rejected with 403.
    Forbidden,
    /// The session was expired by the idle timeout.
    SessionTimeout,
    /// The refresh token was rejected.
    TokenInvalid,
}

impl AuthEvent {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unauthorized => "auth:unauthorized",
            Self::Forbidden => "auth:forbidden",
            Self::SessionTimeout => "auth:session-timeout",
            Self::TokenInvalid => "auth:token_invalid",
        }
    }
}

impl fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuthEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: AuthEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        debug!(event = %event, receivers, "auth event emitted");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
