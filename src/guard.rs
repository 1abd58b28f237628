//! Role and permission checks, and the route gate built on them.
//!
//! Empty requirement lists always pass. With `require_all` every entry must
//! be held; otherwise one match is enough. No user fails any non-empty
//! requirement.

use crate::models::AuthUser;
use crate::session::{AuthSession, AuthStatus};

pub const DEFAULT_LOGIN_PATH: &str = "/login";

fn holds<S: AsRef<str>>(held: &[String], wanted: &[S], require_all: bool) -> bool {
    if wanted.is_empty() {
        return true;
    }
    let has = |w: &S| held.iter().any(|h| h == w.as_ref());
    if require_all {
        wanted.iter().all(has)
    } else {
        wanted.iter().any(has)
    }
}

#[must_use]
pub fn has_role<S: AsRef<str>>(user: Option<&AuthUser>, roles: &[S], require_all: bool) -> bool {
    match user {
        Some(user) => holds(&user.roles, roles, require_all),
        None => roles.is_empty(),
    }
}

#[must_use]
pub fn has_any_role<S: AsRef<str>>(user: Option<&AuthUser>, roles: &[S]) -> bool {
    has_role(user, roles, false)
}

#[must_use]
pub fn has_permission<S: AsRef<str>>(user: Option<&AuthUser>, permissions: &[S], require_all: bool) -> bool {
    match user {
        Some(user) => holds(&user.permissions, permissions, require_all),
        None => permissions.is_empty(),
    }
}

#[must_use]
pub fn has_any_permission<S: AsRef<str>>(user: Option<&AuthUser>, permissions: &[S]) -> bool {
    has_permission(user, permissions, false)
}

// =============================================================================
// REQUIREMENTS
// =============================================================================

/// What a user must hold to pass a gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirement {
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    /// Hold every listed role and permission rather than one of each.
    pub require_all: bool,
}

impl Requirement {
    #[must_use]
    pub fn roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { roles: roles.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    #[must_use]
    pub fn permissions<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { permissions: permissions.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    #[must_use]
    pub fn all(mut self) -> Self {
        self.require_all = true;
        self
    }

    #[must_use]
    pub fn is_satisfied_by(&self, user: Option<&AuthUser>) -> bool {
        has_role(user, &self.roles, self.require_all) && has_permission(user, &self.permissions, self.require_all)
    }
}

// =============================================================================
// ROUTES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    /// Reachable without signing in.
    pub public: bool,
    pub requirement: Requirement,
}

impl Route {
    #[must_use]
    pub fn public(path: impl Into<String>) -> Self {
        Self { path: path.into(), public: true, requirement: Requirement::default() }
    }

    #[must_use]
    pub fn protected(path: impl Into<String>, requirement: Requirement) -> Self {
        Self { path: path.into(), public: false, requirement }
    }
}

/// Outcome of a route check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allow,
    /// Auth state is still resolving; show a fallback.
    Pending,
    /// Send the user to sign in, then back to `return_to`.
    Redirect { to: String, return_to: String },
    Forbidden,
}

#[derive(Debug, Clone)]
pub struct RouteGuard {
    login_path: String,
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self::new(DEFAULT_LOGIN_PATH)
    }
}

impl RouteGuard {
    #[must_use]
    pub fn new(login_path: impl Into<String>) -> Self {
        Self { login_path: login_path.into() }
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn check(&self, route: &Route, status: AuthStatus, user: Option<&AuthUser>) -> Access {
        if route.public {
            return Access::Allow;
        }
        match status {
            AuthStatus::Idle | AuthStatus::Loading => Access::Pending,
            AuthStatus::Authenticated => match user {
                // Profile still loading. A session whose profile cannot be
                // loaded is reset, so this does not last.
                None => Access::Pending,
                Some(_) if route.requirement.is_satisfied_by(user) => Access::Allow,
                Some(_) => Access::Forbidden,
            },
            AuthStatus::Unauthenticated | AuthStatus::Error | AuthStatus::Expired => Access::Redirect {
                to: self.login_path.clone(),
                return_to: route.path.clone(),
            },
        }
    }

    /// [`RouteGuard::check`] against a live session.
    #[must_use]
    pub fn check_session(&self, route: &Route, session: &AuthSession) -> Access {
        let user = session.user();
        self.check(route, session.status(), user.as_ref())
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
