//! Session gate consumed by the event channel
//!
//! The channel never authenticates anyone. It only asks whether a session is
//! active, reads the token to address the event source, and watches for
//! login/logout transitions.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Security,
    Manager,
}

/// Console user the session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub role: Role,
    pub tenant_id: String,
}

/// An authenticated session: the user plus the opaque access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: User,
    pub token: String,
}

/// Read-only view of the authentication state
pub trait SessionGate: Send + Sync + 'static {
    /// Current session, if one is active
    fn current(&self) -> Option<Session>;

    fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// Change notifications. The receiver starts at the current value.
    fn watch(&self) -> watch::Receiver<Option<Session>>;
}

/// In-memory session store owning the login/logout transitions
pub struct SessionStore {
    state: watch::Sender<Option<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    /// Record a successful login.
    ///
    /// A session only counts as active when both the user and a non-empty
    /// token are present, so an empty token leaves the store logged out.
    pub fn set_auth(&self, user: User, token: impl Into<String>) {
        let token = token.into();
        if token.is_empty() {
            tracing::warn!(user_id = %user.id, "Ignoring login without a token");
            self.logout();
            return;
        }

        tracing::info!(user_id = %user.id, tenant_id = %user.tenant_id, "Session started");
        self.state.send_replace(Some(Session { user, token }));
    }

    pub fn logout(&self) {
        if let Some(previous) = self.state.send_replace(None) {
            tracing::info!(user_id = %previous.user.id, "Session ended");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_some()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate for SessionStore {
    fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
pub(crate) fn demo_user() -> User {
    User {
        id: "2".to_string(),
        email: "security@demo.com".to_string(),
        full_name: "Security Officer".to_string(),
        role: Role::Security,
        tenant_id: "demo-tenant".to_string(),
    }
}
