// ABOUTME: Authentication seam consumed by the connection manager
// The manager never opens a shared channel for an unauthenticated user

use std::sync::RwLock;

/// Read-only view of the application's authentication state. Session-cookie
/// management itself lives outside this crate.
pub trait AuthGate: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Token sent in the client auth frame after a socket opens, if any.
    fn token(&self) -> Option<String>;
}

/// Gate backed by a mutable in-process state, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticAuthGate {
    state: RwLock<AuthState>,
}

#[derive(Debug, Default)]
struct AuthState {
    authenticated: bool,
    token: Option<String>,
}

impl StaticAuthGate {
    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(AuthState {
                authenticated: true,
                token: Some(token.into()),
            }),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set_authenticated(&self, token: Option<String>) {
        let mut state = self.state.write().expect("auth state lock poisoned");
        state.authenticated = token.is_some();
        state.token = token;
    }
}

impl AuthGate for StaticAuthGate {
    fn is_authenticated(&self) -> bool {
        self.state.read().expect("auth state lock poisoned").authenticated
    }

    fn token(&self) -> Option<String> {
        self.state.read().expect("auth state lock poisoned").token.clone()
    }
}
