//! Identity of the operator using the terminal

use parking_lot::RwLock;
use std::fmt;

/// Actor recorded when nobody is signed in
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub email: String,
    /// Bearer token for the remote API
    pub token: Option<String>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("email", &self.email)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Supplies the current identity, if any
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;

    /// Actor string for the audit trail
    fn actor(&self) -> String {
        self.current_identity()
            .map(|identity| identity.email)
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
    }
}

/// In-process sign-in state
#[derive(Debug, Default)]
pub struct SessionIdentity {
    current: RwLock<Option<Identity>>,
}

impl SessionIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(email: impl Into<String>, token: Option<String>) -> Self {
        let session = Self::new();
        session.sign_in(email, token);
        session
    }

    pub fn sign_in(&self, email: impl Into<String>, token: Option<String>) {
        *self.current.write() = Some(Identity {
            email: email.into(),
            token,
        });
    }

    pub fn sign_out(&self) {
        *self.current.write() = None;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.current.read().clone()
    }
}
