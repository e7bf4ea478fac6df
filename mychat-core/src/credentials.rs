//! Credential storage contract
//!
//! The session layer only needs get/set/clear on three values:
//! - Access token: short-lived, attached to every request and socket connect
//! - Refresh token: long-lived, exchanged for a new pair when the access token expires
//! - User id: the authenticated principal, supplied by an out-of-band flow
//!
//! Where and how these are persisted is up to the embedding application.
//! [`MemoryCredentialStore`] is the in-process implementation used by default.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Pair of access and refresh tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Get/set/clear contract for session credentials.
///
/// Empty strings are never returned; an unset value is `None`.
/// `set_tokens` must replace both tokens in one step so that no reader can
/// observe a new access token paired with an old refresh token.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_tokens(&self, tokens: TokenPair);

    fn user_id(&self) -> Option<String>;
    fn set_user_id(&self, user_id: String);

    /// Drop tokens and user id together (logout).
    fn clear(&self);
}

#[derive(Debug, Default)]
struct Stored {
    access_token: String,
    refresh_token: String,
    user_id: String,
}

/// In-memory credential store
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Stored>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with an existing token pair
    pub fn with_tokens(tokens: TokenPair) -> Self {
        let store = Self::new();
        store.set_tokens(tokens);
        store
    }

    // A panic while holding the lock cannot leave `Stored` half-written,
    // so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Stored> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Stored> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        non_empty(&self.read().access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        non_empty(&self.read().refresh_token)
    }

    fn set_tokens(&self, tokens: TokenPair) {
        let mut stored = self.write();
        stored.access_token = tokens.access_token;
        stored.refresh_token = tokens.refresh_token;
    }

    fn user_id(&self) -> Option<String> {
        non_empty(&self.read().user_id)
    }

    fn set_user_id(&self, user_id: String) {
        self.write().user_id = user_id;
    }

    fn clear(&self) {
        *self.write() = Stored::default();
    }
}
