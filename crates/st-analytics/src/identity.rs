//! Local user identity: resolution, persistence and the id attached to posts.

use crate::transport::{Transport, IDENTITY_PATH};
use crate::types::{UserIdRequest, UserIdResponse};
use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// Cookie key holding the user id.
pub const USER_ID_COOKIE: &str = "uId";

/// Cookie path.
pub const COOKIE_PATH: &str = "/";

/// Cookie lifetime in days.
pub const COOKIE_EXPIRY_DAYS: u32 = 367 * 2;

/// Supplies the local user id.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up or request the user id. `None` when it cannot be obtained.
    async fn resolve_identity(&self) -> Option<String>;

    /// Remember `user_id` for future runs. Failures are not reported.
    fn persist_identity(&self, user_id: &str);
}

/// A persisted cookie entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub key: String,
    pub value: String,
    pub path: String,
    pub expires_days: u32,
}

impl Cookie {
    /// The user id cookie.
    pub fn user_id(value: impl Into<String>) -> Self {
        Self {
            key: USER_ID_COOKIE.into(),
            value: value.into(),
            path: COOKIE_PATH.into(),
            expires_days: COOKIE_EXPIRY_DAYS,
        }
    }
}

/// Cookie jar the default identity provider reads from and writes to.
pub trait IdentityStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, cookie: Cookie);
}

/// In-process cookie jar.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cookies: Mutex<HashMap<String, Cookie>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the full cookie entry for `key`.
    pub fn cookie(&self, key: &str) -> Option<Cookie> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl IdentityStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cookie(key).map(|c| c.value)
    }

    fn set(&self, cookie: Cookie) {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cookie.key.clone(), cookie);
    }
}

/// Reads the id from the cookie store, asking the collector for a new one if absent.
pub struct CollectorIdentity {
    store: Arc<dyn IdentityStore>,
    transport: Arc<dyn Transport>,
    collection_id: String,
}

impl CollectorIdentity {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        transport: Arc<dyn Transport>,
        collection_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            collection_id: collection_id.into(),
        }
    }

    async fn request_user_id(&self) -> Result<String, Error> {
        let payload = serde_json::to_value(UserIdRequest {
            collection: &self.collection_id,
        })?;
        let response = self
            .transport
            .post(IDENTITY_PATH, payload, &HashMap::new())
            .await?;

        if !response.is_ok() {
            return Err(Error::Status {
                status: response.status,
                body: response.body,
            });
        }

        let parsed: UserIdResponse = serde_json::from_str(&response.body)?;
        if parsed.data.user_id.is_empty() {
            return Err(Error::Identity("collector returned an empty user id".into()));
        }
        Ok(parsed.data.user_id)
    }
}

#[async_trait]
impl IdentityProvider for CollectorIdentity {
    async fn resolve_identity(&self) -> Option<String> {
        if let Some(existing) = self.store.get(USER_ID_COOKIE) {
            debug!("user id found in cookie store");
            return Some(existing);
        }

        match self.request_user_id().await {
            Ok(user_id) => Some(user_id),
            Err(e) => {
                warn!(error = %e, "failed to get user id from collector");
                None
            }
        }
    }

    fn persist_identity(&self, user_id: &str) {
        self.store.set(Cookie::user_id(user_id));
    }
}

/// Host name of this machine, used as identity by headless clients.
pub fn host_identity() -> Option<String> {
    hostname::get().ok()?.into_string().ok()
}

/// The user id attached to outgoing posts.
#[derive(Debug)]
pub struct CurrentUser {
    user_id: RwLock<Option<String>>,
    fallback: String,
}

impl Default for CurrentUser {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentUser {
    /// Create with a fresh process-local fallback id.
    pub fn new() -> Self {
        Self {
            user_id: RwLock::new(None),
            fallback: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Current id, or the fallback when none is known.
    pub fn get(&self) -> String {
        self.known().unwrap_or_else(|| self.fallback.clone())
    }

    /// The resolved or overridden id, if any.
    pub fn known(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the id unconditionally.
    pub fn set(&self, user_id: impl Into<String>) {
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.into());
    }

    /// Set the id unless one is already known. Returns `true` if it was set.
    pub fn set_if_unset(&self, user_id: impl Into<String>) -> bool {
        let mut slot = self.user_id.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(user_id.into());
        true
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}
