//! Visitor sessions and CSRF tokens.
//!
//! A visitor session is created by a successful portal login and identified
//! by an opaque random id in a cookie. It owns the visitor's Proxmox auth (if
//! they signed in with Proxmox credentials) and their console registry.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use vmportal_common::{Secret, SessionConfig};

use crate::proxmox::ProxmoxAuth;
use crate::registry::ConsoleRegistry;

/// Header carrying the CSRF token on state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

pub struct VisitorSession {
    pub id: String,
    pub user: String,
    pub csrf_token: Secret,
    pub consoles: ConsoleRegistry,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    proxmox_auth: Mutex<Option<ProxmoxAuth>>,
}

impl VisitorSession {
    /// Stored per-user Proxmox auth, if any.
    pub fn proxmox_auth(&self) -> Option<ProxmoxAuth> {
        self.proxmox_auth.lock().clone()
    }

    pub fn set_proxmox_auth(&self, auth: Option<ProxmoxAuth>) {
        *self.proxmox_auth.lock() = auth;
    }

    pub fn verify_csrf(&self, presented: Option<&str>) -> bool {
        match presented {
            Some(token) => constant_time_eq(self.csrf_token.expose(), token),
            None => false,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<VisitorSession>>>,
    cfg: SessionConfig,
}

impl SessionStore {
    pub fn new(cfg: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            cfg,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cfg.cookie_name
    }

    pub fn create(&self, user: &str, proxmox_auth: Option<ProxmoxAuth>) -> Arc<VisitorSession> {
        let now = Utc::now();
        let session = Arc::new(VisitorSession {
            id: random_token(),
            user: user.to_string(),
            csrf_token: Secret::new(random_token()),
            consoles: ConsoleRegistry::new(),
            created_at: now,
            expires_at: now + Duration::seconds(self.cfg.ttl_secs as i64),
            proxmox_auth: Mutex::new(proxmox_auth),
        });

        let mut sessions = self.sessions.write();
        sessions.retain(|_, s| s.is_valid_at(now));
        sessions.insert(session.id.clone(), session.clone());
        debug!(user = %user, "Visitor session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<VisitorSession>> {
        let now = Utc::now();
        let session = self.sessions.read().get(id).cloned()?;
        if session.is_valid_at(now) {
            Some(session)
        } else {
            self.sessions.write().remove(id);
            None
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Resolve the visitor behind the session cookie.
    pub fn from_jar(&self, jar: &CookieJar) -> Option<Arc<VisitorSession>> {
        jar.get(&self.cfg.cookie_name).and_then(|c| self.get(c.value()))
    }

    pub fn cookie_for(&self, session: &VisitorSession) -> Cookie<'static> {
        Cookie::build((self.cfg.cookie_name.clone(), session.id.clone()))
            .path("/")
            .http_only(true)
            .secure(self.cfg.secure_cookie)
            .same_site(SameSite::Strict)
            .build()
    }

    pub fn removal_cookie(&self) -> Cookie<'static> {
        Cookie::build((self.cfg.cookie_name.clone(), "")).path("/").build()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn random_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut v: u8 = 0;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        v |= x ^ y;
    }
    v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64) -> SessionStore {
        SessionStore::new(SessionConfig {
            ttl_secs,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn test_create_and_get() {
        let store = store(60);
        let session = store.create("alice@pve", None);
        let found = store.get(&session.id).unwrap();
        assert_eq!(found.user, "alice@pve");
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn test_expired_session_is_dropped() {
        let store = store(0);
        let session = store.create("alice@pve", None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(store.get(&session.id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_csrf_verification() {
        let store = store(60);
        let session = store.create("alice@pve", None);
        let token = session.csrf_token.expose().to_string();
        assert!(session.verify_csrf(Some(&token)));
        assert!(!session.verify_csrf(Some("nope")));
        assert!(!session.verify_csrf(None));
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = store(60);
        let a = store.create("a@pve", None);
        let b = store.create("b@pve", None);
        assert_ne!(a.id, b.id);
        assert_ne!(a.csrf_token, b.csrf_token);
    }

    #[test]
    fn test_cookie_attributes() {
        let store = store(60);
        let session = store.create("alice@pve", None);
        let cookie = store.cookie_for(&session);
        assert_eq!(cookie.name(), "vmportal_session");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
    }

    #[test]
    fn test_from_jar() {
        let store = store(60);
        let session = store.create("alice@pve", None);
        let jar = CookieJar::new().add(store.cookie_for(&session));
        assert_eq!(store.from_jar(&jar).unwrap().id, session.id);
        assert!(store.from_jar(&CookieJar::new()).is_none());
    }
}
