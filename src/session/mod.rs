//! Cookie-backed sessions.
//!
//! The session middleware resolves the `connect.sid` cookie (signed with the
//! configured secret), loads the session from the [`SessionStore`] and makes
//! a [`Session`] handle available to everything downstream. After the
//! response is produced the session is saved, touched or destroyed.

mod middleware;
pub mod store;

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use middleware::SessionLayer;
pub use store::{InMemorySessionStore, SessionData, SessionStore, spawn_reaper};

use crate::{Error, Result};

/// Default session lifetime when neither `cookie.maxAge` nor `ttl` is set.
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Session options, named as in express-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSettings {
    /// Signing secret. A list rotates secrets: the first signs, all verify.
    pub secret: Secret,
    /// Cookie name
    pub name: String,
    /// Save the session on every request even when unmodified
    pub resave: bool,
    /// Save new sessions that were never modified
    pub save_uninitialized: bool,
    /// Re-send the cookie on every response
    pub rolling: bool,
    /// Cookie attributes
    pub cookie: CookieSettings,
    /// Store TTL in milliseconds when `cookie.maxAge` is unset
    pub ttl: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            secret: Secret::One(String::new()),
            name: "connect.sid".to_string(),
            resave: false,
            save_uninitialized: false,
            rolling: false,
            cookie: CookieSettings::default(),
            ttl: None,
        }
    }
}

/// One secret or a rotation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    /// Single secret
    One(String),
    /// Newest first
    Many(Vec<String>),
}

impl Secret {
    /// Non-empty secrets in priority order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(list) => list.clone(),
        }
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect()
    }
}

/// Session cookie attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CookieSettings {
    /// `Path`
    pub path: String,
    /// `Domain`
    pub domain: Option<String>,
    /// `HttpOnly`
    pub http_only: bool,
    /// `Secure`
    pub secure: bool,
    /// Lifetime in milliseconds; browser-session cookie when unset
    pub max_age: Option<u64>,
    /// `SameSite`
    pub same_site: Option<SameSite>,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            http_only: true,
            secure: false,
            max_age: None,
            same_site: None,
        }
    }
}

/// `SameSite` cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// `Strict`
    Strict,
    /// `Lax`
    Lax,
    /// `None`
    None,
}

#[derive(Debug)]
struct SessionState {
    id: String,
    data: SessionData,
    is_new: bool,
    modified: bool,
    destroyed: bool,
}

/// Handle to the current request's session. Clones share state.
#[derive(Debug, Clone)]
pub struct Session {
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub(crate) fn new(id: String, data: SessionData, is_new: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                id,
                data,
                is_new,
                modified: false,
                destroyed: false,
            })),
        }
    }

    /// Session id (the unsigned cookie value)
    #[must_use]
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    /// Whether the session was created by this request
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state.lock().is_new
    }

    /// Raw attribute value
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().data.get(key).cloned()
    }

    /// Typed attribute value; `None` if absent or of another shape.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_value(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Set an attribute.
    pub fn insert(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut state = self.state.lock();
        state.data.insert(key.into(), value);
        state.modified = true;
        Ok(())
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let mut state = self.state.lock();
        let previous = state.data.remove(key);
        if previous.is_some() {
            state.modified = true;
        }
        previous
    }

    /// Destroy the session. The store entry is removed after the response.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.data.clear();
        state.destroyed = true;
    }

    /// Whether [`destroy`](Self::destroy) was called
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            id: state.id.clone(),
            data: state.data.clone(),
            is_new: state.is_new,
            modified: state.modified,
            destroyed: state.destroyed,
        }
    }
}

struct Snapshot {
    id: String,
    data: SessionData,
    is_new: bool,
    modified: bool,
    destroyed: bool,
}

impl<S: Send + Sync> FromRequestParts<S> for Session {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<Self>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Session middleware is not installed",
        ))
    }
}

impl SessionSettings {
    /// Deserialize from a merged settings object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Config(format!("session settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_use_express_names_and_defaults() {
        let settings = SessionSettings::from_json(json!({
            "secret": "s3",
            "saveUninitialized": true,
            "cookie": { "maxAge": 60000, "sameSite": "lax", "secure": true }
        }))
        .unwrap();

        assert_eq!(settings.secret.keys(), vec!["s3".to_string()]);
        assert_eq!(settings.name, "connect.sid");
        assert!(settings.save_uninitialized);
        assert!(!settings.resave);
        assert_eq!(settings.cookie.max_age, Some(60_000));
        assert_eq!(settings.cookie.same_site, Some(SameSite::Lax));
        assert!(settings.cookie.http_only);
        assert_eq!(settings.cookie.path, "/");
    }

    #[test]
    fn secret_list_keeps_order_and_drops_blanks() {
        let settings =
            SessionSettings::from_json(json!({ "secret": ["new", "", "old"] })).unwrap();
        assert_eq!(settings.secret.keys(), vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn malformed_settings_are_config_errors() {
        let err = SessionSettings::from_json(json!({ "resave": "yes" })).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn handle_tracks_modification_and_destroy() {
        let session = Session::new("sid".into(), SessionData::new(), true);
        assert!(!session.snapshot().modified);

        session.insert("n", 5).unwrap();
        assert_eq!(session.get::<u32>("n"), Some(5));
        assert!(session.snapshot().modified);

        session.destroy();
        assert!(session.is_destroyed());
        assert!(session.get_value("n").is_none());
    }

    #[test]
    fn removing_missing_key_is_not_a_modification() {
        let session = Session::new("sid".into(), SessionData::new(), false);
        assert!(session.remove("missing").is_none());
        assert!(!session.snapshot().modified);
    }
}
