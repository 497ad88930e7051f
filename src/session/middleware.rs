//! Session middleware and cookie signing.
//!
//! Cookie value format is `s:<sid>.<signature>`, URL-encoded, where the
//! signature is HMAC-SHA256 of the sid keyed by the secret, in standard
//! base64 without padding. Cookies signed by express-session with the same
//! secret are accepted. Unsigned or tampered cookies are ignored and a fresh
//! session begins.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, header},
    middleware::{self, Next},
    response::Response,
};
use axum_extra::extract::cookie::{self, Cookie, CookieJar};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use hmac::{KeyInit, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::{DEFAULT_TTL_MS, Session, SessionData, SessionSettings, SessionStore};
use crate::{Error, Result};

/// Session middleware state: settings, secrets and the backing store.
pub struct SessionLayer {
    settings: SessionSettings,
    secrets: Vec<String>,
    store: Arc<dyn SessionStore>,
}

impl SessionLayer {
    /// Create the layer.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when no non-empty secret is configured.
    pub fn new(settings: SessionSettings, store: Arc<dyn SessionStore>) -> Result<Self> {
        let secrets = settings.secret.keys();
        if secrets.is_empty() {
            return Err(Error::Config("session secret must not be empty".to_string()));
        }
        Ok(Self {
            settings,
            secrets,
            store,
        })
    }

    /// Settings in effect
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Wrap `router` with the session middleware.
    pub fn apply<S>(self: Arc<Self>, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(self, session_middleware))
    }

    /// Sign a session id: `s:<sid>.<signature>`
    #[must_use]
    pub fn sign(&self, sid: &str) -> String {
        // secrets is never empty after new()
        let secret = self.secrets.first().map_or("", String::as_str);
        format!("s:{sid}.{}", signature(secret, sid))
    }

    /// Verify a signed value and return the session id.
    #[must_use]
    pub fn unsign(&self, value: &str) -> Option<String> {
        let (sid, provided) = value.strip_prefix("s:")?.rsplit_once('.')?;
        let valid = self.secrets.iter().any(|secret| {
            let expected = signature(secret, sid);
            bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
        });
        valid.then(|| sid.to_string())
    }

    /// Store lifetime: `cookie.maxAge`, else `ttl`, else one day.
    fn ttl(&self) -> Duration {
        Duration::from_millis(
            self.settings
                .cookie
                .max_age
                .or(self.settings.ttl)
                .unwrap_or(DEFAULT_TTL_MS),
        )
    }

    /// Session id from the request's cookie, if present and correctly signed.
    fn session_id(&self, headers: &HeaderMap) -> Option<String> {
        let jar = CookieJar::from_headers(headers);
        let sid = self.unsign(jar.get(&self.settings.name)?.value());
        if sid.is_none() {
            debug!(cookie = %self.settings.name, "Ignoring session cookie with bad signature");
        }
        sid
    }

    fn session_cookie(&self, sid: &str) -> Cookie<'static> {
        let settings = &self.settings.cookie;
        let mut cookie = Cookie::build((self.settings.name.clone(), self.sign(sid)))
            .path(settings.path.clone())
            .http_only(settings.http_only)
            .secure(settings.secure);

        if let Some(domain) = &settings.domain {
            cookie = cookie.domain(domain.clone());
        }
        if let Some(same_site) = settings.same_site {
            cookie = cookie.same_site(same_site.into());
        }
        let expires = settings
            .max_age
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(|ms| {
                time::OffsetDateTime::now_utc().checked_add(time::Duration::milliseconds(ms))
            });
        if let Some(expires) = expires {
            cookie = cookie.expires(expires);
        }

        cookie.build()
    }

    fn set_cookie(&self, sid: &str) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.session_cookie(sid).encoded().to_string()).ok()
    }

    /// Load the request's session or start a new one.
    async fn load(&self, headers: &HeaderMap) -> Session {
        if let Some(sid) = self.session_id(headers) {
            match self.store.get(&sid).await {
                Ok(Some(data)) => return Session::new(sid, data, false),
                Ok(None) => debug!("Session not found in store, starting a new one"),
                Err(e) => warn!(error = %e, "Failed to load session"),
            }
        }
        Session::new(generate_sid(), SessionData::new(), true)
    }

    /// Persist the session after the response and attach the cookie.
    async fn commit(&self, session: &Session, response: &mut Response) {
        let snapshot = session.snapshot();
        let ttl = self.ttl();

        if snapshot.destroyed {
            if let Err(e) = self.store.destroy(&snapshot.id).await {
                warn!(error = %e, "Failed to destroy session");
            }
            return;
        }

        let save = snapshot.modified
            || (self.settings.resave && !snapshot.is_new)
            || (self.settings.save_uninitialized && snapshot.is_new);

        let stored = if save {
            self.store.set(&snapshot.id, snapshot.data, ttl).await
        } else if snapshot.is_new {
            Ok(())
        } else {
            self.store.touch(&snapshot.id, ttl).await
        };
        if let Err(e) = stored {
            warn!(error = %e, "Failed to save session");
            return;
        }

        let send_cookie = (snapshot.is_new && save) || (!snapshot.is_new && self.settings.rolling);
        if send_cookie {
            if let Some(value) = self.set_cookie(&snapshot.id) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
    }
}

/// Session middleware
pub async fn session_middleware(
    State(layer): State<Arc<SessionLayer>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let session = layer.load(request.headers()).await;
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;
    layer.commit(&session, &mut response).await;
    response
}

fn signature(secret: &str, sid: &str) -> String {
    let Ok(mut mac) = hmac::Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        // HMAC accepts keys of any length
        return String::new();
    };
    mac.update(sid.as_bytes());
    STANDARD_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Random 192-bit session id
fn generate_sid() -> String {
    let random_bytes: [u8; 24] = rand::random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

impl From<super::SameSite> for cookie::SameSite {
    fn from(same_site: super::SameSite) -> Self {
        match same_site {
            super::SameSite::Strict => Self::Strict,
            super::SameSite::Lax => Self::Lax,
            super::SameSite::None => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{InMemorySessionStore, Secret};

    fn layer(secret: Secret) -> SessionLayer {
        let settings = SessionSettings {
            secret,
            ..SessionSettings::default()
        };
        SessionLayer::new(settings, Arc::new(InMemorySessionStore::new())).unwrap()
    }

    #[test]
    fn signature_matches_express_cookie_signature() {
        // GIVEN: cookie-signature's documented vector: sign('hello', 'tobiiscool')
        // THEN: the same unpadded base64 digest is produced
        assert_eq!(
            signature("tobiiscool", "hello"),
            "DGDUkGlIkCzPz+C0B064FNgHdEjox7ch8tOBGslZ5QI"
        );
    }

    #[test]
    fn sign_then_unsign_yields_sid() {
        let layer = layer(Secret::One("kc_secret".into()));
        let signed = layer.sign("abc123");
        assert!(signed.starts_with("s:abc123."));
        assert_eq!(layer.unsign(&signed).as_deref(), Some("abc123"));
    }

    #[test]
    fn tampered_or_unsigned_values_are_rejected() {
        let layer = layer(Secret::One("kc_secret".into()));
        let signed = layer.sign("abc123");

        assert!(layer.unsign(&signed.replace("abc123", "abc124")).is_none());
        assert!(layer.unsign("abc123").is_none());
        assert!(layer.unsign("s:abc123").is_none());
    }

    #[test]
    fn rotated_secrets_still_verify() {
        // GIVEN: a cookie signed under the old secret
        let old = layer(Secret::One("old".into()));
        let signed = old.sign("sid-1");

        // WHEN: the new secret is prepended
        let rotated = layer(Secret::Many(vec!["new".into(), "old".into()]));

        // THEN: the old cookie verifies, new cookies use the new secret
        assert_eq!(rotated.unsign(&signed).as_deref(), Some("sid-1"));
        assert_ne!(rotated.sign("sid-1"), signed);
    }

    #[test]
    fn empty_secret_is_rejected() {
        let result = SessionLayer::new(
            SessionSettings::default(),
            Arc::new(InMemorySessionStore::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn reads_signed_cookie_among_others() {
        let layer = layer(Secret::One("kc_secret".into()));
        let encoded = layer.set_cookie("abc").unwrap();
        let pair = encoded.to_str().unwrap().split(';').next().unwrap().to_string();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {pair}; other=1")).unwrap(),
        );
        assert_eq!(layer.session_id(&headers).as_deref(), Some("abc"));

        let mut forged = HeaderMap::new();
        forged.insert(header::COOKIE, HeaderValue::from_static("connect.sid=s%3Aabc.forged"));
        assert!(layer.session_id(&forged).is_none());
        assert!(layer.session_id(&HeaderMap::new()).is_none());
    }

    #[test]
    fn set_cookie_carries_configured_attributes() {
        let mut settings = SessionSettings {
            secret: Secret::One("kc_secret".into()),
            ..SessionSettings::default()
        };
        settings.cookie.secure = true;
        settings.cookie.max_age = Some(60_000);
        settings.cookie.same_site = Some(crate::session::SameSite::Strict);
        let layer = SessionLayer::new(settings, Arc::new(InMemorySessionStore::new())).unwrap();

        let header = layer.set_cookie("abc").unwrap();
        let header = header.to_str().unwrap();
        assert!(header.starts_with("connect.sid=s%3Aabc."));

        let parsed = Cookie::parse_encoded(header.to_string()).unwrap();
        assert_eq!(parsed.value(), layer.sign("abc"));
        assert_eq!(parsed.path(), Some("/"));
        assert_eq!(parsed.http_only(), Some(true));
        assert_eq!(parsed.secure(), Some(true));
        assert_eq!(parsed.same_site(), Some(cookie::SameSite::Strict));
        assert!(parsed.expires_datetime().is_some());
    }

    #[test]
    fn ttl_prefers_cookie_max_age() {
        let mut settings = SessionSettings {
            secret: Secret::One("s".into()),
            ttl: Some(5_000),
            ..SessionSettings::default()
        };
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let layer = SessionLayer::new(settings.clone(), Arc::clone(&store)).unwrap();
        assert_eq!(layer.ttl(), Duration::from_secs(5));

        settings.cookie.max_age = Some(1_000);
        let layer = SessionLayer::new(settings, store).unwrap();
        assert_eq!(layer.ttl(), Duration::from_secs(1));

        let default = layer_default_ttl();
        assert_eq!(default, Duration::from_secs(86_400));
    }

    fn layer_default_ttl() -> Duration {
        layer(Secret::One("s".into())).ttl()
    }
}
