//! Keycloak client adapter.
//!
//! [`Keycloak::middleware`] attaches the user's [`Grant`] to each request
//! (from an `Authorization: Bearer` header or the session), refreshes
//! expired session grants, completes the login callback and handles logout.
//! [`Keycloak::protect`] builds a [`ProtectHandler`] that gates a route on a
//! [`Guard`]. Denials go through [`KeycloakHooks::access_denied`].

pub mod config;
mod grant;
pub mod hooks;
mod middleware;
mod protect;
pub mod token;
pub mod verifier;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    http::{HeaderMap, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
};
use tracing::info;

pub use config::KeycloakConfig;
pub use grant::GrantManager;
pub use hooks::{DefaultHooks, KeycloakHooks, access_denied_response};
pub use protect::{Guard, ProtectHandler};
pub use token::{Grant, RawGrant, Token};
pub use verifier::{TokenVerifier, VerifyError};

use crate::Result;
use crate::session::SessionStore;

/// Session key holding the user's [`RawGrant`]
pub const GRANT_SESSION_KEY: &str = "keycloak-token";
/// Session key holding the `redirect_uri` sent with the last login redirect
const REDIRECT_URI_SESSION_KEY: &str = "auth_redirect_uri";
/// Session key holding the `state` sent with the last login redirect
const STATE_SESSION_KEY: &str = "keycloak-state";

/// Keycloak client adapter for one realm and client.
pub struct Keycloak {
    config: KeycloakConfig,
    store: Arc<dyn SessionStore>,
    grants: GrantManager,
    hooks: Arc<dyn KeycloakHooks>,
    span: tracing::Span,
}

impl Keycloak {
    /// Build the adapter over the shared session `store`.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Config`] if `config` is incomplete or its realm key is
    /// invalid; [`crate::Error::Http`] if the HTTP client cannot be built.
    pub fn new(store: Arc<dyn SessionStore>, config: KeycloakConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .https_only(config.https_only())
            .timeout(Duration::from_secs(10))
            .build()?;
        let grants = GrantManager::new(&config, http)?;

        info!(
            realm = %config.realm,
            client = %config.resource,
            bearer_only = config.bearer_only,
            "Keycloak adapter ready"
        );

        Ok(Self {
            config,
            store,
            grants,
            hooks: Arc::new(DefaultHooks),
            span: tracing::Span::none(),
        })
    }

    /// Replace the callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl KeycloakHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Emit the adapter's per-request logs inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Adapter configuration
    #[must_use]
    pub fn config(&self) -> &KeycloakConfig {
        &self.config
    }

    /// Token endpoint client
    #[must_use]
    pub fn grants(&self) -> &GrantManager {
        &self.grants
    }

    /// Wrap `router` with grant attachment, login callback and logout.
    ///
    /// Requires the session middleware to run first for session-based
    /// logins; bearer tokens work without it.
    pub fn middleware<S>(self: &Arc<Self>, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(
            Arc::clone(self),
            middleware::keycloak_middleware,
        ))
    }

    /// Gate a route on `guard`.
    #[must_use]
    pub fn protect(self: &Arc<Self>, guard: Guard) -> ProtectHandler {
        ProtectHandler::new(Arc::clone(self), guard)
    }

    /// Run the `access_denied` hook.
    #[must_use]
    pub fn access_denied(&self, request: &Parts) -> Response {
        self.hooks.access_denied(request)
    }
}

/// `<scheme>://<host>` the client used to reach us.
fn base_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or("http", str::trim);
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Absolute URL of the current request.
fn current_url(request: &Parts) -> String {
    let path_and_query = request
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    format!("{}{path_and_query}", base_url(&request.headers))
}

/// Query string as ordered pairs.
fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// `url` with the given query parameters removed.
fn strip_query_params(url: &str, remove: &[&str]) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !remove.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}

/// `302 Found` to `location`
fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};

    #[test]
    fn current_url_uses_forwarded_headers() {
        let request = Request::builder()
            .uri("/api/items?x=1")
            .header(header::HOST, "internal:8080")
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", "gw.example.com")
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0;

        assert_eq!(current_url(&request), "https://gw.example.com/api/items?x=1");
    }

    #[test]
    fn current_url_defaults_to_http_and_host() {
        let request = Request::builder()
            .uri("/a")
            .header(header::HOST, "localhost:8080")
            .body(Body::empty())
            .unwrap()
            .into_parts()
            .0;

        assert_eq!(current_url(&request), "http://localhost:8080/a");
    }

    #[test]
    fn strips_callback_parameters() {
        let url = "http://gw/a?x=1&code=abc&state=s&session_state=t&auth_callback=1";
        assert_eq!(
            strip_query_params(url, &["code", "state", "session_state", "auth_callback"]),
            "http://gw/a?x=1"
        );
        assert_eq!(strip_query_params("http://gw/a?code=abc", &["code"]), "http://gw/a");
    }

    #[test]
    fn redirect_is_302_with_location() {
        let response = redirect("http://kc/login");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "http://kc/login");
    }
}
