//! Route protection.

use std::fmt;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, request::Parts},
    middleware::{self, Next},
    response::Response,
};
use tracing::{debug, warn};

use super::{
    Grant, Keycloak, REDIRECT_URI_SESSION_KEY, STATE_SESSION_KEY, Token, current_url, redirect,
};
use crate::session::Session;

/// Custom authorization predicate
pub type GuardFn = dyn Fn(&Token, &Parts) -> bool + Send + Sync;

/// What an authenticated user must satisfy.
#[derive(Clone)]
pub enum Guard {
    /// Any authenticated user
    Authenticated,
    /// [`Token::has_role`] with this name
    Role(String),
    /// Arbitrary predicate over the access token and the request
    Custom(Arc<GuardFn>),
}

impl Guard {
    /// Role guard, or [`Guard::Authenticated`] when `role` is absent or empty.
    #[must_use]
    pub fn role(role: Option<&str>) -> Self {
        match role {
            Some(role) if !role.is_empty() => Self::Role(role.to_string()),
            _ => Self::Authenticated,
        }
    }

    /// Guard from a closure
    pub fn custom(check: impl Fn(&Token, &Parts) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(check))
    }

    /// Evaluate against a verified token.
    #[must_use]
    pub fn check(&self, token: &Token, request: &Parts) -> bool {
        match self {
            Self::Authenticated => true,
            Self::Role(role) => token.has_role(role),
            Self::Custom(check) => check(token, request),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated => f.write_str("Authenticated"),
            Self::Role(role) => f.debug_tuple("Role").field(role).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Per-route gate built by [`Keycloak::protect`].
#[derive(Clone)]
pub struct ProtectHandler {
    keycloak: Arc<Keycloak>,
    guard: Guard,
}

impl fmt::Debug for ProtectHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectHandler")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl ProtectHandler {
    pub(super) fn new(keycloak: Arc<Keycloak>, guard: Guard) -> Self {
        Self { keycloak, guard }
    }

    /// The guard this handler enforces
    #[must_use]
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Let `request` through or answer it.
    ///
    /// With a grant attached the guard decides; a failed guard is answered
    /// by the `access_denied` hook. Without a grant, bearer-only clients
    /// are denied and others are redirected to the Keycloak login page.
    ///
    /// # Errors
    ///
    /// The response to send instead of continuing.
    pub fn check(&self, request: Request<Body>) -> Result<Request<Body>, Response> {
        let (parts, body) = request.into_parts();
        let _entered = self.keycloak.span.enter();

        let Some(grant) = parts.extensions.get::<Grant>() else {
            if self.keycloak.config.bearer_only {
                debug!("No grant on bearer-only client");
                return Err(self.keycloak.access_denied(&parts));
            }
            return Err(self.login_redirect(&parts));
        };

        if self.guard.check(&grant.access_token, &parts) {
            Ok(Request::from_parts(parts, body))
        } else {
            debug!(guard = ?self.guard, sub = ?grant.access_token.subject(), "Guard rejected token");
            Err(self.keycloak.access_denied(&parts))
        }
    }

    /// Wrap `router` so every route requires this guard.
    pub fn apply<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(middleware::from_fn_with_state(self, protect_middleware))
    }

    fn login_redirect(&self, request: &Parts) -> Response {
        let config = &self.keycloak.config;
        let url = current_url(request);
        let separator = if url.contains('?') { '&' } else { '?' };
        let redirect_uri = format!("{url}{separator}auth_callback=1");
        let state = uuid::Uuid::new_v4().to_string();

        if let Some(session) = request.extensions.get::<Session>() {
            let stored = session
                .insert(REDIRECT_URI_SESSION_KEY, &redirect_uri)
                .and_then(|()| session.insert(STATE_SESSION_KEY, &state));
            if let Err(e) = stored {
                warn!(error = %e, "Failed to remember login state");
            }
        }

        let mut login = match url::Url::parse(&config.auth_endpoint()) {
            Ok(login) => login,
            Err(e) => {
                warn!(error = %e, "Invalid authorization endpoint");
                return self.keycloak.access_denied(request);
            }
        };
        login
            .query_pairs_mut()
            .append_pair("client_id", &config.resource)
            .append_pair("state", &state)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", "openid")
            .append_pair("response_type", "code");

        debug!("Redirecting to login");
        redirect(login.as_str())
    }
}

async fn protect_middleware(
    State(handler): State<ProtectHandler>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match handler.check(request) {
        Ok(request) => next.run(request).await,
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keycloak::token::tests::unsigned;
    use serde_json::json;

    fn parts() -> Parts {
        Request::builder()
            .uri("/admin")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn token() -> Token {
        let claims = json!({ "resource_access": { "gateway": { "roles": ["admin"] } } });
        Token::parse(&unsigned(&claims), "gateway").unwrap()
    }

    #[test]
    fn empty_role_means_any_authenticated_user() {
        assert!(matches!(Guard::role(None), Guard::Authenticated));
        assert!(matches!(Guard::role(Some("")), Guard::Authenticated));
        assert!(matches!(Guard::role(Some("admin")), Guard::Role(r) if r == "admin"));
    }

    #[test]
    fn guards_check_token_and_request() {
        let token = token();
        let parts = parts();

        assert!(Guard::Authenticated.check(&token, &parts));
        assert!(Guard::Role("admin".into()).check(&token, &parts));
        assert!(!Guard::Role("realm:admin".into()).check(&token, &parts));

        let by_path = Guard::custom(|_, req| req.uri.path().starts_with("/admin"));
        assert!(by_path.check(&token, &parts));
        assert_eq!(format!("{by_path:?}"), "Custom(..)");
    }
}
