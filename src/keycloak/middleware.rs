//! Per-request grant handling.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header, request::Parts},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, debug, info, warn};

use super::{
    GRANT_SESSION_KEY, Grant, Keycloak, REDIRECT_URI_SESSION_KEY, RawGrant, STATE_SESSION_KEY,
    Token, base_url, current_url, query_pairs, redirect, strip_query_params,
};
use crate::session::Session;

/// Query parameters Keycloak adds to the callback URL
const CALLBACK_PARAMS: [&str; 4] = ["code", "state", "session_state", "auth_callback"];

pub(super) async fn keycloak_middleware(
    State(keycloak): State<Arc<Keycloak>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let span = keycloak.span.clone();
    keycloak.handle(request, next).instrument(span).await
}

impl Keycloak {
    async fn handle(&self, request: Request<Body>, next: Next) -> Response {
        // Body is not Sync; only the parts are borrowed across awaits
        let (mut parts, body) = request.into_parts();
        let session = parts.extensions.get::<Session>().cloned();

        if parts.uri.path() == self.config.logout_url {
            return self.logout(&parts, session.as_ref()).await;
        }

        let query = query_pairs(&parts.uri);
        let param = |name: &str| {
            query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };
        if param("auth_callback").is_some() {
            if let Some(error) = param("error") {
                info!(error = %error, "Login callback returned an error");
                return self.access_denied(&parts);
            }
            if let Some(code) = param("code") {
                return self
                    .callback(&parts, session.as_ref(), code, param("state"))
                    .await;
            }
        }

        if let Some(grant) = self.resolve_grant(&parts.headers, session.as_ref()).await {
            self.hooks.authenticated(&parts, &grant.access_token);
            parts.extensions.insert(grant);
        }

        next.run(Request::from_parts(parts, body)).await
    }

    /// Complete a login: exchange the code, store the grant, redirect to
    /// the URL the user originally asked for.
    async fn callback(
        &self,
        request: &Parts,
        session: Option<&Session>,
        code: &str,
        state: Option<&str>,
    ) -> Response {
        // Only callbacks for a login this session started are accepted
        let expected = session.and_then(|s| s.remove(STATE_SESSION_KEY));
        let expected = expected.as_ref().and_then(|v| v.as_str());
        if expected.is_none() || expected != state {
            warn!("Login callback state does not match the session");
            return self.access_denied(request);
        }

        let url = current_url(request);
        let redirect_uri = session
            .and_then(|s| s.remove(REDIRECT_URI_SESSION_KEY))
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_else(|| strip_query_params(&url, &["code", "state", "session_state"]));

        let grant = match self.grants.obtain_from_code(code, &redirect_uri).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Authorization code exchange failed");
                return self.access_denied(request);
            }
        };

        if let Some(session) = session {
            if let Err(e) = session.insert(GRANT_SESSION_KEY, grant.to_raw()) {
                warn!(error = %e, "Failed to store grant in session");
            }
        }
        debug!(sub = ?grant.access_token.subject(), "Login completed");

        redirect(&strip_query_params(&url, &CALLBACK_PARAMS))
    }

    /// Drop the grant and session, then send the user to Keycloak's logout.
    async fn logout(&self, request: &Parts, session: Option<&Session>) -> Response {
        let mut id_token = None;
        if let Some(session) = session {
            id_token = session
                .get::<RawGrant>(GRANT_SESSION_KEY)
                .and_then(|grant| grant.id_token);
            session.remove(GRANT_SESSION_KEY);
            session.destroy();
            if let Err(e) = self.store.destroy(&session.id()).await {
                warn!(error = %e, "Failed to destroy session on logout");
            }
        }

        let post_logout = query_pairs(&request.uri)
            .into_iter()
            .find(|(k, _)| k == "redirect_url")
            .map_or_else(|| format!("{}/", base_url(&request.headers)), |(_, v)| v);

        let mut url = match url::Url::parse(&self.config.logout_endpoint()) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "Invalid logout endpoint");
                return self.access_denied(request);
            }
        };
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("post_logout_redirect_uri", &post_logout);
            params.append_pair("client_id", &self.config.resource);
            if let Some(id_token) = &id_token {
                params.append_pair("id_token_hint", id_token);
            }
        }

        info!("Logged out");
        redirect(url.as_str())
    }

    /// Find and validate the request's grant.
    async fn resolve_grant(
        &self,
        headers: &HeaderMap,
        session: Option<&Session>,
    ) -> Option<Grant> {
        if let Some(raw) = bearer_token(headers) {
            let token = match Token::parse(raw, &self.config.resource) {
                Ok(token) => token,
                Err(e) => {
                    debug!(error = %e, "Ignoring malformed bearer token");
                    return None;
                }
            };
            return match self.grants.verifier().verify(&token).await {
                Ok(()) => Some(Grant::bearer(token)),
                Err(e) => {
                    debug!(error = %e, "Bearer token rejected");
                    None
                }
            };
        }

        let session = session?;
        let raw = session.get::<RawGrant>(GRANT_SESSION_KEY)?;

        let grant = match Grant::from_raw(&raw, &self.config.resource) {
            Ok(grant) if grant.access_token.is_expired() => {
                return self.refresh(session, &grant).await;
            }
            Ok(grant) => grant,
            Err(e) => {
                debug!(error = %e, "Dropping malformed session grant");
                session.remove(GRANT_SESSION_KEY);
                return None;
            }
        };

        match self.grants.verifier().verify(&grant.access_token).await {
            Ok(()) => Some(grant),
            Err(e) => {
                debug!(error = %e, "Dropping invalid session grant");
                session.remove(GRANT_SESSION_KEY);
                None
            }
        }
    }

    async fn refresh(&self, session: &Session, grant: &Grant) -> Option<Grant> {
        if grant.refresh_token.is_none() {
            session.remove(GRANT_SESSION_KEY);
            return None;
        }

        match self.grants.refresh(grant).await {
            Ok(refreshed) => {
                debug!("Refreshed session grant");
                if let Err(e) = session.insert(GRANT_SESSION_KEY, refreshed.to_raw()) {
                    warn!(error = %e, "Failed to store refreshed grant");
                }
                Some(refreshed)
            }
            Err(e) => {
                info!(error = %e, "Grant refresh failed");
                session.remove(GRANT_SESSION_KEY);
                None
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
