//! Adapter callbacks.

use axum::{
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};

use super::token::Token;

/// Body of every denial response
pub const ACCESS_DENIED_BODY: &str = "Access Denied";

/// Callbacks the adapter invokes during a request.
pub trait KeycloakHooks: Send + Sync {
    /// A verified grant was attached to `request`.
    fn authenticated(&self, request: &Parts, token: &Token) {
        let _ = (request, token);
    }

    /// Produce the response for a denied request. Nothing downstream runs.
    fn access_denied(&self, request: &Parts) -> Response {
        let _ = request;
        access_denied_response()
    }
}

/// `403 Access Denied`
#[must_use]
pub fn access_denied_response() -> Response {
    (StatusCode::FORBIDDEN, ACCESS_DENIED_BODY).into_response()
}

/// Hooks with the default behavior only
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl KeycloakHooks for DefaultHooks {}
