//! The `keycloak-protect` policy.
//!
//! Parameters are fixed per pipeline. With a non-empty `jsProtect` the policy
//! binds the access token into the request context (under
//! `jsProtectTokenVar`, default `token`) and allows the request when the
//! expression is truthy. Otherwise it checks `role`, or just authentication
//! when no role is given.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{body::Body, http::Request};
use protect_expr::{EvalError, Expression, Value};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::context::RequestContext;
use crate::gateway::plugin::{PolicyHandler, PolicyOutcome};
use crate::keycloak::{Guard, Keycloak, ProtectHandler, Token};
use crate::{Error, Result};

/// Policy name used in pipeline configuration
pub const POLICY_NAME: &str = "keycloak-protect";

/// Context variable the token is bound to when `jsProtectTokenVar` is unset
pub const DEFAULT_TOKEN_VAR: &str = "token";

/// Per-pipeline parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectParams {
    /// Role required in role mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Context variable holding the token in expression mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_protect_token_var: Option<String>,
    /// Access expression; selects expression mode when non-empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_protect: Option<String>,
}

impl ProtectParams {
    /// Deserialize parameters (`null` means none).
    pub fn from_json(params: &serde_json::Value) -> Result<Self> {
        if params.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(params.clone())
            .map_err(|e| Error::Policy(format!("{POLICY_NAME}: {e}")))
    }

    /// The expression, if expression mode applies
    #[must_use]
    pub fn expression_source(&self) -> Option<&str> {
        self.js_protect.as_deref().filter(|s| !s.is_empty())
    }

    /// Variable the token is bound to
    #[must_use]
    pub fn token_var(&self) -> &str {
        self.js_protect_token_var
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TOKEN_VAR)
    }
}

/// JSON Schema for the parameters
#[must_use]
pub fn schema() -> serde_json::Value {
    json!({
        "$id": "http://express-gateway.io/schemas/policies/keycloak-protect.json",
        "type": "object",
        "properties": {
            "role": {
                "description": "the keycloak role to restrict access to",
                "type": "string"
            },
            "jsProtectTokenVar": {
                "description": "the keycloak token variable name to reference the token in jsProtect",
                "type": "string"
            },
            "jsProtect": {
                "description": "a js snippet to apply for whether a user has access.",
                "type": "string"
            }
        }
    })
}

/// Parse parameters and compile the expression, if any.
///
/// # Errors
///
/// [`Error::Policy`] for malformed parameters, [`Error::Expression`] when
/// `jsProtect` does not parse.
pub fn validate_params(params: &serde_json::Value) -> Result<ProtectParams> {
    let params = ProtectParams::from_json(params)?;
    if let Some(source) = params.expression_source() {
        Expression::parse(source)?;
    }
    Ok(params)
}

/// Bind `token` under `var` in `ctx`, then evaluate `expression`.
///
/// Returns the expression's value; the caller decides on truthiness.
pub fn run_expression(
    ctx: &RequestContext,
    var: &str,
    token: &Token,
    expression: &Expression,
) -> std::result::Result<Value, EvalError> {
    ctx.set(var, Value::host(token.clone()));
    ctx.run(expression)
}

/// The guard these parameters describe.
#[must_use]
pub fn guard(params: &ProtectParams, span: &tracing::Span) -> Guard {
    let Some(source) = params.expression_source() else {
        return Guard::role(params.role.as_deref());
    };

    let expression = match Expression::parse(source) {
        Ok(expression) => Arc::new(expression),
        Err(e) => {
            span.in_scope(|| {
                error!(error = %e, expression = %source, "jsProtect does not parse; denying all requests");
            });
            return Guard::custom(|_, _| false);
        }
    };

    let var = params.token_var().to_string();
    let span = span.clone();
    Guard::custom(move |token, request| {
        let _entered = span.enter();
        let Some(ctx) = request.extensions.get::<RequestContext>() else {
            warn!("No request context; denying");
            return false;
        };
        match run_expression(ctx, &var, token, &expression) {
            Ok(result) => {
                info!(result = %result, "Keycloak Protect JS Result");
                result.is_truthy()
            }
            Err(e) => {
                warn!(error = %e, expression = %expression, "jsProtect evaluation failed; denying");
                false
            }
        }
    })
}

/// Build the policy handler for one pipeline.
pub fn build(
    keycloak: &Arc<Keycloak>,
    params: &serde_json::Value,
    span: &tracing::Span,
) -> Result<Arc<dyn PolicyHandler>> {
    let parsed = ProtectParams::from_json(params)?;
    let shown = serde_json::to_string(&parsed).unwrap_or_default();
    span.in_scope(|| info!(params = %shown, "Keycloak Protect"));

    let handler = keycloak.protect(guard(&parsed, span));
    Ok(Arc::new(ProtectPolicy { handler }))
}

/// `keycloak-protect` attached to one pipeline
#[derive(Debug, Clone)]
pub struct ProtectPolicy {
    handler: ProtectHandler,
}

#[async_trait]
impl PolicyHandler for ProtectPolicy {
    async fn handle(&self, request: Request<Body>) -> PolicyOutcome {
        match self.handler.check(request) {
            Ok(request) => PolicyOutcome::Continue(request),
            Err(response) => PolicyOutcome::Respond(response),
        }
    }
}
