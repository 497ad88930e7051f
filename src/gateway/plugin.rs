//! Plugin host interface.
//!
//! A [`Plugin`] is initialised once at startup with a [`PluginContext`]. It
//! may wrap the gateway's request path in middleware and register named
//! policies that pipelines then reference from configuration.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::Request,
    response::Response,
};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::Result;

/// Result of running one policy on a request
pub enum PolicyOutcome {
    /// Continue with the next policy (or the proxy)
    Continue(Request<Body>),
    /// Answer the request; nothing further runs
    Respond(Response),
}

impl fmt::Debug for PolicyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue(request) => write!(f, "Continue({} {})", request.method(), request.uri()),
            Self::Respond(response) => write!(f, "Respond({})", response.status()),
        }
    }
}

/// A configured policy instance attached to one pipeline.
#[async_trait]
pub trait PolicyHandler: Send + Sync {
    /// Decide what happens to `request`.
    async fn handle(&self, request: Request<Body>) -> PolicyOutcome;
}

/// Builds a [`PolicyHandler`] from route-level parameters.
pub type PolicyFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn PolicyHandler>> + Send + Sync>;

/// A policy a plugin makes available.
#[derive(Clone)]
pub struct PolicyDefinition {
    /// Name referenced from pipeline configuration
    pub name: String,
    /// JSON Schema for the parameters
    pub schema: Value,
    /// Parameter-to-handler factory
    pub factory: PolicyFactory,
}

impl fmt::Debug for PolicyDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyDefinition")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Transformation applied to the gateway's request path.
pub type GatewayMiddleware = Box<dyn FnOnce(Router) -> Router + Send>;

/// A gateway plugin.
pub trait Plugin: Send + Sync {
    /// Name used under `plugins:` in configuration
    fn name(&self) -> &'static str;

    /// Plugin version
    fn version(&self) -> &'static str;

    /// Names of the policies [`init`](Self::init) registers
    fn policies(&self) -> &'static [&'static str];

    /// JSON Schema for the plugin's settings
    fn schema(&self) -> Value;

    /// Register middleware and policies.
    fn init(&self, ctx: &mut PluginContext) -> Result<()>;

    /// Deeper checks on one policy's parameters than its schema allows.
    ///
    /// Used by `check`; startup only applies the schema.
    fn validate_policy(&self, _policy: &str, _params: &Value) -> Result<()> {
        Ok(())
    }
}

/// What a plugin sees during [`Plugin::init`].
pub struct PluginContext {
    settings: Value,
    span: tracing::Span,
    shutdown: broadcast::Sender<()>,
    middleware: Vec<GatewayMiddleware>,
    policies: Vec<PolicyDefinition>,
}

impl PluginContext {
    /// Context for plugin `name` with its raw settings.
    #[must_use]
    pub fn new(name: &str, settings: Value, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            settings,
            span: tracing::info_span!("plugin", plugin = %name),
            shutdown,
            middleware: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Raw settings from configuration (`null` when none were given)
    #[must_use]
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Span labelled with the plugin name; log inside it.
    #[must_use]
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Receiver that fires when the gateway shuts down
    #[must_use]
    pub fn shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Wrap every pipeline route. Later registrations wrap earlier ones.
    pub fn register_gateway_middleware(
        &mut self,
        middleware: impl FnOnce(Router) -> Router + Send + 'static,
    ) {
        self.middleware.push(Box::new(middleware));
    }

    /// Make a policy available to pipelines.
    pub fn register_policy(&mut self, policy: PolicyDefinition) {
        self.policies.push(policy);
    }

    /// Registered middleware and policies
    #[must_use]
    pub fn into_parts(self) -> (Vec<GatewayMiddleware>, Vec<PolicyDefinition>) {
        (self.middleware, self.policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    struct Deny;

    #[async_trait]
    impl PolicyHandler for Deny {
        async fn handle(&self, _request: Request<Body>) -> PolicyOutcome {
            PolicyOutcome::Respond(StatusCode::FORBIDDEN.into_response())
        }
    }

    #[tokio::test]
    async fn context_collects_registrations() {
        // GIVEN: a context for a plugin
        let (tx, _rx) = broadcast::channel(1);
        let mut ctx = PluginContext::new("demo", serde_json::json!({ "a": 1 }), tx);
        assert_eq!(ctx.settings()["a"], 1);

        // WHEN: middleware and a policy are registered
        ctx.register_gateway_middleware(|router| router);
        ctx.register_policy(PolicyDefinition {
            name: "deny".into(),
            schema: serde_json::json!({ "type": "object" }),
            factory: Arc::new(|_params: &Value| -> Result<Arc<dyn PolicyHandler>> {
                Ok(Arc::new(Deny))
            }),
        });

        // THEN: both are handed back to the host
        let (middleware, policies) = ctx.into_parts();
        assert_eq!(middleware.len(), 1);
        assert_eq!(policies[0].name, "deny");

        let handler = (policies[0].factory)(&Value::Null).unwrap();
        let outcome = handler.handle(Request::new(Body::empty())).await;
        assert_eq!(format!("{outcome:?}"), "Respond(403 Forbidden)");
    }
}
