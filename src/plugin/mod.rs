//! The Keycloak plugin.
//!
//! At init it merges its settings over the defaults, creates the in-memory
//! session store, builds the session middleware and the Keycloak adapter over
//! that store, registers both as gateway middleware (session outermost) and
//! registers the `keycloak-protect` policy.

pub mod settings;

use std::sync::Arc;
use std::time::Duration;

use axum::{http::request::Parts, response::Response};
use serde_json::{Value, json};
use tracing::info;

pub use settings::{DEFAULT_SESSION_SECRET, PluginSettings, default_settings, merge_shallow};

use crate::gateway::plugin::{Plugin, PluginContext, PolicyDefinition};
use crate::keycloak::{Keycloak, KeycloakHooks, Token, access_denied_response};
use crate::policy;
use crate::session::{InMemorySessionStore, SessionLayer, SessionStore, spawn_reaper};
use crate::Result;

/// Plugin name under `plugins:`
pub const PLUGIN_NAME: &str = "keycloak";

/// How often expired sessions are pruned
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Keycloak authentication and authorization for the gateway
#[derive(Debug, Clone, Copy, Default)]
pub struct KeycloakPlugin;

impl Plugin for KeycloakPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn version(&self) -> &'static str {
        "1.2.0"
    }

    fn policies(&self) -> &'static [&'static str] {
        &[policy::POLICY_NAME]
    }

    fn schema(&self) -> Value {
        json!({
            "$id": "http://express-gateway.io/schemas/plugin/keycloak.json",
            "type": "object",
            "properties": {
                "session": {
                    "title": "Session Settings",
                    "description": "Session Settings as outlined by express middleware",
                    "type": "object"
                },
                "keycloakConfig": {
                    "title": "Keycloak Configuration",
                    "description": "This can be used rather than requiring keycloak.json to be present",
                    "type": "object"
                }
            }
        })
    }

    fn init(&self, ctx: &mut PluginContext) -> Result<()> {
        let span = ctx.span().clone();

        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let settings = PluginSettings::resolve(ctx.settings(), Arc::clone(&store))?;

        let session = Arc::new(SessionLayer::new(
            settings.session_settings()?,
            Arc::clone(&store),
        )?);
        let keycloak = Arc::new(
            Keycloak::new(Arc::clone(&store), settings.keycloak()?)?
                .with_hooks(PluginHooks { span: span.clone() })
                .with_span(span.clone()),
        );

        span.in_scope(|| {
            info!(settings = %settings.redacted(), "Initialized Keycloak Plugin with settings");
        });

        spawn_reaper(store, REAP_INTERVAL, ctx.shutdown());

        let middleware_keycloak = Arc::clone(&keycloak);
        let middleware_span = span.clone();
        ctx.register_gateway_middleware(move |app| {
            middleware_span.in_scope(|| info!("Registering Keycloak Middleware"));
            session.apply(middleware_keycloak.middleware(app))
        });

        ctx.register_policy(PolicyDefinition {
            name: policy::POLICY_NAME.to_string(),
            schema: policy::schema(),
            factory: Arc::new(move |params: &Value| policy::build(&keycloak, params, &span)),
        });

        Ok(())
    }

    fn validate_policy(&self, _policy: &str, params: &Value) -> Result<()> {
        policy::validate_params(params).map(|_| ())
    }
}

/// Logs authentications and denials under the plugin's span.
struct PluginHooks {
    span: tracing::Span,
}

impl KeycloakHooks for PluginHooks {
    fn authenticated(&self, _request: &Parts, token: &Token) {
        let _entered = self.span.enter();
        info!(content = %token.content(), "Keycloak Authenticated");
    }

    fn access_denied(&self, request: &Parts) -> Response {
        let _entered = self.span.enter();
        info!(method = %request.method, path = %request.uri.path(), "Keycloak Access Denied");
        access_denied_response()
    }
}
