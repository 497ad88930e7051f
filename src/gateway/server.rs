//! Gateway server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::pipeline::{self, Pipeline, check_params, policy_entries};
use super::plugin::{GatewayMiddleware, Plugin, PluginContext, PolicyDefinition};
use super::proxy::Proxy;
use super::router::{AppState, create_router};
use super::schema;
use crate::config::Config;
use crate::plugin::KeycloakPlugin;
use crate::{Error, Result};

/// Plugins compiled into the gateway
#[must_use]
pub fn builtin_plugins() -> Vec<Arc<dyn Plugin>> {
    vec![Arc::new(KeycloakPlugin)]
}

/// Plugins after init: their middleware and the policies they registered
struct LoadedPlugins {
    middleware: Vec<GatewayMiddleware>,
    policies: HashMap<String, PolicyDefinition>,
    owners: HashMap<String, Arc<dyn Plugin>>,
}

/// Initialise every plugin named under `plugins:`.
fn load_plugins(config: &Config, shutdown: &broadcast::Sender<()>) -> Result<LoadedPlugins> {
    let available = builtin_plugins();
    let mut loaded = LoadedPlugins {
        middleware: Vec::new(),
        policies: HashMap::new(),
        owners: HashMap::new(),
    };

    for (name, plugin_config) in &config.plugins {
        let plugin = available
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Unknown plugin '{name}'")))?;

        if !plugin_config.settings.is_null() {
            let violations = schema::validate(&plugin_config.settings, &plugin.schema());
            if !violations.is_empty() {
                return Err(Error::Config(format!(
                    "plugin '{name}': {}",
                    schema::describe(&violations)
                )));
            }
        }

        let mut ctx = PluginContext::new(name, plugin_config.settings.clone(), shutdown.clone());
        plugin.init(&mut ctx)?;
        let (middleware, policies) = ctx.into_parts();
        loaded.middleware.extend(middleware);

        for policy in policies {
            if loaded.policies.contains_key(&policy.name) {
                return Err(Error::Policy(format!(
                    "policy '{}' is registered twice (again by plugin '{name}')",
                    policy.name
                )));
            }
            loaded.owners.insert(policy.name.clone(), Arc::clone(&plugin));
            loaded.policies.insert(policy.name.clone(), policy);
        }

        info!(plugin = %name, version = plugin.version(), "Loaded plugin");
    }

    Ok(loaded)
}

/// Keycloak gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Fully layered application router
    router: Router,
    /// Fires once on shutdown; plugins hold receivers
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Create a new gateway: initialise plugins and build every pipeline.
    ///
    /// # Errors
    ///
    /// Any configuration problem: unknown plugins, invalid plugin settings,
    /// unknown endpoints or policies, schema-invalid policy parameters.
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let LoadedPlugins {
            middleware,
            policies,
            ..
        } = load_plugins(&config, &shutdown_tx)?;

        let pipelines = pipeline::build_all(&config, &policies)?;
        for pipeline in &pipelines {
            info!(pipeline = %pipeline.name(), upstream = %pipeline.upstream(), "Registered pipeline");
        }

        let proxy = Proxy::new(config.server.request_timeout, config.server.max_body_size)?;
        let state = Arc::new(AppState { pipelines, proxy });
        let router = create_router(state, middleware, config.server.request_timeout);

        Ok(Self {
            config,
            router,
            shutdown_tx,
        })
    }

    /// The application router, for serving or driving in tests
    #[must_use]
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the gateway
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("KEYCLOAK GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            plugins = self.config.plugins.len(),
            pipelines = self.config.pipelines.len(),
            "Configuration loaded"
        );
        if self.config.plugins.is_empty() {
            warn!("No plugins configured - pipelines are not authenticated");
        }
        info!("============================================================");

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let server = axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal(self.shutdown_tx.clone()))
            .into_future();

        // In-flight requests get `shutdown_timeout` to finish after the signal
        let deadline = async {
            let _ = shutdown_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = deadline => warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out"),
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// One problem found by [`check`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    /// Where: `plugins` or `pipeline:<name>`
    pub location: String,
    /// What
    pub message: String,
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Validate the whole configuration without serving.
///
/// Unlike [`Gateway::new`] this keeps going after the first problem and also
/// asks each policy's plugin to validate its parameters (for `keycloak-protect`
/// that parses `jsProtect`).
pub async fn check(config: &Config) -> Vec<Problem> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut problems = Vec::new();

    let loaded = match load_plugins(config, &shutdown_tx) {
        Ok(loaded) => loaded,
        Err(e) => {
            problems.push(Problem {
                location: "plugins".to_string(),
                message: e.to_string(),
            });
            return problems;
        }
    };

    for (name, pipeline_config) in &config.pipelines {
        let location = format!("pipeline:{name}");

        if let Err(e) = Pipeline::build(name, config, &loaded.policies) {
            problems.push(Problem {
                location: location.clone(),
                message: e.to_string(),
            });
        }

        let Ok(entries) = policy_entries(name, pipeline_config) else {
            continue;
        };
        for entry in entries {
            let (Some(definition), Some(owner)) = (
                loaded.policies.get(&entry.name),
                loaded.owners.get(&entry.name),
            ) else {
                continue;
            };
            if check_params(name, &entry, definition).is_err() {
                continue;
            }
            if let Err(e) = owner.validate_policy(&entry.name, &entry.params) {
                problems.push(Problem {
                    location: location.clone(),
                    message: format!("policy '{}': {e}", entry.name),
                });
            }
        }
    }

    drop(shutdown_tx);
    problems
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
