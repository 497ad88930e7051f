//! Pipelines: path matching, ordered policies and an upstream.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{body::Body, http::Request};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::plugin::{PolicyDefinition, PolicyHandler, PolicyOutcome};
use super::schema;
use crate::config::{ApiEndpointConfig, Config, PipelineConfig};
use crate::{Error, Result};

/// One policy reference from a pipeline, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyEntry {
    /// Registered policy name
    pub name: String,
    /// Parameters handed to the policy factory
    pub params: Value,
}

/// Flatten a pipeline's `policies:` list.
///
/// Each item is a single-key map. The value is either the parameters
/// directly or a list of `{ action: <params> }` steps, each becoming its
/// own entry.
pub fn policy_entries(pipeline: &str, config: &PipelineConfig) -> Result<Vec<PolicyEntry>> {
    let mut entries = Vec::new();

    for item in &config.policies {
        if item.len() != 1 {
            return Err(Error::Config(format!(
                "pipeline '{pipeline}': each policy must be a single-key map, got {} keys",
                item.len()
            )));
        }

        for (name, value) in item {
            match value {
                Value::Array(steps) => {
                    for step in steps {
                        if step.get("condition").is_some() {
                            return Err(Error::Config(format!(
                                "pipeline '{pipeline}': policy '{name}' uses conditions, which are not supported"
                            )));
                        }
                        entries.push(PolicyEntry {
                            name: name.clone(),
                            params: step.get("action").cloned().unwrap_or(Value::Null),
                        });
                    }
                }
                params => entries.push(PolicyEntry {
                    name: name.clone(),
                    params: params.clone(),
                }),
            }
        }
    }

    Ok(entries)
}

/// A pipeline ready to serve requests
pub struct Pipeline {
    name: String,
    endpoints: Vec<ApiEndpointConfig>,
    policies: Vec<(String, Arc<dyn PolicyHandler>)>,
    upstream: Url,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let policies: Vec<&str> = self.policies.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("policies", &policies)
            .field("upstream", &self.upstream.as_str())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Resolve pipeline `name` against the gateway config and registered policies.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for unknown endpoints or a bad upstream URL,
    /// [`Error::Policy`] for unknown policies or invalid parameters.
    pub fn build(
        name: &str,
        config: &Config,
        policies: &HashMap<String, PolicyDefinition>,
    ) -> Result<Self> {
        let pipeline = config
            .pipelines
            .get(name)
            .ok_or_else(|| Error::Config(format!("Unknown pipeline '{name}'")))?;

        let endpoints = pipeline
            .api_endpoints
            .iter()
            .map(|endpoint| {
                config.api_endpoints.get(endpoint).cloned().ok_or_else(|| {
                    Error::Config(format!("pipeline '{name}': unknown api endpoint '{endpoint}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let service = config
            .service_endpoints
            .get(&pipeline.service_endpoint)
            .ok_or_else(|| {
                Error::Config(format!(
                    "pipeline '{name}': unknown service endpoint '{}'",
                    pipeline.service_endpoint
                ))
            })?;
        let upstream = Url::parse(&service.url).map_err(|e| {
            Error::Config(format!(
                "service endpoint '{}': invalid url '{}': {e}",
                pipeline.service_endpoint, service.url
            ))
        })?;

        let mut handlers = Vec::new();
        for entry in policy_entries(name, pipeline)? {
            let definition = policies.get(&entry.name).ok_or_else(|| {
                Error::Policy(format!("pipeline '{name}': unknown policy '{}'", entry.name))
            })?;
            check_params(name, &entry, definition)?;
            handlers.push((entry.name.clone(), (definition.factory)(&entry.params)?));
        }

        debug!(pipeline = %name, policies = handlers.len(), upstream = %upstream, "Built pipeline");

        Ok(Self {
            name: name.to_string(),
            endpoints,
            policies: handlers,
            upstream,
        })
    }

    /// Pipeline name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Upstream base URL
    #[must_use]
    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    /// Whether one of this pipeline's API endpoints serves `path`
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.endpoints.iter().any(|endpoint| endpoint.matches(path))
    }

    /// Run the policies in order until one answers.
    pub async fn run(&self, mut request: Request<Body>) -> PolicyOutcome {
        for (name, policy) in &self.policies {
            match policy.handle(request).await {
                PolicyOutcome::Continue(next) => request = next,
                PolicyOutcome::Respond(response) => {
                    debug!(pipeline = %self.name, policy = %name, status = %response.status(), "Policy answered");
                    return PolicyOutcome::Respond(response);
                }
            }
        }
        PolicyOutcome::Continue(request)
    }
}

/// Validate `entry.params` against the policy's schema.
pub fn check_params(pipeline: &str, entry: &PolicyEntry, definition: &PolicyDefinition) -> Result<()> {
    // A bare `- keycloak-protect:` means no parameters
    let params = if entry.params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        entry.params.clone()
    };

    let violations = schema::validate(&params, &definition.schema);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Policy(format!(
            "pipeline '{pipeline}': policy '{}': {}",
            entry.name,
            schema::describe(&violations)
        )))
    }
}

/// All configured pipelines, in name order.
pub fn build_all(config: &Config, policies: &HashMap<String, PolicyDefinition>) -> Result<Vec<Pipeline>> {
    config
        .pipelines
        .keys()
        .map(|name| Pipeline::build(name, config, policies))
        .collect()
}
