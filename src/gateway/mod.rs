//! Gateway host: plugins, pipelines and the HTTP server

pub mod pipeline;
pub mod plugin;
pub mod proxy;
mod router;
pub mod schema;
mod server;

pub use plugin::{Plugin, PluginContext, PolicyDefinition, PolicyHandler, PolicyOutcome};
pub use server::{Gateway, Problem, builtin_plugins, check};
