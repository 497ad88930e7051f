//! Keycloak Gateway Library
//!
//! An API gateway host with a Keycloak plugin. The plugin wires three pieces
//! into every request:
//!
//! - **Sessions**: a signed `connect.sid` cookie backed by a [`session::SessionStore`]
//! - **Keycloak adapter**: attaches, verifies and refreshes the user's grant,
//!   handles the login callback and logout
//! - **`keycloak-protect` policy**: per-route role checks or `jsProtect`
//!   expressions evaluated against the request context
//!
//! Allowed requests are proxied to the pipeline's service endpoint.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod keycloak;
pub mod plugin;
pub mod policy;
pub mod session;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
