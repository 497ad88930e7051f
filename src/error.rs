//! Error types for the Keycloak gateway

use std::io;

use thiserror::Error;

/// Result type alias for the Keycloak gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Keycloak gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (gateway config, plugin settings, policy parameters)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session store or cookie error
    #[error("Session error: {0}")]
    Session(String),

    /// Keycloak adapter error (token verification, grant exchange)
    #[error("Keycloak error: {0}")]
    Keycloak(String),

    /// `jsProtect` expression did not parse
    #[error("Expression error: {0}")]
    Expression(#[from] protect_expr::ParseError),

    /// Policy registration or lookup error
    #[error("Policy error: {0}")]
    Policy(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error comes from operator-supplied configuration.
    ///
    /// Startup treats these as fatal; everything else is a runtime failure.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Expression(_) | Self::Policy(_))
    }
}
