//! Token endpoint client: authorization code exchange and refresh.

use std::collections::HashMap;

use reqwest::Client;
use tracing::debug;

use super::config::KeycloakConfig;
use super::token::{Grant, RawGrant};
use super::verifier::TokenVerifier;
use crate::{Error, Result};

/// Obtains grants from the realm's token endpoint and verifies them.
pub struct GrantManager {
    http: Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    public_client: bool,
    verifier: TokenVerifier,
}

impl GrantManager {
    /// Build from adapter config.
    ///
    /// # Errors
    ///
    /// Propagates [`TokenVerifier::new`] errors.
    pub fn new(config: &KeycloakConfig, http: Client) -> Result<Self> {
        Ok(Self {
            verifier: TokenVerifier::new(config, http.clone())?,
            http,
            token_endpoint: config.token_endpoint(),
            client_id: config.resource.clone(),
            client_secret: config.client_secret().map(ToString::to_string),
            public_client: config.public_client,
        })
    }

    /// Access token verifier
    #[must_use]
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Exchange an authorization code.
    ///
    /// # Errors
    ///
    /// [`Error::Keycloak`] if the request fails, the endpoint answers with
    /// an error status, or the returned access token does not verify.
    pub async fn obtain_from_code(&self, code: &str, redirect_uri: &str) -> Result<Grant> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", redirect_uri);
        self.request(params, "Token exchange").await
    }

    /// Refresh `grant` using its refresh token.
    ///
    /// # Errors
    ///
    /// [`Error::Keycloak`] if the grant has no refresh token or the refresh
    /// is rejected.
    pub async fn refresh(&self, grant: &Grant) -> Result<Grant> {
        let refresh_token = grant
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Keycloak("Grant has no refresh token".to_string()))?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        let mut refreshed = self.request(params, "Token refresh").await?;

        // Keycloak may omit tokens it did not rotate
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token.clone_from(&grant.refresh_token);
        }
        if refreshed.id_token.is_none() {
            refreshed.id_token.clone_from(&grant.id_token);
        }
        Ok(refreshed)
    }

    async fn request<'a>(
        &'a self,
        mut params: HashMap<&'a str, &'a str>,
        what: &str,
    ) -> Result<Grant> {
        let mut request = self.http.post(&self.token_endpoint);
        match (&self.client_secret, self.public_client) {
            (Some(secret), false) => {
                request = request.basic_auth(&self.client_id, Some(secret));
            }
            _ => {
                params.insert("client_id", &self.client_id);
            }
        }

        let response = request
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Keycloak(format!("{what} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Keycloak(format!(
                "{what} failed: HTTP {status} - {body}"
            )));
        }

        let raw: RawGrant = response
            .json()
            .await
            .map_err(|e| Error::Keycloak(format!("Failed to parse {what} response: {e}")))?;
        debug!(expires_in = ?raw.expires_in, "{what} succeeded");

        self.verify(&raw).await
    }

    /// Parse and verify a raw grant's access token.
    ///
    /// # Errors
    ///
    /// [`Error::Keycloak`] if the access token is malformed or invalid.
    pub async fn verify(&self, raw: &RawGrant) -> Result<Grant> {
        let grant = Grant::from_raw(raw, &self.client_id)
            .map_err(|e| Error::Keycloak(e.to_string()))?;
        self.verifier
            .verify(&grant.access_token)
            .await
            .map_err(|e| Error::Keycloak(e.to_string()))?;
        Ok(grant)
    }
}
