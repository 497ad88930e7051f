//! Keycloak adapter configuration.
//!
//! Keys follow `keycloak.json` as exported by the Keycloak admin console
//! (kebab-case); the camelCase spellings used by programmatic adapters are
//! accepted as aliases.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Client adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KeycloakConfig {
    /// Realm name
    pub realm: String,
    /// Base URL of the Keycloak server, e.g. `https://sso.example.com/auth`
    #[serde(alias = "authServerUrl", alias = "serverUrl")]
    pub auth_server_url: String,
    /// Client id
    #[serde(alias = "clientId")]
    pub resource: String,
    /// Never redirect to login; unauthenticated requests are denied
    #[serde(alias = "bearerOnly")]
    pub bearer_only: bool,
    /// Public client (no client secret)
    #[serde(alias = "publicClient", alias = "public")]
    pub public_client: bool,
    /// Client credentials for confidential clients
    pub credentials: Credentials,
    /// Realm RSA public key, base64 DER. When set, JWKS is never fetched.
    #[serde(alias = "realmPublicKey")]
    pub realm_public_key: Option<String>,
    /// `all`, `external` or `none`
    #[serde(alias = "sslRequired")]
    pub ssl_required: Option<String>,
    /// Require the client id in the access token's `aud`
    #[serde(alias = "verifyTokenAudience")]
    pub verify_token_audience: bool,
    /// Minimum seconds between two JWKS fetches
    #[serde(alias = "minTimeBetweenJwksRequests")]
    pub min_time_between_jwks_requests: u64,
    /// Path that triggers logout
    #[serde(alias = "logoutUrl")]
    pub logout_url: String,
}

impl Default for KeycloakConfig {
    fn default() -> Self {
        Self {
            realm: String::new(),
            auth_server_url: String::new(),
            resource: String::new(),
            bearer_only: false,
            public_client: false,
            credentials: Credentials::default(),
            realm_public_key: None,
            ssl_required: None,
            verify_token_audience: false,
            min_time_between_jwks_requests: 10,
            logout_url: "/logout".to_string(),
        }
    }
}

/// `credentials` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// Client secret
    pub secret: Option<String>,
}

impl KeycloakConfig {
    /// Deserialize from the merged `keycloakConfig` object and validate.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] on malformed values or missing `realm`,
    /// `auth-server-url` or `resource`.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("keycloakConfig: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the adapter can be built from this config.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("realm", &self.realm),
            ("auth-server-url", &self.auth_server_url),
            ("resource", &self.resource),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("keycloakConfig: '{key}' is required")));
            }
        }
        url::Url::parse(&self.auth_server_url)
            .map_err(|e| Error::Config(format!("keycloakConfig: invalid auth-server-url: {e}")))?;
        if !self.public_client && !self.bearer_only && self.client_secret().is_none() {
            return Err(Error::Config(
                "keycloakConfig: confidential clients need 'credentials.secret'".to_string(),
            ));
        }
        Ok(())
    }

    /// Client secret, if configured and non-empty
    #[must_use]
    pub fn client_secret(&self) -> Option<&str> {
        self.credentials
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    /// Whether Keycloak must be reached over HTTPS only
    #[must_use]
    pub fn https_only(&self) -> bool {
        self.ssl_required.as_deref() == Some("all")
    }

    /// `<auth-server-url>/realms/<realm>`; also the expected token issuer.
    #[must_use]
    pub fn realm_url(&self) -> String {
        format!(
            "{}/realms/{}",
            self.auth_server_url.trim_end_matches('/'),
            self.realm
        )
    }

    fn oidc_endpoint(&self, name: &str) -> String {
        format!("{}/protocol/openid-connect/{name}", self.realm_url())
    }

    /// JWKS endpoint
    #[must_use]
    pub fn certs_endpoint(&self) -> String {
        self.oidc_endpoint("certs")
    }

    /// Token endpoint (code exchange and refresh)
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.oidc_endpoint("token")
    }

    /// Authorization endpoint (login redirect)
    #[must_use]
    pub fn auth_endpoint(&self) -> String {
        self.oidc_endpoint("auth")
    }

    /// End-session endpoint (logout redirect)
    #[must_use]
    pub fn logout_endpoint(&self) -> String {
        self.oidc_endpoint("logout")
    }

    /// Copy suitable for logging: the client secret is masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.credentials.secret.is_some() {
            copy.credentials.secret = Some("***".to_string());
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "realm": "demo",
            "auth-server-url": "http://localhost:8080/auth/",
            "resource": "gateway",
            "credentials": { "secret": "s3cr3t" }
        })
    }

    #[test]
    fn parses_keycloak_json_keys_with_defaults() {
        let config = KeycloakConfig::from_json(sample()).unwrap();

        assert_eq!(config.realm, "demo");
        assert_eq!(config.client_secret(), Some("s3cr3t"));
        assert!(!config.bearer_only);
        assert_eq!(config.min_time_between_jwks_requests, 10);
        assert_eq!(config.logout_url, "/logout");
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let config = KeycloakConfig::from_json(json!({
            "realm": "demo",
            "serverUrl": "http://kc",
            "clientId": "gw",
            "bearerOnly": true
        }))
        .unwrap();

        assert_eq!(config.auth_server_url, "http://kc");
        assert_eq!(config.resource, "gw");
        assert!(config.bearer_only);
    }

    #[test]
    fn endpoints_derive_from_realm_url() {
        let config = KeycloakConfig::from_json(sample()).unwrap();

        assert_eq!(config.realm_url(), "http://localhost:8080/auth/realms/demo");
        assert_eq!(
            config.token_endpoint(),
            "http://localhost:8080/auth/realms/demo/protocol/openid-connect/token"
        );
        assert!(config.certs_endpoint().ends_with("/openid-connect/certs"));
        assert!(config.auth_endpoint().ends_with("/openid-connect/auth"));
        assert!(config.logout_endpoint().ends_with("/openid-connect/logout"));
    }

    #[test]
    fn missing_required_keys_are_config_errors() {
        // GIVEN: the default (empty) keycloakConfig
        let err = KeycloakConfig::from_json(json!({})).unwrap_err();

        // THEN: construction fails with a config error naming the key
        assert!(matches!(&err, Error::Config(msg) if msg.contains("realm")));
    }

    #[test]
    fn confidential_client_requires_secret() {
        let err = KeycloakConfig::from_json(json!({
            "realm": "demo",
            "auth-server-url": "http://kc",
            "resource": "gw"
        }))
        .unwrap_err();
        assert!(matches!(&err, Error::Config(msg) if msg.contains("credentials.secret")));
    }

    #[test]
    fn redacted_masks_client_secret() {
        let config = KeycloakConfig::from_json(sample()).unwrap();
        let shown = serde_json::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("s3cr3t"));
        assert!(shown.contains("***"));
    }

    #[test]
    fn ssl_required_all_means_https_only() {
        let mut config = KeycloakConfig::from_json(sample()).unwrap();
        assert!(!config.https_only());
        config.ssl_required = Some("all".into());
        assert!(config.https_only());
    }
}
