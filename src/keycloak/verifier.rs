//! Access token verification.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to read `kid` and `alg`.
//! 2. Pick the key: the configured realm public key, or the realm JWKS
//!    entry for `kid` (cached; one refresh on unknown `kid`, no more often
//!    than `min-time-between-jwks-requests`).
//! 3. Verify the signature and `exp` with 60 seconds of leeway.
//! 4. Check `iss` against the realm URL, `typ` (when present) against
//!    `Bearer`, and optionally `aud` against the client id.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, Validation,
    errors::ErrorKind,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::config::KeycloakConfig;
use super::token::Token;
use crate::{Error, Result};

/// Why a token was rejected.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Not a decodable JWT.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Signature or standard claim validation failed.
    #[error("JWT verification failed: {0}")]
    Jwt(jsonwebtoken::errors::Error),

    /// `exp` is in the past.
    #[error("Token expired")]
    Expired,

    /// No `kid` in the header and no realm public key configured.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` is not in the realm's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// Fetching the JWKS failed.
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token issued by another realm or server.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Realm URL
        expected: String,
        /// `iss` claim
        actual: String,
    },

    /// `typ` is not `Bearer`.
    #[error("Wrong token type: {0}")]
    WrongType(String),

    /// Client id not in `aud`.
    #[error("Token audience does not include this client")]
    Audience,
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::Jwt(e),
        }
    }
}

/// Cached realm JWKS.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache keyed by certs URL.
struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
    min_refresh_interval: Duration,
    last_fetch: Mutex<Option<Instant>>,
}

impl JwksCache {
    fn new(http: reqwest::Client, min_refresh_interval: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl: Duration::from_secs(3600),
            min_refresh_interval,
            last_fetch: Mutex::new(None),
        }
    }

    /// Whether a forced refresh is allowed now; records the attempt if so.
    fn try_claim_refresh(&self) -> bool {
        let mut last = self.last_fetch.lock();
        let allowed = last.is_none_or(|at| at.elapsed() >= self.min_refresh_interval);
        if allowed {
            *last = Some(Instant::now());
        }
        allowed
    }

    async fn get_or_fetch(
        &self,
        certs_url: &str,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, VerifyError> {
        if let Some(cached) = self.inner.get(certs_url) {
            let fresh = cached.fetched_at.elapsed() < self.ttl;
            if fresh && (!force_refresh || !self.try_claim_refresh()) {
                return Ok(cached.keys.clone());
            }
        } else {
            *self.last_fetch.lock() = Some(Instant::now());
        }

        debug!("Fetching JWKS from {certs_url}");
        let jwks: JwkSet = self
            .http
            .get(certs_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            certs_url.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }
}

/// Verifies access tokens issued by one realm for one client.
pub struct TokenVerifier {
    issuer: String,
    certs_url: String,
    client_id: String,
    verify_audience: bool,
    realm_key: Option<DecodingKey>,
    jwks: JwksCache,
}

impl TokenVerifier {
    /// Build from adapter config.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `realm-public-key` is not a valid RSA key.
    pub fn new(config: &KeycloakConfig, http: reqwest::Client) -> Result<Self> {
        let realm_key = config
            .realm_public_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(realm_public_key)
            .transpose()?;

        Ok(Self {
            issuer: config.realm_url(),
            certs_url: config.certs_endpoint(),
            client_id: config.resource.clone(),
            verify_audience: config.verify_token_audience,
            realm_key,
            jwks: JwksCache::new(
                http,
                Duration::from_secs(config.min_time_between_jwks_requests),
            ),
        })
    }

    /// Verify `token`'s signature and claims.
    ///
    /// # Errors
    ///
    /// [`VerifyError`] describing the first check that failed.
    pub async fn verify(&self, token: &Token) -> std::result::Result<(), VerifyError> {
        let header = jsonwebtoken::decode_header(token.raw())?;

        let key = match &self.realm_key {
            Some(key) => key.clone(),
            None => {
                let kid = header.kid.clone().ok_or(VerifyError::MissingKeyId)?;
                self.find_decoding_key(&kid).await?
            }
        };

        let mut validation = build_validation(&header);
        // iss and aud are checked below for clearer errors
        validation.validate_aud = false;
        jsonwebtoken::decode::<serde_json::Value>(token.raw(), &key, &validation)?;

        let content = token.content();
        let issuer = content.get("iss").and_then(|v| v.as_str()).unwrap_or("");
        if issuer != self.issuer {
            return Err(VerifyError::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: issuer.to_string(),
            });
        }

        if let Some(typ) = content.get("typ").and_then(|v| v.as_str()) {
            if !typ.eq_ignore_ascii_case("bearer") {
                return Err(VerifyError::WrongType(typ.to_string()));
            }
        }

        if self.verify_audience && !audience_contains(content.get("aud"), &self.client_id) {
            return Err(VerifyError::Audience);
        }

        Ok(())
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> std::result::Result<DecodingKey, VerifyError> {
        let jwks = self.jwks.get_or_fetch(&self.certs_url, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks.get_or_fetch(&self.certs_url, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| VerifyError::UnknownKeyId(kid.to_string()))
    }
}

/// Parse `realm-public-key` (base64 DER, as shown in the admin console).
fn realm_public_key(key: &str) -> Result<DecodingKey> {
    let body: String = key.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");

    DecodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| Error::Config(format!("keycloakConfig: invalid realm-public-key: {e}")))
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v
}

fn audience_contains(aud: Option<&serde_json::Value>, client_id: &str) -> bool {
    match aud {
        Some(serde_json::Value::String(s)) => s == client_id,
        Some(serde_json::Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(client_id)),
        _ => false,
    }
}
