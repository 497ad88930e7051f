//! Access tokens and grants.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use protect_expr::{EvalError, HostObject, Value, arity};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::verifier::VerifyError;

/// A parsed (not necessarily verified) Keycloak JWT.
#[derive(Debug, Clone)]
pub struct Token {
    raw: String,
    header: Json,
    content: Json,
    client_id: String,
}

impl Token {
    /// Split and decode `raw`. Signature and claims are not checked here.
    ///
    /// # Errors
    ///
    /// [`VerifyError::Malformed`] unless `raw` is three dot-separated parts
    /// whose first two are base64url JSON objects.
    pub fn parse(raw: &str, client_id: &str) -> Result<Self, VerifyError> {
        let mut parts = raw.split('.');
        let (Some(header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VerifyError::Malformed("expected three segments".to_string()));
        };

        Ok(Self {
            raw: raw.to_string(),
            header: decode_segment(header)?,
            content: decode_segment(payload)?,
            client_id: client_id.to_string(),
        })
    }

    /// The encoded JWT
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Decoded JOSE header
    #[must_use]
    pub fn header(&self) -> &Json {
        &self.header
    }

    /// Decoded claims
    #[must_use]
    pub fn content(&self) -> &Json {
        &self.content
    }

    /// Client id the token is evaluated against for unqualified roles
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `sub` claim
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.content.get("sub").and_then(Json::as_str)
    }

    /// `exp` claim in seconds since the epoch
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.content.get("exp").and_then(Json::as_i64)
    }

    /// Whether `exp` is in the past. Tokens without `exp` never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .is_some_and(|exp| exp < chrono::Utc::now().timestamp())
    }

    /// Check a role by qualified name.
    ///
    /// `realm:<role>` is a realm role, `<app>:<role>` a role of client `app`,
    /// and a bare `<role>` a role of this token's client.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        match name.split_once(':') {
            Some(("realm", role)) => self.has_realm_role(role),
            Some((app, role)) => self.has_application_role(app, role),
            None => self.has_application_role(&self.client_id, name),
        }
    }

    /// `realm_access.roles` contains `role`
    #[must_use]
    pub fn has_realm_role(&self, role: &str) -> bool {
        contains_role(self.content.pointer("/realm_access/roles"), role)
    }

    /// `resource_access.<app>.roles` contains `role`
    #[must_use]
    pub fn has_application_role(&self, app: &str, role: &str) -> bool {
        let roles = self
            .content
            .get("resource_access")
            .and_then(|access| access.get(app))
            .and_then(|client| client.get("roles"));
        contains_role(roles, role)
    }
}

fn decode_segment(segment: &str) -> Result<Json, VerifyError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| VerifyError::Malformed(format!("bad base64: {e}")))?;
    let value: Json = serde_json::from_slice(&bytes)
        .map_err(|e| VerifyError::Malformed(format!("bad JSON: {e}")))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(VerifyError::Malformed("segment is not an object".to_string()))
    }
}

fn contains_role(roles: Option<&Json>, role: &str) -> bool {
    roles
        .and_then(Json::as_array)
        .is_some_and(|roles| roles.iter().any(|r| r.as_str() == Some(role)))
}

fn role_arg<'a>(method: &str, arg: &'a Value) -> Result<&'a str, EvalError> {
    arg.as_str().ok_or_else(|| EvalError::Type {
        context: method.to_string(),
        expected: "string",
        found: arg.type_name().to_string(),
    })
}

impl HostObject for Token {
    fn type_name(&self) -> &'static str {
        "token"
    }

    fn get(&self, property: &str) -> Value {
        match property {
            "token" => Value::from(self.raw.as_str()),
            "header" => Value::from(&self.header),
            "content" => Value::from(&self.content),
            "clientId" => Value::from(self.client_id.as_str()),
            _ => Value::Undefined,
        }
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
        let result = match method {
            "hasRole" => arity(method, args, 1)
                .and_then(|()| role_arg(method, &args[0]))
                .map(|role| Value::Bool(self.has_role(role))),
            "hasRealmRole" => arity(method, args, 1)
                .and_then(|()| role_arg(method, &args[0]))
                .map(|role| Value::Bool(self.has_realm_role(role))),
            "hasApplicationRole" => arity(method, args, 2).and_then(|()| {
                let app = role_arg(method, &args[0])?;
                let role = role_arg(method, &args[1])?;
                Ok(Value::Bool(self.has_application_role(app, role)))
            }),
            "isExpired" => arity(method, args, 0).map(|()| Value::Bool(self.is_expired())),
            _ => return None,
        };
        Some(result)
    }
}

/// Tokens obtained for one user.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Access token; the one roles are checked against
    pub access_token: Token,
    /// Refresh token, encoded
    pub refresh_token: Option<String>,
    /// ID token, encoded
    pub id_token: Option<String>,
    /// Usually `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds at issue time
    pub expires_in: Option<u64>,
}

impl Grant {
    /// Grant carrying only an access token, as from an `Authorization` header.
    #[must_use]
    pub fn bearer(access_token: Token) -> Self {
        Self {
            access_token,
            refresh_token: None,
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in: None,
        }
    }

    /// Parse a token endpoint response or stored grant.
    ///
    /// # Errors
    ///
    /// [`VerifyError::Malformed`] if the access token cannot be decoded.
    pub fn from_raw(raw: &RawGrant, client_id: &str) -> Result<Self, VerifyError> {
        Ok(Self {
            access_token: Token::parse(&raw.access_token, client_id)?,
            refresh_token: raw.refresh_token.clone(),
            id_token: raw.id_token.clone(),
            token_type: raw.token_type.clone().unwrap_or_else(|| "Bearer".to_string()),
            expires_in: raw.expires_in,
        })
    }

    /// Serializable form, as stored in the session
    #[must_use]
    pub fn to_raw(&self) -> RawGrant {
        RawGrant {
            access_token: self.access_token.raw().to_string(),
            refresh_token: self.refresh_token.clone(),
            id_token: self.id_token.clone(),
            token_type: Some(self.token_type.clone()),
            expires_in: self.expires_in,
        }
    }
}

/// Wire form of a grant: the token endpoint's response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawGrant {
    /// Encoded access token
    pub access_token: String,
    /// Encoded refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Encoded ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use protect_expr::Expression;
    use serde_json::json;
    use std::collections::HashMap;

    /// Unsigned JWT with the given claims; good enough for parsing.
    pub(crate) fn unsigned(claims: &Json) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.sig")
    }

    fn token(claims: Json) -> Token {
        Token::parse(&unsigned(&claims), "gateway").unwrap()
    }

    fn sample() -> Token {
        token(json!({
            "sub": "user-1",
            "exp": chrono::Utc::now().timestamp() + 300,
            "realm_access": { "roles": ["user", "offline_access"] },
            "resource_access": {
                "gateway": { "roles": ["admin"] },
                "billing": { "roles": ["viewer"] }
            }
        }))
    }

    #[test]
    fn parses_segments() {
        let token = sample();
        assert_eq!(token.subject(), Some("user-1"));
        assert_eq!(token.header()["alg"], "RS256");
        assert_eq!(token.client_id(), "gateway");
        assert!(!token.is_expired());
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(matches!(Token::parse("abc", "c"), Err(VerifyError::Malformed(_))));
        assert!(matches!(Token::parse("a.b.c.d", "c"), Err(VerifyError::Malformed(_))));
        assert!(matches!(Token::parse("!!.!!.x", "c"), Err(VerifyError::Malformed(_))));
    }

    #[test]
    fn role_names_resolve_by_prefix() {
        let token = sample();

        assert!(token.has_role("admin"));
        assert!(token.has_role("realm:user"));
        assert!(token.has_role("billing:viewer"));

        assert!(!token.has_role("user"));
        assert!(!token.has_role("realm:admin"));
        assert!(!token.has_role("billing:admin"));
        assert!(!token.has_role("unknown:admin"));
    }

    #[test]
    fn missing_role_claims_mean_no_roles() {
        let token = token(json!({ "sub": "x" }));
        assert!(!token.has_role("admin"));
        assert!(!token.has_realm_role("user"));
        assert!(!token.is_expired());
    }

    #[test]
    fn expired_when_exp_in_past() {
        let token = token(json!({ "exp": 1 }));
        assert!(token.is_expired());
    }

    #[test]
    fn expressions_call_token_methods() {
        // GIVEN: the token bound as `token`
        let mut scope = HashMap::new();
        scope.insert("token".to_string(), Value::host(sample()));

        let check = |src: &str| Expression::parse(src).unwrap().evaluate(&scope);

        // THEN: role methods and properties are reachable
        assert_eq!(check("token.hasRole('admin')").unwrap(), Value::Bool(true));
        assert_eq!(check("token.hasRealmRole('admin')").unwrap(), Value::Bool(false));
        assert_eq!(
            check("token.hasApplicationRole('billing', 'viewer')").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(check("token.isExpired()").unwrap(), Value::Bool(false));
        assert_eq!(check("token.content.sub").unwrap(), Value::from("user-1"));
        assert_eq!(check("token.clientId").unwrap(), Value::from("gateway"));
    }

    #[test]
    fn wrong_arguments_are_evaluation_errors() {
        let mut scope = HashMap::new();
        scope.insert("token".to_string(), Value::host(sample()));

        let err = Expression::parse("token.hasRole()")
            .unwrap()
            .evaluate(&scope)
            .unwrap_err();
        assert!(matches!(err, EvalError::Arity { expected: 1, found: 0, .. }));

        let err = Expression::parse("token.hasRole(1)")
            .unwrap()
            .evaluate(&scope)
            .unwrap_err();
        assert!(matches!(err, EvalError::Type { .. }));
    }

    #[test]
    fn grant_converts_to_and_from_raw() {
        let raw = RawGrant {
            access_token: unsigned(&json!({ "sub": "u" })),
            refresh_token: Some("r".into()),
            id_token: None,
            token_type: None,
            expires_in: Some(300),
        };
        let grant = Grant::from_raw(&raw, "gateway").unwrap();
        assert_eq!(grant.token_type, "Bearer");

        let back = grant.to_raw();
        assert_eq!(back.access_token, raw.access_token);
        assert_eq!(back.refresh_token.as_deref(), Some("r"));
    }
}
