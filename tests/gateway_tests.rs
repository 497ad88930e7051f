//! End-to-end tests: the gateway with the Keycloak plugin in front of a mock
//! upstream, talking to a mock Keycloak token endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Form, Json, Router,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

use keycloak_gateway::config::{Config, PluginConfig};
use keycloak_gateway::gateway::Gateway;

const PRIVATE_KEY: &str = include_str!("fixtures/realm_rsa.pem");
const PUBLIC_KEY: &str = include_str!("fixtures/realm_public_key.txt");

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Access token for `sub` with client roles on `gateway`
fn access_token(issuer: &str, roles: &[&str]) -> String {
    access_token_expiring_in(issuer, roles, 300)
}

fn access_token_expiring_in(issuer: &str, roles: &[&str], seconds: i64) -> String {
    let claims = json!({
        "iss": issuer,
        "sub": "user-1",
        "typ": "Bearer",
        "azp": "gateway",
        "exp": chrono::Utc::now().timestamp() + seconds,
        "resource_access": { "gateway": { "roles": roles } }
    });
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY.as_bytes()).unwrap();
    encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
}

#[derive(Clone)]
struct MockRealm {
    issuer: String,
    refreshes: Arc<AtomicUsize>,
}

/// Token endpoint for the mock realm.
///
/// Codes: `good-code` grants `admin`; `stale-code` grants `admin` with an
/// access token that has just expired, refreshable with `refresh-1`;
/// `stale-no-refresh` is the same without a refresh token; `stale-revoked`
/// carries a refresh token the realm rejects.
async fn token_endpoint(
    State(realm): State<MockRealm>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let field = |name: &str| form.get(name).map(String::as_str);
    let rejected =
        || (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response();

    if field("client_id") != Some("gateway") {
        return rejected();
    }

    // Inside the verifier's leeway, so the exchange succeeds
    let stale = || access_token_expiring_in(&realm.issuer, &["admin"], -30);

    let body = match (field("grant_type"), field("code"), field("refresh_token")) {
        (Some("authorization_code"), Some("good-code"), _) => json!({
            "access_token": access_token(&realm.issuer, &["admin"]),
            "refresh_token": "refresh-1",
            "id_token": "id-1",
            "token_type": "Bearer",
            "expires_in": 300
        }),
        (Some("authorization_code"), Some("stale-code"), _) => json!({
            "access_token": stale(),
            "refresh_token": "refresh-1",
            "token_type": "Bearer"
        }),
        (Some("authorization_code"), Some("stale-no-refresh"), _) => json!({
            "access_token": stale(),
            "token_type": "Bearer"
        }),
        (Some("authorization_code"), Some("stale-revoked"), _) => json!({
            "access_token": stale(),
            "refresh_token": "revoked",
            "token_type": "Bearer"
        }),
        (Some("refresh_token"), _, Some(token)) => {
            realm.refreshes.fetch_add(1, Ordering::SeqCst);
            if token != "refresh-1" {
                return rejected();
            }
            json!({
                "access_token": access_token(&realm.issuer, &["admin"]),
                "refresh_token": "refresh-2",
                "token_type": "Bearer",
                "expires_in": 300
            })
        }
        _ => return rejected(),
    };
    Json(body).into_response()
}

async fn upstream(request: Request<Body>) -> String {
    format!("upstream {}", request.uri().path())
}

struct Harness {
    router: Router,
    issuer: String,
    keycloak: SocketAddr,
    refreshes: Arc<AtomicUsize>,
}

impl Harness {
    async fn start(bearer_only: bool) -> Self {
        let backend = spawn(Router::new().fallback(upstream)).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let keycloak = listener.local_addr().unwrap();
        let issuer = format!("http://{keycloak}/realms/demo");
        let refreshes = Arc::new(AtomicUsize::new(0));
        let mock = Router::new()
            .route("/realms/demo/protocol/openid-connect/token", post(token_endpoint))
            .with_state(MockRealm {
                issuer: issuer.clone(),
                refreshes: Arc::clone(&refreshes),
            });
        tokio::spawn(async move {
            axum::serve(listener, mock).await.unwrap();
        });

        let mut config = Config::from_yaml(&format!(
            r"
api_endpoints:
  admin:
    paths: ['/admin/*']
  reports:
    paths: ['/reports/*']
service_endpoints:
  backend:
    url: http://{backend}
pipelines:
  admin:
    api_endpoints: [admin]
    service_endpoint: backend
    policies:
      - keycloak-protect:
          - action:
              role: admin
  reports:
    api_endpoints: [reports]
    service_endpoint: backend
    policies:
      - keycloak-protect:
          jsProtectTokenVar: kc
          jsProtect: kc.hasRole('admin') && req.method === 'GET'
"
        ))
        .unwrap();

        config.plugins.insert(
            "keycloak".to_string(),
            PluginConfig {
                settings: json!({
                    "session": { "secret": "test-secret" },
                    "keycloakConfig": {
                        "realm": "demo",
                        "auth-server-url": format!("http://{keycloak}"),
                        "resource": "gateway",
                        "public-client": true,
                        "bearer-only": bearer_only,
                        "realm-public-key": PUBLIC_KEY.trim()
                    }
                }),
            },
        );

        let gateway = Gateway::new(config).await.unwrap();
        Self {
            router: gateway.router(),
            issuer,
            keycloak,
            refreshes,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str, bearer: Option<&str>, cookie: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri).header(header::HOST, "gw.test");
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Browser login on `path` completed with `code`; returns the session cookie.
    async fn login(&self, path: &str, code: &str) -> String {
        let response = self.get(path, None, None).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let state = query(&location(&response))["state"].clone();
        let cookie = session_cookie(&response);

        let callback = format!("{path}?auth_callback=1&code={code}&state={state}");
        let response = self.get(&callback, None, Some(&cookie)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        cookie
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

async fn text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn location(response: &Response) -> url::Url {
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    url::Url::parse(location).unwrap()
}

fn session_cookie(response: &Response) -> String {
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

fn query(url: &url::Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

#[tokio::test]
async fn health_is_public() {
    let harness = Harness::start(true).await;

    let response = harness.get("/health", None, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&text(response).await).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pipelines"], 2);
}

#[tokio::test]
async fn role_mode_denies_user_without_role() {
    // GIVEN: { role: admin } and a user with only "viewer"
    let harness = Harness::start(true).await;
    let token = access_token(&harness.issuer, &["viewer"]);

    // WHEN: the user calls the protected route
    let response = harness.get("/admin/users", Some(&token), None).await;

    // THEN: 403 with the fixed body; upstream never sees it
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(text(response).await, "Access Denied");
}

#[tokio::test]
async fn role_mode_allows_user_with_role() {
    let harness = Harness::start(true).await;
    let token = access_token(&harness.issuer, &["admin"]);

    let response = harness.get("/admin/users", Some(&token), None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "upstream /admin/users");
}

#[tokio::test]
async fn expression_mode_allows_user_with_role() {
    // GIVEN: jsProtect over a custom token variable and the request
    let harness = Harness::start(true).await;
    let token = access_token(&harness.issuer, &["admin"]);

    // WHEN: an admin issues a GET
    let response = harness.get("/reports/daily", Some(&token), None).await;

    // THEN: the expression holds and the request is proxied
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "upstream /reports/daily");
}

#[tokio::test]
async fn expression_mode_denies_when_expression_is_false() {
    let harness = Harness::start(true).await;
    let token = access_token(&harness.issuer, &["admin"]);

    // req.method === 'GET' fails for POST
    let request = Request::builder()
        .method("POST")
        .uri("/reports/daily")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(text(response).await, "Access Denied");
}

#[tokio::test]
async fn token_from_another_realm_is_not_a_grant() {
    let harness = Harness::start(true).await;
    let token = access_token("http://elsewhere/realms/demo", &["admin"]);

    let response = harness.get("/admin/users", Some(&token), None).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bearer_only_without_token_is_denied() {
    let harness = Harness::start(true).await;

    let response = harness.get("/admin/users", None, None).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(text(response).await, "Access Denied");
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let harness = Harness::start(true).await;

    let response = harness.get("/nowhere", None, None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn browser_login_round_trip() {
    let harness = Harness::start(false).await;

    // GIVEN: an anonymous browser request
    let response = harness.get("/reports/daily", None, None).await;

    // THEN: redirected to Keycloak with a session cookie holding the state
    assert_eq!(response.status(), StatusCode::FOUND);
    let login = location(&response);
    assert_eq!(
        login.as_str().split('?').next().unwrap(),
        format!(
            "http://{}/realms/demo/protocol/openid-connect/auth",
            harness.keycloak
        )
    );
    let params = query(&login);
    assert_eq!(params["client_id"], "gateway");
    assert_eq!(params["response_type"], "code");
    assert_eq!(params["redirect_uri"], "http://gw.test/reports/daily?auth_callback=1");
    let cookie = session_cookie(&response);
    assert!(cookie.starts_with("connect.sid=s%3A"));

    // WHEN: Keycloak sends the browser back with a code
    let callback = format!(
        "/reports/daily?auth_callback=1&code=good-code&state={}",
        params["state"]
    );
    let response = harness.get(&callback, None, Some(&cookie)).await;

    // THEN: the grant is stored and the callback parameters are dropped
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response).as_str(), "http://gw.test/reports/daily");

    // WHEN: the browser follows the redirect with its cookie
    let response = harness.get("/reports/daily", None, Some(&cookie)).await;

    // THEN: the session grant authorizes the request
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "upstream /reports/daily");
}

#[tokio::test]
async fn callback_with_wrong_state_is_denied() {
    let harness = Harness::start(false).await;

    let response = harness.get("/admin/users", None, None).await;
    let cookie = session_cookie(&response);

    let response = harness
        .get(
            "/admin/users?auth_callback=1&code=good-code&state=forged",
            None,
            Some(&cookie),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn callback_with_rejected_code_is_denied() {
    let harness = Harness::start(false).await;

    let response = harness.get("/admin/users", None, None).await;
    let state = query(&location(&response))["state"].clone();
    let cookie = session_cookie(&response);

    let response = harness
        .get(
            &format!("/admin/users?auth_callback=1&code=bad-code&state={state}"),
            None,
            Some(&cookie),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn callback_without_prior_login_redirect_is_denied() {
    // GIVEN: a callback URL carrying a valid code but no login this browser started
    let harness = Harness::start(false).await;

    // WHEN: it arrives without a session
    let response = harness
        .get("/admin/users?auth_callback=1&code=good-code&state=forged", None, None)
        .await;

    // THEN: denied, and no authenticated session comes out of it
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(text(response).await, "Access Denied");
}

#[tokio::test]
async fn callback_after_completed_login_is_denied() {
    // GIVEN: a session whose login already consumed its state
    let harness = Harness::start(false).await;
    let cookie = harness.login("/admin/users", "good-code").await;

    // WHEN: a second callback reuses that cookie with a made-up state
    let response = harness
        .get(
            "/admin/users?auth_callback=1&code=good-code&state=forged",
            None,
            Some(&cookie),
        )
        .await;

    // THEN: denied
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn expired_session_grant_is_refreshed_and_stored() {
    // GIVEN: a session whose access token has just expired
    let harness = Harness::start(false).await;
    let cookie = harness.login("/admin/users", "stale-code").await;

    // WHEN: the browser comes back
    let response = harness.get("/admin/users", None, Some(&cookie)).await;

    // THEN: the grant is refreshed and the request goes through
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "upstream /admin/users");
    assert_eq!(harness.refreshes(), 1);

    // AND: the refreshed grant was stored, so no second refresh is needed
    let response = harness.get("/admin/users", None, Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(harness.refreshes(), 1);
}

#[tokio::test]
async fn expired_grant_without_refresh_token_is_dropped() {
    let harness = Harness::start(false).await;
    let cookie = harness.login("/admin/users", "stale-no-refresh").await;

    let response = harness.get("/admin/users", None, Some(&cookie)).await;

    // Back to the login page; the realm was never asked
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).path().ends_with("/openid-connect/auth"));
    assert_eq!(harness.refreshes(), 0);
}

#[tokio::test]
async fn rejected_refresh_drops_the_grant() {
    // GIVEN: an expired grant whose refresh token the realm rejects
    let harness = Harness::start(false).await;
    let cookie = harness.login("/admin/users", "stale-revoked").await;

    // WHEN: the browser comes back
    let response = harness.get("/admin/users", None, Some(&cookie)).await;

    // THEN: sent to login after one refresh attempt
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(location(&response).path().ends_with("/openid-connect/auth"));
    assert_eq!(harness.refreshes(), 1);

    // AND: the grant is gone, so the next request does not retry the refresh
    let response = harness.get("/admin/users", None, Some(&cookie)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(harness.refreshes(), 1);
}

#[tokio::test]
async fn logout_redirects_to_keycloak() {
    let harness = Harness::start(false).await;

    let response = harness.get("/logout", None, None).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    let logout = location(&response);
    assert_eq!(
        logout.path(),
        "/realms/demo/protocol/openid-connect/logout"
    );
    let params = query(&logout);
    assert_eq!(params["client_id"], "gateway");
    assert_eq!(params["post_logout_redirect_uri"], "http://gw.test/");
}
