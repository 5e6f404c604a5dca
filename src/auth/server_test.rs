//! Endpoint tests for the OAuth router

use super::clients::ClientSpec;
use super::codes::pkce_challenge;
use super::server::*;
use super::tokens::IdTokenContext;
use crate::constants::{HEADER_SERVICE_KEY, IDENTITY_COOKIE, PENDING_COOKIE};
use crate::model::ProfileClaims;
use crate::utils::{TEST_ISSUER, TEST_SERVICE_KEY, TestEnvironment};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode, header};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

const VERIFIER: &str = "server-test-verifier-0123456789-abcdefghijklmnopqrstuvwxyz";

struct Fixture {
    env: TestEnvironment,
    router: Router,
    client_id: String,
    client_secret: String,
}

async fn fixture() -> Fixture {
    let env = TestEnvironment::new().await;
    let registered = env
        .deps
        .clients
        .register(ClientSpec {
            name: "App".to_string(),
            redirect_uris: vec!["https://app/cb".to_string()],
            allowed_scopes: vec!["openid".to_string(), "profile".to_string()],
            confidential: true,
            allow_duplicate_name: false,
        })
        .await
        .unwrap();
    let router = create_oauth_routes(Arc::new(OAuthServerState::new(env.deps.clone())));
    Fixture {
        env,
        router,
        client_id: registered.client.id,
        client_secret: registered.client_secret.unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn location(response: &Response<Body>) -> String {
    response.headers()[header::LOCATION].to_str().unwrap().to_string()
}

/// `name=value` of the first `Set-Cookie` for `name`
fn cookie_pair(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter(|v| v.starts_with(&format!("{name}=")))
        .filter_map(|v| v.split(';').next())
        .map(str::to_string)
        .next()
}

fn query_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location)
        .or_else(|_| url::Url::parse(&format!("{TEST_ISSUER}{location}")))
        .unwrap();
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn authorize_uri(client_id: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", "https://app/cb")
        .append_pair("response_type", "code")
        .append_pair("scope", "openid profile")
        .append_pair("state", "xyz")
        .append_pair("code_challenge", &pkce_challenge(VERIFIER))
        .append_pair("code_challenge_method", "S256")
        .finish();
    format!("/oauth/authorize?{query}")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

fn bearer(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn bearer_json(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn service_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(HEADER_SERVICE_KEY, TEST_SERVICE_KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn token_form(pairs: &[(&str, &str)]) -> Request<Body> {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        form.append_pair(k, v);
    }
    Request::builder()
        .method("POST")
        .uri("/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form.finish()))
        .unwrap()
}

fn user_token(f: &Fixture, user: &str, role: &str) -> String {
    f.env
        .deps
        .tokens
        .issue(
            user,
            &f.client_id,
            &["openid".to_string(), "profile".to_string()],
            IdTokenContext {
                nonce: None,
                auth_time: Utc::now(),
                profile: ProfileClaims {
                    name: Some("Ada".to_string()),
                    role: Some(role.to_string()),
                    ..Default::default()
                },
            },
        )
        .unwrap()
        .access_token
}

/// Walk the browser through login and return the identity cookie
async fn login(f: &Fixture) -> String {
    let response = send(&f.router, get(&authorize_uri(&f.client_id))).await;
    let pending = cookie_pair(&response, PENDING_COOKIE).unwrap();

    let response = send(
        &f.router,
        service_json("POST", "/internal/login/tickets", json!({"userId": "u1", "name": "Ada"})),
    )
    .await;
    let ticket = json_body(response).await["ticket"].as_str().unwrap().to_string();

    let response = send(
        &f.router,
        get_with_cookie(&format!("/oauth/login/callback?ticket={ticket}"), &pending),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    cookie_pair(&response, IDENTITY_COOKIE).unwrap()
}

/// Full browser flow ending in a token response
async fn obtain_tokens(f: &Fixture) -> Value {
    let identity = login(f).await;
    let response = send(&f.router, get_with_cookie(&authorize_uri(&f.client_id), &identity)).await;
    let code = query_param(&location(&response), "code").unwrap();

    let response = send(
        &f.router,
        token_form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", "https://app/cb"),
            ("client_id", f.client_id.as_str()),
            ("client_secret", f.client_secret.as_str()),
            ("code_verifier", VERIFIER),
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn test_discovery_document() {
    let f = fixture().await;
    let response = send(&f.router, get("/.well-known/openid-configuration")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc = json_body(response).await;
    assert_eq!(doc["issuer"], TEST_ISSUER);
    assert_eq!(doc["token_endpoint"], format!("{TEST_ISSUER}/oauth/token"));
    assert_eq!(doc["code_challenge_methods_supported"], json!(["S256"]));
    assert!(
        doc["scopes_supported"]
            .as_array()
            .unwrap()
            .contains(&json!("openid"))
    );
}

#[tokio::test]
async fn test_authorize_without_login_redirects_to_login_service() {
    let f = fixture().await;
    let response = send(&f.router, get(&authorize_uri(&f.client_id))).await;

    assert_eq!(response.status(), StatusCode::FOUND);
    let target = location(&response);
    assert!(target.starts_with("https://login.test/signin"));
    assert_eq!(
        query_param(&target, "callback").as_deref(),
        Some("https://auth.test/oauth/login/callback")
    );
    assert_eq!(query_param(&target, "client_id"), Some(f.client_id.clone()));
    assert!(cookie_pair(&response, PENDING_COOKIE).is_some());
}

#[tokio::test]
async fn test_authorize_unknown_client_renders_error() {
    let f = fixture().await;
    let response = send(&f.router, get(&authorize_uri("nope"))).await;

    // Never redirect to an unverified redirect_uri
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::LOCATION).is_none());
    assert_eq!(json_body(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_login_callback_requires_pending_request() {
    let f = fixture().await;
    let ticket = f
        .env
        .deps
        .tokens
        .issue_service_token("x", &[])
        .unwrap()
        .access_token;

    let response = send(&f.router, get(&format!("/oauth/login/callback?ticket={ticket}"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn test_login_ticket_requires_service_key() {
    let f = fixture().await;
    let request = Request::builder()
        .method("POST")
        .uri("/internal/login/tickets")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"userId": "u1"}).to_string()))
        .unwrap();

    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_browser_flow_issues_tokens() {
    let f = fixture().await;
    let identity = login(&f).await;

    let response = send(&f.router, get_with_cookie(&authorize_uri(&f.client_id), &identity)).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let target = location(&response);
    assert!(target.starts_with("https://app/cb?"));
    assert_eq!(query_param(&target, "state").as_deref(), Some("xyz"));
    let code = query_param(&target, "code").unwrap();

    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", "https://app/cb"),
        ("client_id", f.client_id.as_str()),
        ("client_secret", f.client_secret.as_str()),
        ("code_verifier", VERIFIER),
    ];
    let response = send(&f.router, token_form(&form)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    let tokens = json_body(response).await;
    assert_eq!(tokens["token_type"], "Bearer");
    assert!(tokens["id_token"].is_string());
    assert_eq!(tokens["scope"], "openid profile");

    // Codes are single use
    let response = send(&f.router, token_form(&form)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "invalid_grant");
}

#[tokio::test]
async fn test_token_endpoint_errors() {
    let f = fixture().await;

    let response = send(&f.router, token_form(&[("grant_type", "password")])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(json_body(response).await["error"], "unsupported_grant_type");

    let response = send(
        &f.router,
        token_form(&[
            ("grant_type", "client_credentials"),
            ("client_id", f.client_id.as_str()),
            ("client_secret", "wrong"),
        ]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn test_client_credentials_with_basic_auth() {
    let f = fixture().await;
    let basic = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        format!("{}:{}", f.client_id, f.client_secret),
    );
    let request = Request::builder()
        .method("POST")
        .uri("/oauth/token")
        .header(header::AUTHORIZATION, format!("Basic {basic}"))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("grant_type=client_credentials&scope=profile"))
        .unwrap();

    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = json_body(response).await;
    assert!(tokens.get("id_token").is_none());
    assert!(tokens.get("refresh_token").is_none());
}

#[tokio::test]
async fn test_userinfo() {
    let f = fixture().await;
    let tokens = obtain_tokens(&f).await;
    let access = tokens["access_token"].as_str().unwrap();

    let response = send(&f.router, bearer("GET", "/oauth/userinfo", access)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let profile = json_body(response).await;
    assert_eq!(profile["sub"], "u1");
    assert_eq!(profile["name"], "Ada");

    let response = send(&f.router, get("/oauth/userinfo")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_userinfo_requires_openid_scope() {
    let f = fixture().await;
    let access = f
        .env
        .deps
        .tokens
        .issue_service_token(&f.client_id, &["profile".to_string()])
        .unwrap()
        .access_token;

    let response = send(&f.router, bearer("GET", "/oauth/userinfo", &access)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_sessions_list_and_delete() {
    let f = fixture().await;
    let tokens = obtain_tokens(&f).await;
    let access = tokens["access_token"].as_str().unwrap();

    let response = send(&f.router, bearer("GET", "/oauth/sessions", access)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let sessions = json_body(response).await;
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    let id = sessions[0]["id"].as_str().unwrap().to_string();

    let response = send(&f.router, bearer("DELETE", "/oauth/sessions/unknown", access)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&f.router, bearer("DELETE", &format!("/oauth/sessions/{id}"), access)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The session's access token is gone with it
    let response = send(&f.router, bearer("GET", "/oauth/userinfo", access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_revokes_token_and_clears_cookie() {
    let f = fixture().await;
    let tokens = obtain_tokens(&f).await;
    let access = tokens["access_token"].as_str().unwrap();

    let response = send(&f.router, bearer("POST", "/oauth/logout", access)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cleared = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .any(|v| v.to_str().unwrap().contains("Max-Age=0"));
    assert!(cleared);

    let response = send(&f.router, bearer("GET", "/oauth/userinfo", access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "invalid_token");
}

#[tokio::test]
async fn test_client_admin_requires_admin_role() {
    let f = fixture().await;
    let member = user_token(&f, "u2", "member");

    let response = send(&f.router, bearer("GET", "/oauth/clients", &member)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "access_denied");
}

#[tokio::test]
async fn test_client_admin_lifecycle() {
    let f = fixture().await;
    let admin = user_token(&f, "root", "admin");

    let response = send(
        &f.router,
        bearer_json(
            "POST",
            "/oauth/clients",
            &admin,
            json!({
                "name": "Reports",
                "redirect_uris": ["https://reports/cb"],
                "allowed_scopes": ["openid"],
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert!(created["client_secret"].is_string());
    assert!(created.get("secret_hash").is_none());

    let response = send(&f.router, bearer("GET", "/oauth/clients", &admin)).await;
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

    let response = send(
        &f.router,
        bearer_json(
            "PUT",
            &format!("/oauth/clients/{id}"),
            &admin,
            json!({"name": "Reporting"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["name"], "Reporting");

    let response = send(
        &f.router,
        bearer("POST", &format!("/oauth/clients/{id}/regenerate-secret"), &admin),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json_body(response).await;
    assert_eq!(rotated["clientId"], id);
    assert_ne!(rotated["clientSecret"], created["client_secret"]);

    let response = send(&f.router, bearer("DELETE", &format!("/oauth/clients/{id}"), &admin)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!f.env.deps.clients.find(&id).await.unwrap().active);
}

#[tokio::test]
async fn test_signing_key_rotation() {
    let f = fixture().await;
    let admin = user_token(&f, "root", "admin");
    let member = user_token(&f, "u2", "member");
    let secret = "rotated-signing-secret-0123456789abcdef";

    let response = send(
        &f.router,
        bearer_json("POST", "/oauth/keys/rotate", &member, json!({"secret": secret})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = send(
        &f.router,
        bearer_json("POST", "/oauth/keys/rotate", &admin, json!({"secret": "short"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &f.router,
        bearer_json("POST", "/oauth/keys/rotate", &admin, json!({"secret": secret})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json_body(response).await;
    let kid = rotated["kid"].as_str().unwrap().to_string();
    assert_eq!(rotated["keyIds"].as_array().unwrap().len(), 2);
    assert_eq!(f.env.deps.keys.signing_key().0, kid);

    // Tokens signed before the rotation still verify
    let response = send(&f.router, bearer("GET", "/oauth/clients", &admin)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let fresh = user_token(&f, "root", "admin");
    let response = send(&f.router, bearer("GET", "/oauth/clients", &fresh)).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_check_blacklist() {
    let f = fixture().await;
    let check = json!({"jti": "j-1", "userId": "u1"});

    let response = send(&f.router, service_json("POST", "/token/check-blacklist", check.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["blacklisted"], false);

    f.env
        .deps
        .revocation
        .revoke(
            "j-1",
            "u1",
            crate::model::RevocationReason::Manual,
            chrono::Duration::hours(1),
        )
        .await
        .unwrap();

    let response = send(&f.router, service_json("POST", "/token/check-blacklist", check.clone())).await;
    assert_eq!(json_body(response).await["blacklisted"], true);

    let request = Request::builder()
        .method("POST")
        .uri("/token/check-blacklist")
        .header(HEADER_SERVICE_KEY, "wrong-key")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(check.to_string()))
        .unwrap();
    let response = send(&f.router, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_profile_push_revokes_on_role_change() {
    let f = fixture().await;

    let response = send(
        &f.router,
        service_json("PUT", "/internal/users/u9", json!({"name": "Bo", "role": "member"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["tokensRevoked"], false);

    let access = user_token(&f, "u9", "member");
    let response = send(&f.router, bearer("GET", "/oauth/userinfo", &access)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["name"], "Bo");

    // Same privileges, new name: tokens stay valid
    let response = send(
        &f.router,
        service_json("PUT", "/internal/users/u9", json!({"name": "Bob", "role": "member"})),
    )
    .await;
    assert_eq!(json_body(response).await["tokensRevoked"], false);

    let response = send(
        &f.router,
        service_json("PUT", "/internal/users/u9", json!({"name": "Bob", "role": "admin"})),
    )
    .await;
    assert_eq!(json_body(response).await["tokensRevoked"], true);

    let response = send(&f.router, bearer("GET", "/oauth/userinfo", &access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_revoke_all_endpoint() {
    let f = fixture().await;
    let access = user_token(&f, "u3", "member");

    let response = send(
        &f.router,
        service_json(
            "POST",
            "/internal/users/u3/revoke-all",
            json!({"reason": "password_change"}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&f.router, bearer("GET", "/oauth/userinfo", &access)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
