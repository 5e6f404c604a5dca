//! Tests for request guards

use super::middleware::*;
use super::revocation::{RevocationCheck, RevocationStatus};
use super::tokens::IdTokenContext;
use crate::error::OAuthError;
use crate::model::{ProfileClaims, RevocationReason, UserProfile};
use crate::storage::UserStorage;
use crate::utils::TestEnvironment;
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::extract::FromRef;
use axum::http::{Request, StatusCode, header};
use axum::{Json, Router, routing::get};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tower::ServiceExt;

/// Revocation check that can never answer
struct Unreachable;

#[async_trait]
impl RevocationCheck for Unreachable {
    async fn check(&self, _: &str, _: &str, _: Option<DateTime<Utc>>) -> RevocationStatus {
        RevocationStatus::Unavailable
    }
}

fn scopes() -> Vec<String> {
    vec!["openid".to_string(), "profile".to_string()]
}

fn context(role: &str) -> IdTokenContext {
    IdTokenContext {
        nonce: None,
        auth_time: Utc::now(),
        profile: ProfileClaims {
            name: Some("Ada".to_string()),
            role: Some(role.to_string()),
            ..Default::default()
        },
    }
}

fn guard(env: &TestEnvironment) -> ResourceGuard {
    ResourceGuard::new(
        env.deps.tokens.clone(),
        env.deps.revocation.clone(),
        env.deps.storage.clone(),
    )
}

fn access_token(env: &TestEnvironment, user: &str, role: &str) -> String {
    env.deps
        .tokens
        .issue(user, "c1", &scopes(), context(role))
        .unwrap()
        .access_token
}

#[tokio::test]
async fn test_valid_token_authenticates() {
    let env = TestEnvironment::new().await;
    let token = access_token(&env, "u1", "member");

    let user = guard(&env).authenticate(&token).await.unwrap();
    assert_eq!(user.user_id, "u1");
    assert_eq!(user.client_id, "c1");
    assert!(user.has_scope("profile"));
    assert_eq!(user.profile.name.as_deref(), Some("Ada"));
}

#[tokio::test]
async fn test_garbage_token_rejected() {
    let env = TestEnvironment::new().await;
    let err = guard(&env).authenticate("not.a.jwt").await.unwrap_err();
    assert!(matches!(err, OAuthError::InvalidToken(_)));
}

#[tokio::test]
async fn test_revoked_token_rejected() {
    let env = TestEnvironment::new().await;
    let token = access_token(&env, "u1", "member");
    let claims = env.deps.tokens.verify_access(&token).unwrap();

    env.deps
        .revocation
        .revoke_token(&claims, RevocationReason::Logout)
        .await
        .unwrap();

    let err = guard(&env).authenticate(&token).await.unwrap_err();
    assert_eq!(err, OAuthError::TokenRevoked);
}

#[tokio::test]
async fn test_revoke_all_rejects_earlier_tokens_only() {
    let env = TestEnvironment::new().await;
    let before = access_token(&env, "u1", "member");
    let other_user = access_token(&env, "u2", "member");

    env.deps
        .revocation
        .revoke_all_for_user("u1", RevocationReason::PasswordChange)
        .await
        .unwrap();

    let later = env
        .deps
        .tokens
        .issue_at("u1", "c1", &scopes(), context("member"), Utc::now() + Duration::seconds(5))
        .unwrap()
        .access_token;

    let guard = guard(&env);
    assert_eq!(
        guard.authenticate(&before).await.unwrap_err(),
        OAuthError::TokenRevoked
    );
    assert!(guard.authenticate(&other_user).await.is_ok());
    assert!(guard.authenticate(&later).await.is_ok());
}

#[tokio::test]
async fn test_unavailable_blacklist_fails_closed() {
    let env = TestEnvironment::new().await;
    let token = access_token(&env, "u1", "member");
    let guard = ResourceGuard::new(
        env.deps.tokens.clone(),
        Arc::new(Unreachable),
        env.deps.storage.clone(),
    );

    let err = guard.authenticate(&token).await.unwrap_err();
    assert_eq!(err, OAuthError::BlacklistCheckUnavailable);
    // Indistinguishable from a revocation on the wire
    assert_eq!(err.error_code(), OAuthError::TokenRevoked.error_code());
    assert_eq!(err.description(), OAuthError::TokenRevoked.description());
}

#[tokio::test]
async fn test_stored_profile_overrides_token_claims() {
    let env = TestEnvironment::new().await;
    let token = access_token(&env, "u1", "admin");

    env.deps
        .storage
        .save_user_profile(&UserProfile {
            id: "u1".to_string(),
            role: Some("member".to_string()),
            email: Some("ada@example.com".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let user = guard(&env).authenticate(&token).await.unwrap();
    assert!(!user.profile.has_role("admin"));
    assert_eq!(user.profile.email.as_deref(), Some("ada@example.com"));
    // Name only exists in the token
    assert_eq!(user.profile.name.as_deref(), Some("Ada"));
}

#[test]
fn test_service_keys() {
    let keys = ServiceKeys::new(vec!["alpha".to_string(), String::new(), "beta".to_string()]);
    assert!(keys.accepts("alpha"));
    assert!(keys.accepts("beta"));
    assert!(!keys.accepts(""));
    assert!(!keys.accepts("alph"));

    assert!(!ServiceKeys::default().accepts("alpha"));
    assert!(ServiceKeys::default().is_empty());
}

// ---------------------------------------------------------------------------
// Extractors through a router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct TestState {
    guard: ResourceGuard,
    keys: ServiceKeys,
}

impl FromRef<TestState> for ResourceGuard {
    fn from_ref(state: &TestState) -> Self {
        state.guard.clone()
    }
}

impl FromRef<TestState> for ServiceKeys {
    fn from_ref(state: &TestState) -> Self {
        state.keys.clone()
    }
}

fn router(env: &TestEnvironment) -> Router {
    Router::new()
        .route(
            "/me",
            get(|user: AuthenticatedUser| async move { Json(user.profile) }),
        )
        .route("/admin", get(|_: AdminUser| async { "ok" }))
        .route("/internal", get(|caller: ServiceCaller| async move { caller.key_id }))
        .with_state(TestState {
            guard: guard(env),
            keys: ServiceKeys::new(vec!["svc-key".to_string()]),
        })
}

fn get_with(uri: &str, name: header::HeaderName, value: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(name, value)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_missing_bearer_gets_challenge() {
    let env = TestEnvironment::new().await;
    let response = router(&env)
        .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
    assert!(challenge.starts_with("Bearer error=\"invalid_token\""));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "invalid_token");
}

#[tokio::test]
async fn test_bearer_reaches_handler() {
    let env = TestEnvironment::new().await;
    let token = access_token(&env, "u1", "member");

    let response = router(&env)
        .oneshot(get_with("/me", header::AUTHORIZATION, &format!("Bearer {token}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["sub"], "u1");
    assert_eq!(json["role"], "member");
}

#[tokio::test]
async fn test_admin_extractor() {
    let env = TestEnvironment::new().await;
    let member = access_token(&env, "u1", "member");
    let admin = access_token(&env, "u2", "admin");

    let response = router(&env)
        .oneshot(get_with("/admin", header::AUTHORIZATION, &format!("Bearer {member}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router(&env)
        .oneshot(get_with("/admin", header::AUTHORIZATION, &format!("Bearer {admin}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_service_caller_extractor() {
    let env = TestEnvironment::new().await;
    let key_header = header::HeaderName::from_static("x-service-key");

    let response = router(&env)
        .oneshot(get_with("/internal", key_header.clone(), "svc-key"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router(&env)
        .oneshot(get_with("/internal", key_header, "wrong"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router(&env)
        .oneshot(Request::builder().uri("/internal").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
