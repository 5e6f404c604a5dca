use super::clients::ClientSpec;
use super::codes::{AuthorizationRequest, pkce_challenge};
use super::flow::*;
use crate::error::OAuthError;
use crate::model::{ProfileClaims, UserProfile};
use crate::storage::{SessionStorage, UserStorage};
use crate::utils::TestEnvironment;
use chrono::Utc;

const VERIFIER: &str = "flow-test-verifier-0123456789-abcdefghijklmnopqrstuvwxyz";

struct Fixture {
    env: TestEnvironment,
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
    Fixture {
        env,
        client_id: registered.client.id,
        client_secret: registered.client_secret.unwrap(),
    }
}

fn identity() -> Identity {
    Identity {
        user_id: "u1".to_string(),
        auth_time: Utc::now(),
        claims: ProfileClaims {
            name: Some("Ada".to_string()),
            role: Some("admin".to_string()),
            ..Default::default()
        },
    }
}

fn request(client_id: &str) -> AuthorizationRequest {
    AuthorizationRequest {
        client_id: client_id.to_string(),
        redirect_uri: "https://app/cb".to_string(),
        response_type: "code".to_string(),
        scope: Some("openid profile".to_string()),
        state: Some("xyz".to_string()),
        code_challenge: Some(pkce_challenge(VERIFIER)),
        code_challenge_method: Some("S256".to_string()),
        nonce: Some("n-1".to_string()),
    }
}

fn query_param(location: &str, name: &str) -> Option<String> {
    url::Url::parse(location)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

async fn authorize_code(f: &Fixture) -> String {
    let outcome = f
        .env
        .deps
        .flow
        .authorize(request(&f.client_id), Some(&identity()))
        .await
        .unwrap();
    let AuthorizeOutcome::Redirect { location } = outcome else {
        panic!("expected redirect, got {outcome:?}");
    };
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
    query_param(&location, "code").unwrap()
}

fn token_request(f: &Fixture, code: &str) -> TokenRequest {
    TokenRequest {
        grant_type: "authorization_code".to_string(),
        code: Some(code.to_string()),
        redirect_uri: Some("https://app/cb".to_string()),
        client_id: Some(f.client_id.clone()),
        client_secret: Some(f.client_secret.clone()),
        code_verifier: Some(VERIFIER.to_string()),
        scope: None,
    }
}

#[test]
fn test_state_transitions() {
    use FlowState::*;
    assert!(Start.can_transition_to(Validated));
    assert!(Validated.can_transition_to(AwaitingLogin));
    assert!(Validated.can_transition_to(CodeIssued));
    assert!(CodeIssued.can_transition_to(TokenExchanged));
    assert!(TokenExchanged.can_transition_to(SessionEstablished));
    assert!(CodeIssued.can_transition_to(Error));

    assert!(!Start.can_transition_to(CodeIssued));
    assert!(!AwaitingLogin.can_transition_to(TokenExchanged));
    assert!(!SessionEstablished.can_transition_to(CodeIssued));
    assert!(!Error.can_transition_to(Validated));
}

#[tokio::test]
async fn test_authorize_without_identity_requires_login() {
    let f = fixture().await;
    let outcome = f
        .env
        .deps
        .flow
        .authorize(request(&f.client_id), None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AuthorizeOutcome::LoginRequired {
            request: request(&f.client_id)
        }
    );
}

#[tokio::test]
async fn test_untrusted_client_or_redirect_is_rendered() {
    let f = fixture().await;

    let mut unknown = request("nobody");
    unknown.redirect_uri = "https://evil/cb".to_string();
    let outcome = f.env.deps.flow.authorize(unknown, Some(&identity())).await.unwrap();
    assert!(matches!(
        outcome,
        AuthorizeOutcome::RenderError {
            error: OAuthError::InvalidClient(_)
        }
    ));

    let mut wrong_uri = request(&f.client_id);
    wrong_uri.redirect_uri = "https://evil/cb".to_string();
    let outcome = f.env.deps.flow.authorize(wrong_uri, Some(&identity())).await.unwrap();
    assert!(matches!(
        outcome,
        AuthorizeOutcome::RenderError {
            error: OAuthError::InvalidRedirectUri(_)
        }
    ));
}

#[tokio::test]
async fn test_trusted_errors_redirect_with_state() {
    let f = fixture().await;
    let mut req = request(&f.client_id);
    req.scope = Some("openid admin".to_string());

    let outcome = f.env.deps.flow.authorize(req, Some(&identity())).await.unwrap();
    let AuthorizeOutcome::Redirect { location } = outcome else {
        panic!("expected redirect");
    };
    assert!(location.starts_with("https://app/cb?"));
    assert_eq!(query_param(&location, "error").as_deref(), Some("invalid_scope"));
    assert_eq!(query_param(&location, "state").as_deref(), Some("xyz"));
    assert!(query_param(&location, "code").is_none());
}

#[tokio::test]
async fn test_full_exchange_records_session() {
    let f = fixture().await;
    let code = authorize_code(&f).await;

    let response = f
        .env
        .deps
        .flow
        .exchange(token_request(&f, &code), None)
        .await
        .unwrap();
    assert_eq!(response.token_type, "Bearer");
    assert_eq!(response.scope, "openid profile");

    let access = f.env.deps.tokens.verify_access(&response.access_token).unwrap();
    assert_eq!(access.sub, "u1");
    assert_eq!(access.client_id, f.client_id);

    let id = f
        .env
        .deps
        .tokens
        .verify_id(response.id_token.as_deref().unwrap(), &f.client_id)
        .unwrap();
    assert_eq!(id.nonce.as_deref(), Some("n-1"));
    assert_eq!(id.profile.name.as_deref(), Some("Ada"));

    let sessions = f.env.deps.storage.list_sessions("u1", None).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].access_jti.as_deref(), Some(access.jti.as_str()));
}

#[tokio::test]
async fn test_second_exchange_of_same_code_fails() {
    let f = fixture().await;
    let code = authorize_code(&f).await;

    assert!(f.env.deps.flow.exchange(token_request(&f, &code), None).await.is_ok());
    let err = f
        .env
        .deps
        .flow
        .exchange(token_request(&f, &code), None)
        .await
        .unwrap_err();
    assert_eq!(err, OAuthError::InvalidOrExpiredCode);
    assert_eq!(err.error_code(), "invalid_grant");
}

#[tokio::test]
async fn test_exchange_uses_stored_profile_over_login_claims() {
    let f = fixture().await;
    f.env
        .deps
        .storage
        .save_user_profile(&UserProfile {
            id: "u1".to_string(),
            name: Some("Ada Lovelace".to_string()),
            role: Some("member".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let code = authorize_code(&f).await;
    let response = f
        .env
        .deps
        .flow
        .exchange(token_request(&f, &code), None)
        .await
        .unwrap();

    let access = f.env.deps.tokens.verify_access(&response.access_token).unwrap();
    assert_eq!(access.profile.name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(access.profile.role.as_deref(), Some("member"));
}

#[tokio::test]
async fn test_exchange_client_authentication() {
    let f = fixture().await;

    let code = authorize_code(&f).await;
    let mut bad_secret = token_request(&f, &code);
    bad_secret.client_secret = Some("wrong".to_string());
    let err = f.env.deps.flow.exchange(bad_secret, None).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_client");

    // The failed authentication did not consume the code
    let basic = BasicCredentials {
        client_id: f.client_id.clone(),
        client_secret: f.client_secret.clone(),
    };
    let mut via_basic = token_request(&f, &code);
    via_basic.client_secret = None;
    assert!(f.env.deps.flow.exchange(via_basic, Some(basic)).await.is_ok());
}

#[tokio::test]
async fn test_exchange_rejects_bad_verifier_and_redirect() {
    let f = fixture().await;

    let code = authorize_code(&f).await;
    let mut req = token_request(&f, &code);
    req.code_verifier = Some("z".repeat(50));
    let err = f.env.deps.flow.exchange(req, None).await.unwrap_err();
    assert!(matches!(err, OAuthError::PkceMismatch(_)));

    let code = authorize_code(&f).await;
    let mut req = token_request(&f, &code);
    req.redirect_uri = Some("https://app/other".to_string());
    let err = f.env.deps.flow.exchange(req, None).await.unwrap_err();
    assert_eq!(err, OAuthError::RedirectUriMismatch);
}

#[tokio::test]
async fn test_unsupported_grants() {
    let f = fixture().await;
    let mut req = token_request(&f, "whatever");
    req.grant_type = "refresh_token".to_string();
    let err = f.env.deps.flow.exchange(req, None).await.unwrap_err();
    assert!(matches!(err, OAuthError::UnsupportedGrantType(_)));

    let mut req = token_request(&f, "whatever");
    req.grant_type = String::new();
    let err = f.env.deps.flow.exchange(req, None).await.unwrap_err();
    assert!(matches!(err, OAuthError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_client_credentials_grant() {
    let f = fixture().await;
    let req = TokenRequest {
        grant_type: "client_credentials".to_string(),
        client_id: Some(f.client_id.clone()),
        client_secret: Some(f.client_secret.clone()),
        scope: Some("profile".to_string()),
        ..Default::default()
    };

    let response = f.env.deps.flow.exchange(req.clone(), None).await.unwrap();
    assert!(response.refresh_token.is_none());
    assert!(response.id_token.is_none());
    let access = f.env.deps.tokens.verify_access(&response.access_token).unwrap();
    assert_eq!(access.sub, format!("client:{}", f.client_id));

    let mut too_wide = req.clone();
    too_wide.scope = Some("admin".to_string());
    let err = f.env.deps.flow.exchange(too_wide, None).await.unwrap_err();
    assert!(matches!(err, OAuthError::InvalidScope(_)));

    let mut no_secret = req;
    no_secret.client_secret = None;
    let err = f.env.deps.flow.exchange(no_secret, None).await.unwrap_err();
    assert_eq!(err.error_code(), "invalid_client");
}
