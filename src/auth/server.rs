//! OAuth 2.0 / OpenID Connect endpoints
//!
//! Authorization, token, userinfo and discovery endpoints, the browser login
//! handoff, per-user session management, client administration and the
//! internal endpoints other services call with a service key.

use super::clients::{ClientSpec, ClientUpdate};
use super::codes::AuthorizationRequest;
use super::flow::{AuthorizeOutcome, BasicCredentials, TokenRequest};
use super::middleware::{AdminUser, AuthenticatedUser, ResourceGuard, ServiceCaller, ServiceKeys};
use super::revocation::{BlacklistCheckRequest, BlacklistCheckResponse, RevocationStatus};
use crate::constants::{
    GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS, PKCE_METHOD_S256, RESPONSE_TYPE_CODE,
    SCOPE_OPENID,
};
use crate::core::Dependencies;
use crate::error::OAuthError;
use crate::http::AppError;
use crate::http::session::BrowserSessions;
use crate::model::{ProfileClaims, RevocationReason, Session, UserProfile};
use axum::{
    Json, Router,
    extract::{FromRef, Path, Query, State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

/// OAuth server state
pub struct OAuthServerState {
    pub deps: Dependencies,
    pub guard: ResourceGuard,
    pub service_keys: ServiceKeys,
    pub browser: BrowserSessions,
}

impl OAuthServerState {
    pub fn new(deps: Dependencies) -> Self {
        let http = deps.config.get_http();
        let guard = ResourceGuard::new(
            deps.tokens.clone(),
            deps.revocation.clone(),
            deps.storage.clone(),
        );
        let service_keys = ServiceKeys::new(deps.config.get_blacklist().service_keys);
        let browser = BrowserSessions::new(deps.tokens.clone(), deps.revocation.clone(), http.secure);
        Self {
            deps,
            guard,
            service_keys,
            browser,
        }
    }

    fn issuer(&self) -> &str {
        self.deps.tokens.issuer()
    }
}

impl FromRef<Arc<OAuthServerState>> for ResourceGuard {
    fn from_ref(state: &Arc<OAuthServerState>) -> Self {
        state.guard.clone()
    }
}

impl FromRef<Arc<OAuthServerState>> for ServiceKeys {
    fn from_ref(state: &Arc<OAuthServerState>) -> Self {
        state.service_keys.clone()
    }
}

/// Create OAuth routes
pub fn create_oauth_routes(state: Arc<OAuthServerState>) -> Router {
    Router::new()
        .route(
            "/.well-known/openid-configuration",
            get(handle_discovery),
        )
        .route("/oauth/authorize", get(handle_authorize))
        .route("/oauth/login/callback", get(handle_login_callback))
        .route("/oauth/token", post(handle_token))
        .route("/oauth/userinfo", get(handle_userinfo))
        .route("/oauth/logout", post(handle_logout))
        .route("/oauth/sessions", get(handle_list_sessions))
        .route(
            "/oauth/sessions/{id}",
            axum::routing::delete(handle_delete_session),
        )
        .route(
            "/oauth/clients",
            get(handle_list_clients).post(handle_create_client),
        )
        .route(
            "/oauth/clients/{id}",
            put(handle_update_client).delete(handle_deactivate_client),
        )
        .route(
            "/oauth/clients/{id}/regenerate-secret",
            post(handle_regenerate_secret),
        )
        .route("/oauth/keys/rotate", post(handle_rotate_signing_key))
        .route("/token/check-blacklist", post(handle_check_blacklist))
        .route("/internal/login/tickets", post(handle_issue_login_ticket))
        .route("/internal/users/{id}", put(handle_push_profile))
        .route("/internal/users/{id}/revoke-all", post(handle_revoke_all))
        .with_state(state)
}

fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => OAuthError::ServerError("unrepresentable redirect location".to_string())
            .into_response(),
    }
}

fn with_cookies(mut response: Response, cookies: &[String]) -> Response {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

// ============================================================================
// DISCOVERY
// ============================================================================

async fn handle_discovery(State(state): State<Arc<OAuthServerState>>) -> impl IntoResponse {
    let issuer = state.issuer();
    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth/authorize"),
        "token_endpoint": format!("{issuer}/oauth/token"),
        "userinfo_endpoint": format!("{issuer}/oauth/userinfo"),
        "end_session_endpoint": format!("{issuer}/oauth/logout"),
        "response_types_supported": [RESPONSE_TYPE_CODE],
        "grant_types_supported": [GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [format!("{:?}", state.deps.keys.algorithm())],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post", "none"],
        "scopes_supported": state.deps.scopes.names(),
        "claims_supported": ["sub", "iss", "aud", "exp", "iat", "auth_time", "nonce", "name", "email", "role", "permissions"],
        "code_challenge_methods_supported": [PKCE_METHOD_S256],
    }))
}

// ============================================================================
// AUTHORIZATION ENDPOINT AND LOGIN HANDOFF
// ============================================================================

/// Handle authorization request
async fn handle_authorize(
    State(state): State<Arc<OAuthServerState>>,
    headers: HeaderMap,
    Query(request): Query<AuthorizationRequest>,
) -> Response {
    let identity = state
        .browser
        .identity(&headers)
        .await
        .map(|claims| claims.identity());

    let outcome = match state.deps.flow.authorize(request, identity.as_ref()).await {
        Ok(outcome) => outcome,
        Err(e) => return e.into_oauth().into_response(),
    };

    match outcome {
        AuthorizeOutcome::Redirect { location } => {
            with_cookies(found(&location), &[state.browser.clear_pending_cookie()])
        }
        AuthorizeOutcome::RenderError { error } => {
            tracing::warn!(error = error.error_code(), "Authorization request rejected without redirect");
            error.into_response()
        }
        AuthorizeOutcome::LoginRequired { request } => {
            let pending = match state.browser.pending_cookie(&request) {
                Ok(cookie) => cookie,
                Err(e) => return e.into_oauth().into_response(),
            };
            match login_location(&state, &request.client_id) {
                Ok(location) => with_cookies(found(&location), &[pending]),
                Err(e) => e.into_response(),
            }
        }
    }
}

/// Where to send a browser that has to log in first
fn login_location(state: &OAuthServerState, client_id: &str) -> Result<String, OAuthError> {
    let Some(login_url) = state.deps.config.get_oauth().login_url else {
        return Err(OAuthError::ServerError("no login_url configured".to_string()));
    };
    let mut location = url::Url::parse(&login_url)
        .map_err(|_| OAuthError::ServerError("login_url is not a valid URL".to_string()))?;
    location
        .query_pairs_mut()
        .append_pair("callback", &format!("{}/oauth/login/callback", state.issuer()))
        .append_pair("client_id", client_id);
    Ok(location.to_string())
}

#[derive(Debug, Deserialize)]
struct LoginCallbackQuery {
    #[serde(default)]
    ticket: String,
}

/// Finish the login handoff and resume the parked authorization request
async fn handle_login_callback(
    State(state): State<Arc<OAuthServerState>>,
    headers: HeaderMap,
    Query(query): Query<LoginCallbackQuery>,
) -> Response {
    if query.ticket.is_empty() {
        return OAuthError::InvalidRequest("ticket is required".to_string()).into_response();
    }

    // The resume target comes only from the signed cookie, never from the URL
    let Some(pending) = state.browser.pending(&headers) else {
        return OAuthError::InvalidRequest("no pending authorization request".to_string())
            .into_response();
    };

    let identity = match state.browser.redeem_login_ticket(&query.ticket).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };
    let identity_cookie = match state.browser.identity_cookie(&identity) {
        Ok(cookie) => cookie,
        Err(e) => return e.into_oauth().into_response(),
    };

    tracing::info!(user_id = %identity.user_id, client_id = %pending.client_id, "Login completed");
    with_cookies(
        found(&resume_location(&pending)),
        &[identity_cookie, state.browser.clear_pending_cookie()],
    )
}

/// `/oauth/authorize?…` for a parked request
fn resume_location(request: &AuthorizationRequest) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("client_id", &request.client_id)
        .append_pair("redirect_uri", &request.redirect_uri)
        .append_pair("response_type", &request.response_type);
    let optional = [
        ("scope", &request.scope),
        ("state", &request.state),
        ("code_challenge", &request.code_challenge),
        ("code_challenge_method", &request.code_challenge_method),
        ("nonce", &request.nonce),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            query.append_pair(name, value);
        }
    }
    format!("/oauth/authorize?{}", query.finish())
}

// ============================================================================
// TOKEN ENDPOINT
// ============================================================================

/// Handle token request
async fn handle_token(
    State(state): State<Arc<OAuthServerState>>,
    headers: HeaderMap,
    form: Result<axum::Form<TokenRequest>, FormRejection>,
) -> Response {
    let axum::Form(request) = match form {
        Ok(form) => form,
        Err(rejection) => {
            return OAuthError::InvalidRequest(rejection.body_text()).into_response();
        }
    };
    let basic = match basic_credentials(&headers) {
        Ok(basic) => basic,
        Err(e) => return e.into_response(),
    };

    match state.deps.flow.exchange(request, basic).await {
        Ok(tokens) => (
            StatusCode::OK,
            [
                (header::CACHE_CONTROL, "no-store"),
                (header::PRAGMA, "no-cache"),
            ],
            Json(tokens),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Parse `Authorization: Basic` client credentials, if sent
fn basic_credentials(headers: &HeaderMap) -> Result<Option<BasicCredentials>, OAuthError> {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return Ok(None);
    };

    let malformed = || OAuthError::InvalidClient("malformed Basic credentials".to_string());
    let decoded = STANDARD.decode(value.trim()).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (client_id, client_secret) = decoded.split_once(':').ok_or_else(malformed)?;

    Ok(Some(BasicCredentials {
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
    }))
}

// ============================================================================
// USERINFO, LOGOUT AND SESSIONS
// ============================================================================

async fn handle_userinfo(user: AuthenticatedUser) -> Response {
    if !user.has_scope(SCOPE_OPENID) {
        return OAuthError::AccessDenied("the openid scope is required".to_string()).into_response();
    }
    Json(user.profile).into_response()
}

/// Revoke the presented token and the caller's session with this client
async fn handle_logout(
    State(state): State<Arc<OAuthServerState>>,
    headers: HeaderMap,
    user: AuthenticatedUser,
) -> Result<Response, AppError> {
    let revocation = &state.deps.revocation;
    revocation
        .revoke_token(&user.claims, RevocationReason::Logout)
        .await?;

    let sessions = state
        .deps
        .sessions
        .list(&user.user_id, Some(&user.client_id))
        .await?;
    for session in sessions {
        revoke_session_tokens(&state, &session, RevocationReason::Logout).await?;
        state.deps.sessions.delete_by_id(&session.id).await?;
    }

    if let Some(browser) = state.browser.identity(&headers).await
        && browser.sub == user.user_id
    {
        revocation
            .revoke_token(&browser, RevocationReason::Logout)
            .await?;
    }

    tracing::info!(user_id = %user.user_id, client_id = %user.client_id, "User logged out");
    Ok(with_cookies(
        StatusCode::NO_CONTENT.into_response(),
        &[state.browser.clear_identity_cookie()],
    ))
}

/// Revoke the token ids recorded on a session
async fn revoke_session_tokens(
    state: &OAuthServerState,
    session: &Session,
    reason: RevocationReason,
) -> crate::Result<()> {
    let policy = state.deps.tokens.policy();
    let recorded = [
        (session.access_jti.as_deref(), policy.access_ttl_secs),
        (session.refresh_jti.as_deref(), policy.refresh_ttl_secs),
    ];
    for (jti, ttl_secs) in recorded {
        if let Some(jti) = jti {
            state
                .deps
                .revocation
                .revoke(jti, &session.user_id, reason, Duration::seconds(ttl_secs))
                .await?;
        }
    }
    Ok(())
}

async fn handle_list_sessions(
    State(state): State<Arc<OAuthServerState>>,
    user: AuthenticatedUser,
) -> Result<Response, AppError> {
    let sessions = state.deps.sessions.list(&user.user_id, None).await?;
    Ok(Json(sessions).into_response())
}

/// Per-device logout: drop one session and revoke the tokens recorded on it
async fn handle_delete_session(
    State(state): State<Arc<OAuthServerState>>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let session = state
        .deps
        .sessions
        .get(&id)
        .await?
        .filter(|s| s.user_id == user.user_id)
        .ok_or_else(|| crate::AuthorityError::not_found(format!("session {id}")))?;

    revoke_session_tokens(&state, &session, RevocationReason::SessionRevoked).await?;
    state.deps.sessions.delete_by_id(&session.id).await?;

    tracing::info!(user_id = %user.user_id, session_id = %id, "Session revoked");
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// CLIENT ADMINISTRATION
// ============================================================================

async fn handle_list_clients(
    State(state): State<Arc<OAuthServerState>>,
    _admin: AdminUser,
) -> Result<Response, AppError> {
    Ok(Json(state.deps.clients.list().await?).into_response())
}

async fn handle_create_client(
    State(state): State<Arc<OAuthServerState>>,
    AdminUser(admin): AdminUser,
    Json(spec): Json<ClientSpec>,
) -> Result<Response, AppError> {
    let registered = state.deps.clients.register(spec).await?;
    tracing::info!(admin = %admin.user_id, client_id = %registered.client.id, "Client registered");
    Ok((StatusCode::CREATED, Json(registered)).into_response())
}

async fn handle_update_client(
    State(state): State<Arc<OAuthServerState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(changes): Json<ClientUpdate>,
) -> Result<Response, AppError> {
    let client = state.deps.clients.update(&id, changes).await?;
    tracing::info!(admin = %admin.user_id, client_id = %id, "Client updated");
    Ok(Json(client).into_response())
}

async fn handle_deactivate_client(
    State(state): State<Arc<OAuthServerState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.deps.clients.deactivate(&id).await?;
    tracing::info!(admin = %admin.user_id, client_id = %id, "Client deactivated");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegeneratedSecret {
    client_id: String,
    client_secret: String,
}

async fn handle_regenerate_secret(
    State(state): State<Arc<OAuthServerState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let client_secret = state.deps.clients.rotate_secret(&id).await?;
    tracing::info!(admin = %admin.user_id, client_id = %id, "Client secret rotated");
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(RegeneratedSecret {
            client_id: id,
            client_secret,
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct RotateKeyRequest {
    secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RotatedKey {
    kid: String,
    key_ids: Vec<String>,
}

/// Make a new signing secret active; retired keys keep verifying until they
/// fall off the ring. Persist the secret in config before the next restart.
async fn handle_rotate_signing_key(
    State(state): State<Arc<OAuthServerState>>,
    AdminUser(admin): AdminUser,
    Json(request): Json<RotateKeyRequest>,
) -> Result<Response, AppError> {
    let kid = state
        .deps
        .keys
        .rotate(&request.secret)
        .map_err(|e| OAuthError::InvalidRequest(e.to_string()))?;
    tracing::info!(admin = %admin.user_id, kid = %kid, "Signing key rotated");
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(RotatedKey {
            kid,
            key_ids: state.deps.keys.key_ids(),
        }),
    )
        .into_response())
}

// ============================================================================
// INTERNAL (SERVICE KEY) ENDPOINTS
// ============================================================================

/// Blacklist membership for dependent services
async fn handle_check_blacklist(
    State(state): State<Arc<OAuthServerState>>,
    _caller: ServiceCaller,
    Json(request): Json<BlacklistCheckRequest>,
) -> Response {
    let issued_at = request.iat.and_then(|iat| DateTime::from_timestamp(iat, 0));
    let status = state
        .deps
        .revocation
        .status(&request.jti, &request.user_id, issued_at)
        .await;

    match status {
        RevocationStatus::Valid => Json(BlacklistCheckResponse { blacklisted: false }).into_response(),
        RevocationStatus::Revoked => Json(BlacklistCheckResponse { blacklisted: true }).into_response(),
        RevocationStatus::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(BlacklistCheckResponse { blacklisted: true }),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct LoginTicketRequest {
    #[validate(length(min = 1, max = 255))]
    user_id: String,
    #[serde(default)]
    auth_time: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    profile: ProfileClaims,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginTicketResponse {
    ticket: String,
    expires_in: i64,
}

/// Mint a login ticket for a user the login service has just authenticated
async fn handle_issue_login_ticket(
    State(state): State<Arc<OAuthServerState>>,
    caller: ServiceCaller,
    Json(request): Json<LoginTicketRequest>,
) -> Result<Response, AppError> {
    request
        .validate()
        .map_err(|e| crate::AuthorityError::validation(e.to_string()))?;

    let auth_time = request.auth_time.unwrap_or_else(Utc::now);
    let ticket = state
        .browser
        .issue_login_ticket(&request.user_id, auth_time, request.profile)?;

    tracing::info!(user_id = %request.user_id, service = %caller.key_id, "Login ticket issued");
    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(LoginTicketResponse {
            ticket,
            expires_in: crate::constants::LOGIN_TICKET_TTL_SECS,
        }),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePush {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePushResponse {
    profile: UserProfile,
    tokens_revoked: bool,
}

/// Store the profile owned by the user-management service.
///
/// A role or permission change revokes every token the user holds.
async fn handle_push_profile(
    State(state): State<Arc<OAuthServerState>>,
    _caller: ServiceCaller,
    Path(id): Path<String>,
    Json(push): Json<ProfilePush>,
) -> Result<Response, AppError> {
    let storage = &state.deps.storage;
    let previous = storage.get_user_profile(&id).await?;

    let profile = UserProfile {
        id: id.clone(),
        name: push.name,
        email: push.email,
        role: push.role,
        permissions: push.permissions,
        updated_at: Utc::now(),
    };
    storage.save_user_profile(&profile).await?;

    let privileges_changed = previous.is_some_and(|previous| {
        previous.role != profile.role || previous.permissions != profile.permissions
    });
    if privileges_changed {
        state
            .deps
            .revocation
            .revoke_all_for_user(&id, RevocationReason::RoleChange)
            .await?;
    }

    tracing::info!(user_id = %id, tokens_revoked = privileges_changed, "User profile updated");
    Ok(Json(ProfilePushResponse {
        profile,
        tokens_revoked: privileges_changed,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct RevokeAllRequest {
    reason: RevocationReason,
}

/// Password reset, suspension and similar events
async fn handle_revoke_all(
    State(state): State<Arc<OAuthServerState>>,
    _caller: ServiceCaller,
    Path(id): Path<String>,
    Json(request): Json<RevokeAllRequest>,
) -> Result<Response, AppError> {
    state
        .deps
        .revocation
        .revoke_all_for_user(&id, request.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
