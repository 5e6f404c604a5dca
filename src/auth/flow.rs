//! Authorization flow orchestration
//!
//! Drives one authorization request from validation to code issuance, and one
//! token request from client authentication to an established session:
//!
//! ```text
//! Start -> Validated -> AwaitingLogin
//!                    -> CodeIssued -> TokenExchanged -> SessionEstablished
//! (any) -> Error
//! ```

use super::clients::ClientRegistry;
use super::codes::{AuthorizationCodeIssuer, AuthorizationGrant, AuthorizationRequest};
use super::profile::merge_profile;
use super::sessions::{NewSession, SessionStore};
use super::tokens::{IdTokenContext, TokenIssuer, TokenResponse};
use crate::constants::{GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS};
use crate::error::OAuthError;
use crate::model::{Client, ProfileClaims};
use crate::scope::ScopeRegistry;
use crate::storage::Storage;
use crate::{Result, telemetry};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Start,
    Validated,
    AwaitingLogin,
    CodeIssued,
    TokenExchanged,
    SessionEstablished,
    Error,
}

impl FlowState {
    pub fn can_transition_to(self, next: FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (Error, _) => false,
            (_, Error) => true,
            (Start, Validated) => true,
            (Validated, AwaitingLogin) | (Validated, CodeIssued) => true,
            (CodeIssued, TokenExchanged) => true,
            (TokenExchanged, SessionEstablished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Start => "start",
            FlowState::Validated => "validated",
            FlowState::AwaitingLogin => "awaiting_login",
            FlowState::CodeIssued => "code_issued",
            FlowState::TokenExchanged => "token_exchanged",
            FlowState::SessionEstablished => "session_established",
            FlowState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Checked, traced state of one flow
struct FlowTrace<'a> {
    state: FlowState,
    client_id: &'a str,
}

impl<'a> FlowTrace<'a> {
    fn new(state: FlowState, client_id: &'a str) -> Self {
        Self { state, client_id }
    }

    fn advance(&mut self, next: FlowState) -> std::result::Result<(), OAuthError> {
        if !self.state.can_transition_to(next) {
            tracing::error!(from = %self.state, to = %next, client_id = %self.client_id, "Illegal flow transition");
            return Err(OAuthError::ServerError(format!(
                "illegal flow transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(from = %self.state, to = %next, client_id = %self.client_id, "Flow transition");
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, error: &OAuthError) {
        tracing::info!(
            from = %self.state,
            client_id = %self.client_id,
            error = error.error_code(),
            "Flow failed"
        );
        self.state = FlowState::Error;
    }
}

/// The end user behind a browser, as established by the login handoff
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub auth_time: DateTime<Utc>,
    pub claims: ProfileClaims,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizeOutcome {
    /// No authenticated user; park the request and send the browser to login
    LoginRequired { request: AuthorizationRequest },
    /// Redirect to the client, with either a code or an error
    Redirect { location: String },
    /// The client or redirect URI is untrusted; show the error, never redirect
    RenderError { error: OAuthError },
}

/// Form body of `POST /oauth/token`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub scope: Option<String>,
}

/// Client credentials taken from an `Authorization: Basic` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub client_id: String,
    pub client_secret: String,
}

pub struct AuthorizationFlow {
    clients: Arc<ClientRegistry>,
    codes: Arc<AuthorizationCodeIssuer>,
    tokens: Arc<TokenIssuer>,
    sessions: Arc<SessionStore>,
    scopes: Arc<ScopeRegistry>,
    storage: Arc<dyn Storage>,
}

impl AuthorizationFlow {
    pub fn new(
        clients: Arc<ClientRegistry>,
        codes: Arc<AuthorizationCodeIssuer>,
        tokens: Arc<TokenIssuer>,
        sessions: Arc<SessionStore>,
        scopes: Arc<ScopeRegistry>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            clients,
            codes,
            tokens,
            sessions,
            scopes,
            storage,
        }
    }

    /// Handle an authorization request for an optional authenticated user
    pub async fn authorize(
        &self,
        request: AuthorizationRequest,
        identity: Option<&Identity>,
    ) -> Result<AuthorizeOutcome> {
        let mut trace = FlowTrace::new(FlowState::Start, &request.client_id);

        let client = match self.codes.validate_request(&request).await {
            Ok(client) => client,
            Err(err) => {
                let err = err.into_oauth();
                trace.fail(&err);
                return Ok(match err {
                    OAuthError::InvalidClient(_)
                    | OAuthError::InvalidRedirectUri(_)
                    | OAuthError::ServerError(_) => AuthorizeOutcome::RenderError { error: err },
                    other => AuthorizeOutcome::Redirect {
                        location: error_redirect(&request.redirect_uri, &other, request.state.as_deref())?,
                    },
                });
            }
        };
        trace.advance(FlowState::Validated)?;

        let Some(identity) = identity else {
            trace.advance(FlowState::AwaitingLogin)?;
            return Ok(AuthorizeOutcome::LoginRequired { request });
        };

        let grant = AuthorizationGrant {
            client_id: client.id.clone(),
            user_id: identity.user_id.clone(),
            scopes: request.scopes(),
            redirect_uri: request.redirect_uri.clone(),
            nonce: request.nonce.clone(),
            auth_time: identity.auth_time,
            claims: identity.claims.clone(),
            code_challenge: request.code_challenge.clone(),
            code_challenge_method: request.code_challenge_method.clone(),
        };
        let code = self.codes.issue(grant).await?;
        trace.advance(FlowState::CodeIssued)?;

        let mut location = parse_redirect(&request.redirect_uri)?;
        {
            let mut query = location.query_pairs_mut();
            query.append_pair("code", &code);
            if let Some(state) = request.state.as_deref() {
                query.append_pair("state", state);
            }
        }

        Ok(AuthorizeOutcome::Redirect {
            location: location.to_string(),
        })
    }

    /// Handle a token request. Every failure is an OAuth error body
    pub async fn exchange(
        &self,
        request: TokenRequest,
        basic: Option<BasicCredentials>,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        match request.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => self.exchange_code(request, basic).await,
            GRANT_CLIENT_CREDENTIALS => self.client_credentials(request, basic).await,
            "" => Err(OAuthError::InvalidRequest("grant_type is required".to_string())),
            other => Err(OAuthError::UnsupportedGrantType(format!(
                "grant_type '{other}' is not supported"
            ))),
        }
    }

    async fn exchange_code(
        &self,
        request: TokenRequest,
        basic: Option<BasicCredentials>,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let (client_id, client_secret) = client_credentials_of(&request, basic)?;
        let mut trace = FlowTrace::new(FlowState::CodeIssued, &client_id);

        let result = self
            .redeem_and_issue(&request, &client_id, client_secret.as_deref(), &mut trace)
            .await;
        if let Err(ref err) = result {
            trace.fail(err);
        }
        result
    }

    async fn redeem_and_issue(
        &self,
        request: &TokenRequest,
        client_id: &str,
        client_secret: Option<&str>,
        trace: &mut FlowTrace<'_>,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let code = request
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::InvalidRequest("code is required".to_string()))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("redirect_uri is required".to_string()))?;

        let client = self
            .clients
            .validate_credentials(client_id, client_secret)
            .await
            .map_err(|e| e.into_oauth())?;

        let redeemed = self
            .codes
            .redeem(code, &client.id, redirect_uri, request.code_verifier.as_deref())
            .await
            .map_err(|e| e.into_oauth())?;

        let stored = self
            .storage
            .get_user_profile(&redeemed.user_id)
            .await
            .map_err(|e| e.into_oauth())?;
        let profile = merge_profile(&redeemed.user_id, stored.as_ref(), &redeemed.claims);

        let tokens = self
            .tokens
            .issue(
                &redeemed.user_id,
                &client.id,
                &redeemed.scopes,
                IdTokenContext {
                    nonce: redeemed.nonce.clone(),
                    auth_time: redeemed.auth_time,
                    profile: profile.to_claims(),
                },
            )
            .map_err(|e| e.into_oauth())?;
        trace.advance(FlowState::TokenExchanged)?;
        telemetry::record_tokens_issued(GRANT_AUTHORIZATION_CODE);

        let session = NewSession {
            user_id: redeemed.user_id.clone(),
            client_id: client.id.clone(),
            scopes: redeemed.scopes.clone(),
            nonce: redeemed.nonce.clone(),
            auth_time: redeemed.auth_time,
            claims: serde_json::to_value(&profile).unwrap_or_default(),
            access_jti: Some(tokens.access_jti.clone()),
            refresh_jti: tokens.refresh_jti.clone(),
            ttl: None,
        };
        // Tokens are already minted; a lost session row only costs
        // per-device logout for this grant.
        match self.sessions.upsert(session).await {
            Ok(_) => trace.advance(FlowState::SessionEstablished)?,
            Err(e) => tracing::warn!(
                error = %e,
                user_id = %redeemed.user_id,
                client_id = %client.id,
                "Failed to record session"
            ),
        }

        Ok(TokenResponse::from(tokens))
    }

    async fn client_credentials(
        &self,
        request: TokenRequest,
        basic: Option<BasicCredentials>,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let (client_id, client_secret) = client_credentials_of(&request, basic)?;
        let Some(secret) = client_secret else {
            return Err(OAuthError::InvalidClient(
                "client_credentials requires a confidential client".to_string(),
            ));
        };

        let client = self
            .clients
            .validate_credentials(&client_id, Some(&secret))
            .await
            .map_err(|e| e.into_oauth())?;

        let scopes = requested_or_allowed(&client, request.scope.as_deref());
        self.scopes.ensure_known(&scopes)?;
        if scopes.is_empty() || !client.allows_scopes(&scopes) {
            return Err(OAuthError::InvalidScope(
                "requested scope exceeds what the client may request".to_string(),
            ));
        }

        let tokens = self
            .tokens
            .issue_service_token(&client.id, &scopes)
            .map_err(|e| e.into_oauth())?;
        tracing::info!(client_id = %client.id, "Issued client credentials token");
        Ok(TokenResponse::from(tokens))
    }
}

fn requested_or_allowed(client: &Client, scope: Option<&str>) -> Vec<String> {
    match scope {
        Some(scope) => ScopeRegistry::parse(scope),
        None => client.allowed_scopes.clone(),
    }
}

/// Pick the client's credentials from the Basic header or the form body
fn client_credentials_of(
    request: &TokenRequest,
    basic: Option<BasicCredentials>,
) -> std::result::Result<(String, Option<String>), OAuthError> {
    if let Some(basic) = basic {
        if request.client_secret.is_some() {
            return Err(OAuthError::InvalidRequest(
                "use only one client authentication method".to_string(),
            ));
        }
        if request
            .client_id
            .as_deref()
            .is_some_and(|id| id != basic.client_id)
        {
            return Err(OAuthError::InvalidClient(
                "client_id does not match the authenticated client".to_string(),
            ));
        }
        return Ok((basic.client_id, Some(basic.client_secret)));
    }

    let client_id = request
        .client_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OAuthError::InvalidClient("client authentication required".to_string()))?;
    Ok((client_id, request.client_secret.clone().filter(|s| !s.is_empty())))
}

fn parse_redirect(uri: &str) -> std::result::Result<url::Url, OAuthError> {
    url::Url::parse(uri).map_err(|_| OAuthError::InvalidRedirectUri("unparseable redirect_uri".to_string()))
}

/// Error redirect to an already validated redirect URI
pub fn error_redirect(
    redirect_uri: &str,
    error: &OAuthError,
    state: Option<&str>,
) -> std::result::Result<String, OAuthError> {
    let mut location = parse_redirect(redirect_uri)?;
    {
        let mut query = location.query_pairs_mut();
        query.append_pair("error", error.error_code());
        query.append_pair("error_description", &error.description());
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    Ok(location.to_string())
}
