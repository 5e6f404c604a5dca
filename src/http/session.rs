//! Browser login state
//!
//! The server keeps no per-browser state. A parked authorization request and
//! the authenticated identity both live in signed cookies, and the login
//! service hands a user back through a short-lived single-use ticket.

use crate::Result;
use crate::auth::codes::AuthorizationRequest;
use crate::auth::flow::Identity;
use crate::auth::revocation::RevocationRegistry;
use crate::auth::tokens::{JwtClaims, TokenIssuer, TokenUse, impl_jwt_claims, new_jti};
use crate::constants::{
    BROWSER_SESSION_TTL_SECS, IDENTITY_COOKIE, LOGIN_TICKET_TTL_SECS, PENDING_AUTHORIZATION_TTL_SECS,
    PENDING_COOKIE,
};
use crate::error::OAuthError;
use crate::model::{ProfileClaims, RevocationReason};
use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Signed content of the identity cookie
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrowserSessionClaims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    pub token_use: TokenUse,
    #[serde(flatten)]
    pub profile: ProfileClaims,
}

impl_jwt_claims!(BrowserSessionClaims, sub);

impl BrowserSessionClaims {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.sub.clone(),
            auth_time: DateTime::from_timestamp(self.auth_time, 0).unwrap_or_else(Utc::now),
            claims: self.profile.clone(),
        }
    }
}

/// Signed content of the pending-request cookie; `sub` is the client id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingClaims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub token_use: TokenUse,
    pub request: AuthorizationRequest,
}

impl_jwt_claims!(PendingClaims, sub);

/// A login ticket minted for the external login service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginTicketClaims {
    pub iss: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    pub token_use: TokenUse,
    #[serde(flatten)]
    pub profile: ProfileClaims,
}

impl_jwt_claims!(LoginTicketClaims, sub);

/// Signs, reads and verifies the browser artefacts of the login handoff
#[derive(Clone)]
pub struct BrowserSessions {
    tokens: Arc<TokenIssuer>,
    revocation: Arc<RevocationRegistry>,
    secure: bool,
}

impl BrowserSessions {
    pub fn new(tokens: Arc<TokenIssuer>, revocation: Arc<RevocationRegistry>, secure: bool) -> Self {
        Self {
            tokens,
            revocation,
            secure,
        }
    }

    /// `Set-Cookie` value carrying the authenticated identity
    pub fn identity_cookie(&self, identity: &Identity) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = BrowserSessionClaims {
            iss: self.tokens.issuer().to_string(),
            sub: identity.user_id.clone(),
            jti: new_jti(),
            iat,
            exp: iat + BROWSER_SESSION_TTL_SECS,
            auth_time: identity.auth_time.timestamp(),
            token_use: TokenUse::Browser,
            profile: identity.claims.clone(),
        };
        let value = self.tokens.sign(&claims)?;
        Ok(set_cookie(IDENTITY_COOKIE, &value, BROWSER_SESSION_TTL_SECS, self.secure))
    }

    /// `Set-Cookie` value parking an authorization request during login
    pub fn pending_cookie(&self, request: &AuthorizationRequest) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = PendingClaims {
            iss: self.tokens.issuer().to_string(),
            sub: request.client_id.clone(),
            jti: new_jti(),
            iat,
            exp: iat + PENDING_AUTHORIZATION_TTL_SECS,
            token_use: TokenUse::Pending,
            request: request.clone(),
        };
        let value = self.tokens.sign(&claims)?;
        Ok(set_cookie(PENDING_COOKIE, &value, PENDING_AUTHORIZATION_TTL_SECS, self.secure))
    }

    pub fn clear_identity_cookie(&self) -> String {
        clear_cookie(IDENTITY_COOKIE, self.secure)
    }

    pub fn clear_pending_cookie(&self) -> String {
        clear_cookie(PENDING_COOKIE, self.secure)
    }

    /// The verified identity cookie, if present, valid and not revoked.
    ///
    /// An unanswerable revocation lookup drops the identity like a revocation.
    pub async fn identity(&self, headers: &HeaderMap) -> Option<BrowserSessionClaims> {
        let raw = read_cookie(headers, IDENTITY_COOKIE)?;
        let claims: BrowserSessionClaims = match self.tokens.verify(&raw, TokenUse::Browser, None) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring invalid identity cookie");
                return None;
            }
        };

        let issued_at = DateTime::from_timestamp(claims.iat, 0);
        if self
            .revocation
            .is_revoked(&claims.jti, &claims.sub, issued_at)
            .await
        {
            tracing::info!(user_id = %claims.sub, "Identity cookie revoked");
            return None;
        }
        Some(claims)
    }

    /// The parked authorization request, if present and valid
    pub fn pending(&self, headers: &HeaderMap) -> Option<AuthorizationRequest> {
        let raw = read_cookie(headers, PENDING_COOKIE)?;
        self.tokens
            .verify::<PendingClaims>(&raw, TokenUse::Pending, None)
            .map(|claims| claims.request)
            .map_err(|e| tracing::debug!(error = %e, "Ignoring invalid pending cookie"))
            .ok()
    }

    /// Mint a login ticket for a user the login service has authenticated
    pub fn issue_login_ticket(
        &self,
        user_id: &str,
        auth_time: DateTime<Utc>,
        profile: ProfileClaims,
    ) -> Result<String> {
        let iat = Utc::now().timestamp();
        let claims = LoginTicketClaims {
            iss: self.tokens.issuer().to_string(),
            sub: user_id.to_string(),
            jti: new_jti(),
            iat,
            exp: iat + LOGIN_TICKET_TTL_SECS,
            auth_time: auth_time.timestamp(),
            token_use: TokenUse::LoginTicket,
            profile,
        };
        self.tokens.sign(&claims)
    }

    /// Verify a login ticket and burn it. A second presentation fails.
    pub async fn redeem_login_ticket(&self, ticket: &str) -> std::result::Result<Identity, OAuthError> {
        let claims: LoginTicketClaims = self.tokens.verify(ticket, TokenUse::LoginTicket, None)?;

        let remaining = (claims.expires_at() - Utc::now().timestamp()).max(0);
        let first_use = self
            .revocation
            .consume_once(
                &claims.jti,
                &claims.sub,
                RevocationReason::LoginTicketUsed,
                Duration::seconds(remaining),
            )
            .await
            .map_err(|e| e.into_oauth())?;
        if !first_use {
            tracing::warn!(user_id = %claims.sub, jti = %claims.jti, "Login ticket replayed");
            return Err(OAuthError::InvalidRequest(
                "login ticket has already been used".to_string(),
            ));
        }

        Ok(Identity {
            user_id: claims.sub,
            auth_time: DateTime::from_timestamp(claims.auth_time, 0).unwrap_or_else(Utc::now),
            claims: claims.profile,
        })
    }
}

/// Build a `Set-Cookie` value with security flags
///
/// The `secure` parameter controls whether to set the Secure flag (requires HTTPS).
/// For local development over HTTP, set this to false.
pub fn set_cookie(name: &str, value: &str, max_age_secs: i64, secure: bool) -> String {
    let secure_flag = if secure { " Secure;" } else { "" };
    format!(
        "{}={}; Path=/oauth; Max-Age={}; HttpOnly;{} SameSite=Lax",
        name, value, max_age_secs, secure_flag
    )
}

/// Clear a cookie; `secure` should match what was used when setting it
pub fn clear_cookie(name: &str, secure: bool) -> String {
    let secure_flag = if secure { " Secure;" } else { "" };
    format!(
        "{}=; Path=/oauth; Max-Age=0; HttpOnly;{} SameSite=Lax",
        name, secure_flag
    )
}

/// Find a cookie value in the request headers
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .map(str::trim)
        .find_map(|c| {
            c.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix('='))
                .map(String::from)
        })
        .filter(|v| !v.is_empty())
}
