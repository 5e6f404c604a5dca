//! Request guards for protected endpoints
//!
//! Type-safe extractors: a handler that takes [`AuthenticatedUser`],
//! [`AdminUser`] or [`ServiceCaller`] only runs once the caller has been
//! verified. Each extractor pulls what it needs from the router state with
//! [`FromRef`].

use super::constant_time_eq;
use super::profile::{MergedProfile, merge_profile};
use super::revocation::{RevocationCheck, RevocationStatus};
use super::tokens::{AccessClaims, TokenIssuer};
use crate::constants::{ADMIN_ROLE, HEADER_SERVICE_KEY};
use crate::error::OAuthError;
use crate::storage::Storage;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header, request::Parts};
use chrono::DateTime;
use std::sync::Arc;

/// Verifies bearer tokens: signature, revocation, then profile merge
#[derive(Clone)]
pub struct ResourceGuard {
    tokens: Arc<TokenIssuer>,
    revocation: Arc<dyn RevocationCheck>,
    storage: Arc<dyn Storage>,
}

impl ResourceGuard {
    pub fn new(
        tokens: Arc<TokenIssuer>,
        revocation: Arc<dyn RevocationCheck>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            tokens,
            revocation,
            storage,
        }
    }

    /// Resolve a raw bearer token to the caller it represents
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, OAuthError> {
        let claims = self.tokens.verify_access(token)?;

        let issued_at = DateTime::from_timestamp(claims.iat, 0);
        match self.revocation.check(&claims.jti, &claims.sub, issued_at).await {
            RevocationStatus::Valid => {}
            RevocationStatus::Revoked => return Err(OAuthError::TokenRevoked),
            RevocationStatus::Unavailable => return Err(OAuthError::BlacklistCheckUnavailable),
        }

        let stored = if claims.is_service_token() {
            None
        } else {
            self.storage
                .get_user_profile(&claims.sub)
                .await
                .map_err(|e| e.into_oauth())?
        };
        let profile = merge_profile(&claims.sub, stored.as_ref(), &claims.profile);

        Ok(AuthenticatedUser {
            user_id: claims.sub.clone(),
            client_id: claims.client_id.clone(),
            scopes: claims.scopes(),
            profile,
            claims,
        })
    }
}

/// Caller holding a valid, unrevoked access token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    /// Stored profile merged over the token's claims
    pub profile: MergedProfile,
    pub claims: AccessClaims,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    ResourceGuard: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = OAuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        // Extract data from parts before moving into async block
        let guard = ResourceGuard::from_ref(state);
        let token = extract_bearer_token(parts);

        async move {
            let token =
                token.ok_or_else(|| OAuthError::InvalidToken("missing bearer token".to_string()))?;
            guard.authenticate(&token).await
        }
    }
}

/// Authenticated caller whose merged role is `admin`
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for AdminUser
where
    ResourceGuard: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = OAuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let user = AuthenticatedUser::from_request_parts(parts, state).await?;
            if !user.profile.has_role(ADMIN_ROLE) {
                tracing::warn!(user_id = %user.user_id, "Non-admin caller rejected");
                return Err(OAuthError::AccessDenied("admin role required".to_string()));
            }
            Ok(AdminUser(user))
        }
    }
}

/// Keys other services present in `X-Service-Key`
#[derive(Clone, Default)]
pub struct ServiceKeys(Arc<Vec<String>>);

impl ServiceKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self(Arc::new(keys.into_iter().filter(|k| !k.is_empty()).collect()))
    }

    /// Constant-time match against every configured key
    pub fn accepts(&self, presented: &str) -> bool {
        self.0
            .iter()
            .fold(false, |found, key| constant_time_eq(key, presented) | found)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A trusted service calling an internal endpoint
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    /// Fingerprint of the presented key, for logs
    pub key_id: String,
}

impl<S> FromRequestParts<S> for ServiceCaller
where
    ServiceKeys: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = OAuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let keys = ServiceKeys::from_ref(state);
        let presented = parts
            .headers
            .get(HEADER_SERVICE_KEY)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        async move {
            match presented {
                Some(key) if keys.accepts(&key) => Ok(ServiceCaller {
                    key_id: super::fingerprint(&key),
                }),
                Some(_) => {
                    tracing::warn!("Unknown service key presented");
                    Err(OAuthError::InvalidClient("unknown service key".to_string()))
                }
                None => Err(OAuthError::InvalidClient("missing service key".to_string())),
            }
        }
    }
}

/// Helper to extract Bearer token from request
pub fn extract_bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
