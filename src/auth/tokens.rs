//! JWT issuance and verification
//!
//! Access, ID and refresh tokens are self-contained JWTs signed through a
//! [`SigningKeyProvider`]. Every token carries a fresh UUID v4 `jti` so it can
//! be individually revoked. The same signer is used for the short-lived
//! browser artefacts of the login handoff.

use super::keys::SigningKeyProvider;
use crate::config::Config;
use crate::constants::{
    GRANT_CLIENT_CREDENTIALS, SCOPE_OPENID, SERVICE_SUBJECT_PREFIX, TOKEN_LEEWAY_SECS,
    TOKEN_TYPE_BEARER,
};
use crate::error::OAuthError;
use crate::model::ProfileClaims;
use crate::scope::ScopeRegistry;
use crate::{Result, telemetry};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Header, Validation, decode, decode_header, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// What a signed token may be used for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Id,
    Refresh,
    Browser,
    LoginTicket,
    Pending,
}

/// Registered claims every token signed here exposes
pub trait JwtClaims: Serialize + DeserializeOwned + Clone {
    fn token_use(&self) -> TokenUse;
    fn jti(&self) -> &str;
    fn subject(&self) -> &str;
    fn issued_at(&self) -> i64;
    fn expires_at(&self) -> i64;
}

macro_rules! impl_jwt_claims {
    ($ty:ty, $sub:ident) => {
        impl JwtClaims for $ty {
            fn token_use(&self) -> TokenUse {
                self.token_use
            }
            fn jti(&self) -> &str {
                &self.jti
            }
            fn subject(&self) -> &str {
                &self.$sub
            }
            fn issued_at(&self) -> i64 {
                self.iat
            }
            fn expires_at(&self) -> i64 {
                self.exp
            }
        }
    };
}
pub(crate) use impl_jwt_claims;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    /// Services that honour the granted scopes
    pub aud: Vec<String>,
    pub client_id: String,
    pub scope: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub token_use: TokenUse,
    #[serde(flatten)]
    pub profile: ProfileClaims,
}

impl AccessClaims {
    pub fn scopes(&self) -> Vec<String> {
        ScopeRegistry::parse(&self.scope)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    /// Client-credentials tokens act for a client, not a user
    pub fn is_service_token(&self) -> bool {
        self.sub.starts_with(SERVICE_SUBJECT_PREFIX)
    }
}

impl_jwt_claims!(AccessClaims, sub);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdClaims {
    pub iss: String,
    pub sub: String,
    /// The client the ID token was issued to
    pub aud: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub auth_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub token_use: TokenUse,
    #[serde(flatten)]
    pub profile: ProfileClaims,
}

impl_jwt_claims!(IdClaims, sub);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshClaims {
    pub iss: String,
    pub sub: String,
    pub client_id: String,
    pub scope: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub token_use: TokenUse,
}

impl_jwt_claims!(RefreshClaims, sub);

/// Issuer URL and token lifetimes
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    pub issuer: String,
    pub access_ttl_secs: i64,
    pub id_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

impl TokenPolicy {
    pub fn from_config(config: &Config) -> Self {
        let oauth = config.get_oauth();
        Self {
            issuer: config.issuer(),
            access_ttl_secs: oauth.access_token_ttl_secs,
            id_ttl_secs: oauth.id_token_ttl_secs,
            refresh_ttl_secs: oauth.refresh_token_ttl_secs,
        }
    }
}

/// Inputs for the ID token
#[derive(Debug, Clone)]
pub struct IdTokenContext {
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub profile: ProfileClaims,
}

/// A freshly minted token set
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: String,
    pub access_jti: String,
    pub refresh_jti: Option<String>,
}

/// Body of a successful `/oauth/token` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

impl From<IssuedTokens> for TokenResponse {
    fn from(tokens: IssuedTokens) -> Self {
        Self {
            access_token: tokens.access_token,
            token_type: TOKEN_TYPE_BEARER.to_string(),
            expires_in: tokens.expires_in,
            id_token: tokens.id_token,
            refresh_token: tokens.refresh_token,
            scope: tokens.scope,
        }
    }
}

pub struct TokenIssuer {
    keys: Arc<dyn SigningKeyProvider>,
    scopes: Arc<ScopeRegistry>,
    policy: TokenPolicy,
}

impl TokenIssuer {
    pub fn new(
        keys: Arc<dyn SigningKeyProvider>,
        scopes: Arc<ScopeRegistry>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            keys,
            scopes,
            policy,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.policy.issuer
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    pub fn keys(&self) -> &Arc<dyn SigningKeyProvider> {
        &self.keys
    }

    /// Mint access, refresh and (for `openid`) ID tokens for a user
    pub fn issue(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
        context: IdTokenContext,
    ) -> Result<IssuedTokens> {
        self.issue_at(user_id, client_id, scopes, context, Utc::now())
    }

    pub fn issue_at(
        &self,
        user_id: &str,
        client_id: &str,
        scopes: &[String],
        context: IdTokenContext,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens> {
        let iat = now.timestamp();
        let scope = scopes.join(" ");
        let profile = scoped_profile(&context.profile, scopes);

        let access_jti = new_jti();
        let access = AccessClaims {
            iss: self.policy.issuer.clone(),
            sub: user_id.to_string(),
            aud: self.scopes.audiences(scopes),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            jti: access_jti.clone(),
            iat,
            exp: iat + self.policy.access_ttl_secs,
            token_use: TokenUse::Access,
            profile: profile.clone(),
        };

        let id_token = if scopes.iter().any(|s| s == SCOPE_OPENID) {
            let id = IdClaims {
                iss: self.policy.issuer.clone(),
                sub: user_id.to_string(),
                aud: client_id.to_string(),
                jti: new_jti(),
                iat,
                exp: iat + self.policy.id_ttl_secs,
                auth_time: context.auth_time.timestamp(),
                nonce: context.nonce,
                token_use: TokenUse::Id,
                profile,
            };
            Some(self.sign(&id)?)
        } else {
            None
        };

        let refresh_jti = new_jti();
        let refresh = RefreshClaims {
            iss: self.policy.issuer.clone(),
            sub: user_id.to_string(),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            jti: refresh_jti.clone(),
            iat,
            exp: iat + self.policy.refresh_ttl_secs,
            token_use: TokenUse::Refresh,
        };

        let tokens = IssuedTokens {
            access_token: self.sign(&access)?,
            id_token,
            refresh_token: Some(self.sign(&refresh)?),
            expires_in: self.policy.access_ttl_secs,
            scope,
            access_jti,
            refresh_jti: Some(refresh_jti),
        };

        tracing::debug!(
            user_id = %user_id,
            client_id = %client_id,
            jti = %tokens.access_jti,
            "Issued token set"
        );
        Ok(tokens)
    }

    /// Access token for a client acting on its own behalf
    pub fn issue_service_token(&self, client_id: &str, scopes: &[String]) -> Result<IssuedTokens> {
        let iat = Utc::now().timestamp();
        let scope = scopes.join(" ");
        let jti = new_jti();
        let claims = AccessClaims {
            iss: self.policy.issuer.clone(),
            sub: format!("{SERVICE_SUBJECT_PREFIX}{client_id}"),
            aud: self.scopes.audiences(scopes),
            client_id: client_id.to_string(),
            scope: scope.clone(),
            jti: jti.clone(),
            iat,
            exp: iat + self.policy.access_ttl_secs,
            token_use: TokenUse::Access,
            profile: ProfileClaims::default(),
        };

        telemetry::record_tokens_issued(GRANT_CLIENT_CREDENTIALS);
        Ok(IssuedTokens {
            access_token: self.sign(&claims)?,
            id_token: None,
            refresh_token: None,
            expires_in: self.policy.access_ttl_secs,
            scope,
            access_jti: jti,
            refresh_jti: None,
        })
    }

    pub fn verify_access(&self, token: &str) -> std::result::Result<AccessClaims, OAuthError> {
        self.verify(token, TokenUse::Access, None)
    }

    /// Verify an ID token issued to `client_id`
    pub fn verify_id(&self, token: &str, client_id: &str) -> std::result::Result<IdClaims, OAuthError> {
        self.verify(token, TokenUse::Id, Some(client_id))
    }

    pub fn verify_refresh(&self, token: &str) -> std::result::Result<RefreshClaims, OAuthError> {
        self.verify(token, TokenUse::Refresh, None)
    }

    /// Sign any claim set with the active key
    pub fn sign<T: JwtClaims>(&self, claims: &T) -> Result<String> {
        let (kid, key) = self.keys.signing_key();
        let mut header = Header::new(self.keys.algorithm());
        header.kid = Some(kid);
        Ok(encode(&header, claims, &key)?)
    }

    /// Verify signature, issuer, expiry, audience (when given), use and `jti`
    pub fn verify<T: JwtClaims>(
        &self,
        token: &str,
        expected: TokenUse,
        audience: Option<&str>,
    ) -> std::result::Result<T, OAuthError> {
        let header = decode_header(token)
            .map_err(|_| OAuthError::InvalidToken("malformed token".to_string()))?;
        if header.alg != self.keys.algorithm() {
            return Err(OAuthError::InvalidToken("unexpected signing algorithm".to_string()));
        }
        let key = self
            .keys
            .verification_key(header.kid.as_deref())
            .ok_or_else(|| OAuthError::InvalidToken("unknown signing key".to_string()))?;

        let mut validation = Validation::new(self.keys.algorithm());
        validation.leeway = TOKEN_LEEWAY_SECS;
        validation.set_issuer(&[&self.policy.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let claims = decode::<T>(token, &key, &validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token rejected");
                OAuthError::InvalidToken(match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => "token expired".to_string(),
                    _ => "token verification failed".to_string(),
                })
            })?
            .claims;

        if claims.token_use() != expected {
            return Err(OAuthError::InvalidToken("wrong token type".to_string()));
        }
        if claims.jti().is_empty() {
            return Err(OAuthError::InvalidToken("token has no jti".to_string()));
        }
        Ok(claims)
    }
}

/// Keep only the profile claims the granted scopes cover
pub fn scoped_profile(profile: &ProfileClaims, scopes: &[String]) -> ProfileClaims {
    let has = |name: &str| scopes.iter().any(|s| s == name);
    let profile_scope = has("profile");
    ProfileClaims {
        name: profile.name.clone().filter(|_| profile_scope),
        email: profile.email.clone().filter(|_| has("email")),
        role: profile.role.clone().filter(|_| profile_scope),
        permissions: profile.permissions.clone().filter(|_| profile_scope),
    }
}

pub fn new_jti() -> String {
    Uuid::new_v4().to_string()
}
