//! Authorization codes
//!
//! Validates authorization requests, issues single-use codes bound to the
//! client, redirect URI and PKCE challenge, and redeems them atomically.

use super::{constant_time_eq, fingerprint, generate_random_token, sha256_hex};
use crate::constants::{PKCE_METHOD_S256, RESPONSE_TYPE_CODE};
use crate::error::OAuthError;
use crate::model::{AuthorizationCode, Client, ProfileClaims};
use crate::scope::ScopeRegistry;
use crate::storage::Storage;
use crate::{Result, telemetry};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Query parameters of `GET /oauth/authorize`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationRequest {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub redirect_uri: String,

    #[serde(default)]
    pub response_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl AuthorizationRequest {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(ScopeRegistry::parse)
            .unwrap_or_default()
    }
}

/// Everything a code is bound to at issuance
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub claims: ProfileClaims,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

/// Result of a successful redemption
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemedCode {
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub claims: ProfileClaims,
    pub pkce_verified: bool,
}

pub struct AuthorizationCodeIssuer {
    storage: Arc<dyn Storage>,
    scopes: Arc<ScopeRegistry>,
    ttl: Duration,
}

impl AuthorizationCodeIssuer {
    pub fn new(storage: Arc<dyn Storage>, scopes: Arc<ScopeRegistry>, ttl_secs: i64) -> Self {
        Self {
            storage,
            scopes,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Validate an authorization request.
    ///
    /// Checks run in a fixed order: client, redirect URI, response type,
    /// scopes, PKCE. The first two failures mean the redirect URI cannot be
    /// trusted; callers must render those rather than redirect.
    pub async fn validate_request(&self, request: &AuthorizationRequest) -> Result<Client> {
        let client = self
            .storage
            .get_client(&request.client_id)
            .await?
            .filter(|c| c.active)
            .ok_or_else(|| OAuthError::InvalidClient("unknown or inactive client".to_string()))?;

        if !client.has_redirect_uri(&request.redirect_uri) {
            return Err(OAuthError::InvalidRedirectUri(
                "redirect_uri is not registered for this client".to_string(),
            )
            .into());
        }

        if request.response_type != RESPONSE_TYPE_CODE {
            return Err(OAuthError::UnsupportedResponseType(format!(
                "only '{RESPONSE_TYPE_CODE}' is supported"
            ))
            .into());
        }

        let scopes = request.scopes();
        if scopes.is_empty() {
            return Err(OAuthError::InvalidScope("scope is required".to_string()).into());
        }
        self.scopes.ensure_known(&scopes)?;
        if !client.allows_scopes(&scopes) {
            return Err(OAuthError::InvalidScope(
                "requested scope exceeds what the client may request".to_string(),
            )
            .into());
        }

        match (
            request.code_challenge.as_deref(),
            request.code_challenge_method.as_deref(),
        ) {
            (None, Some(_)) => {
                return Err(OAuthError::InvalidRequest(
                    "code_challenge_method without code_challenge".to_string(),
                )
                .into());
            }
            (Some(_), Some(method)) if method != PKCE_METHOD_S256 => {
                return Err(OAuthError::InvalidRequest(format!(
                    "unsupported code_challenge_method '{method}', use S256"
                ))
                .into());
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidRequest(
                    "code_challenge_method is required, use S256".to_string(),
                )
                .into());
            }
            (Some(challenge), Some(_)) if !is_valid_challenge(challenge) => {
                return Err(
                    OAuthError::InvalidRequest("malformed code_challenge".to_string()).into(),
                );
            }
            (None, None) if !client.is_confidential() => {
                return Err(OAuthError::InvalidRequest(
                    "public clients must use PKCE".to_string(),
                )
                .into());
            }
            _ => {}
        }

        Ok(client)
    }

    /// Issue a code for an authenticated user
    pub async fn issue(&self, grant: AuthorizationGrant) -> Result<String> {
        self.issue_at(grant, Utc::now()).await
    }

    pub async fn issue_at(&self, grant: AuthorizationGrant, now: DateTime<Utc>) -> Result<String> {
        let code = generate_random_token();
        let record = AuthorizationCode {
            code_hash: sha256_hex(&code),
            client_id: grant.client_id,
            user_id: grant.user_id,
            scopes: grant.scopes,
            redirect_uri: grant.redirect_uri,
            nonce: grant.nonce,
            auth_time: grant.auth_time,
            claims: grant.claims,
            code_challenge: grant.code_challenge,
            code_challenge_method: grant.code_challenge_method,
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.storage.save_authorization_code(&record).await?;
        tracing::debug!(
            code = %fingerprint(&code),
            client_id = %record.client_id,
            user_id = %record.user_id,
            "Issued authorization code"
        );
        Ok(code)
    }

    /// Redeem a code exactly once
    pub async fn redeem(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<RedeemedCode> {
        self.redeem_at(code, client_id, redirect_uri, code_verifier, Utc::now())
            .await
    }

    pub async fn redeem_at(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RedeemedCode> {
        let result = self
            .redeem_inner(code, client_id, redirect_uri, code_verifier, now)
            .await;

        match &result {
            Ok(_) => telemetry::record_code_redemption("success"),
            Err(err) => {
                tracing::info!(
                    code = %fingerprint(code),
                    client_id = %client_id,
                    error = %err,
                    "Authorization code redemption rejected"
                );
                telemetry::record_code_redemption("rejected");
            }
        }
        result
    }

    async fn redeem_inner(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RedeemedCode> {
        // The take is the only synchronization point: whoever deletes the
        // row owns the code, every later caller sees nothing.
        let record = self
            .storage
            .take_authorization_code(&sha256_hex(code), client_id)
            .await?
            .ok_or(OAuthError::InvalidOrExpiredCode)?;

        if record.is_expired_at(now) {
            return Err(OAuthError::InvalidOrExpiredCode.into());
        }

        if record.redirect_uri != redirect_uri {
            return Err(OAuthError::RedirectUriMismatch.into());
        }

        let pkce_verified = match (record.code_challenge.as_deref(), code_verifier) {
            (Some(challenge), Some(verifier)) => {
                verify_pkce(verifier, challenge)?;
                true
            }
            (Some(_), None) => {
                return Err(OAuthError::PkceMismatch("code_verifier is required".to_string()).into());
            }
            (None, Some(_)) => {
                return Err(OAuthError::PkceMismatch(
                    "code_verifier sent but no challenge was registered".to_string(),
                )
                .into());
            }
            (None, None) => false,
        };

        Ok(RedeemedCode {
            user_id: record.user_id,
            client_id: record.client_id,
            scopes: record.scopes,
            nonce: record.nonce,
            auth_time: record.auth_time,
            claims: record.claims,
            pkce_verified,
        })
    }

    /// Delete codes already past expiry
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.storage
            .delete_expired_authorization_codes(Utc::now())
            .await
    }
}

/// S256 challenge for a verifier
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Check a verifier against a stored S256 challenge in constant time
pub fn verify_pkce(verifier: &str, challenge: &str) -> std::result::Result<(), OAuthError> {
    let well_formed = (43..=128).contains(&verifier.len())
        && verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'));
    if !well_formed {
        return Err(OAuthError::PkceMismatch("malformed code_verifier".to_string()));
    }

    if !constant_time_eq(&pkce_challenge(verifier), challenge) {
        return Err(OAuthError::PkceMismatch(
            "code_verifier does not match code_challenge".to_string(),
        ));
    }
    Ok(())
}

// base64url of a SHA-256 digest is always 43 characters
fn is_valid_challenge(challenge: &str) -> bool {
    challenge.len() == 43
        && challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
