//! Token revocation
//!
//! The blacklist consulted on every authenticated request, here and in every
//! dependent service. A lookup that cannot complete in time counts as
//! revoked.

use super::tokens::JwtClaims;
use crate::constants::{ALL_TOKENS, HEADER_SERVICE_KEY, TOKEN_LEEWAY_SECS};
use crate::error::NetworkError;
use crate::model::{BlacklistEntry, RevocationReason};
use crate::storage::Storage;
use crate::{Result, telemetry};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a single blacklist lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Valid,
    Revoked,
    /// The lookup failed or timed out; callers must treat this as revoked
    Unavailable,
}

impl RevocationStatus {
    pub fn is_revoked(self) -> bool {
        !matches!(self, RevocationStatus::Valid)
    }

    fn as_str(self) -> &'static str {
        match self {
            RevocationStatus::Valid => "valid",
            RevocationStatus::Revoked => "revoked",
            RevocationStatus::Unavailable => "unavailable",
        }
    }
}

/// Answers "is this token revoked?"
#[async_trait]
pub trait RevocationCheck: Send + Sync {
    async fn check(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
    ) -> RevocationStatus;
}

pub struct RevocationRegistry {
    storage: Arc<dyn Storage>,
    lookup_timeout: std::time::Duration,
    all_tokens_ttl: Duration,
}

impl RevocationRegistry {
    /// `all_tokens_ttl_secs` must cover the longest-lived token type
    pub fn new(storage: Arc<dyn Storage>, lookup_timeout_ms: u64, all_tokens_ttl_secs: i64) -> Self {
        Self {
            storage,
            lookup_timeout: std::time::Duration::from_millis(lookup_timeout_ms),
            all_tokens_ttl: Duration::seconds(all_tokens_ttl_secs),
        }
    }

    /// Blacklist one token for `ttl` plus the verifier's clock leeway
    pub async fn revoke(
        &self,
        jti: &str,
        user_id: &str,
        reason: RevocationReason,
        ttl: Duration,
    ) -> Result<()> {
        let entry = new_entry(jti, user_id, reason, ttl, Utc::now());
        self.storage.save_blacklist_entry(&entry).await?;
        tracing::info!(jti = %jti, user_id = %user_id, reason = %reason, "Token revoked");
        Ok(())
    }

    /// Revoke a verified token until its own expiry
    pub async fn revoke_token<T: JwtClaims>(&self, claims: &T, reason: RevocationReason) -> Result<()> {
        let remaining = (claims.expires_at() - Utc::now().timestamp()).max(0);
        self.revoke(
            claims.jti(),
            claims.subject(),
            reason,
            Duration::seconds(remaining),
        )
        .await
    }

    /// Revoke every token issued to the user up to now
    pub async fn revoke_all_for_user(&self, user_id: &str, reason: RevocationReason) -> Result<()> {
        let entry = new_entry(ALL_TOKENS, user_id, reason, self.all_tokens_ttl, Utc::now());
        self.storage.save_blacklist_entry(&entry).await?;
        tracing::info!(user_id = %user_id, reason = %reason, "All tokens revoked for user");
        Ok(())
    }

    /// Insert the entry only if absent; `false` means it was already used
    pub async fn consume_once(
        &self,
        jti: &str,
        user_id: &str,
        reason: RevocationReason,
        ttl: Duration,
    ) -> Result<bool> {
        let entry = new_entry(jti, user_id, reason, ttl, Utc::now());
        self.storage.insert_blacklist_entry_if_absent(&entry).await
    }

    /// Fail-closed membership test
    pub async fn is_revoked(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.status(jti, user_id, issued_at).await.is_revoked()
    }

    /// One bounded lookup; no retries
    pub async fn status(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
    ) -> RevocationStatus {
        let lookup = self
            .storage
            .is_blacklisted(jti, user_id, issued_at, Utc::now());

        let status = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(true)) => RevocationStatus::Revoked,
            Ok(Ok(false)) => RevocationStatus::Valid,
            Ok(Err(e)) => {
                tracing::error!(error = %e, jti = %jti, "Blacklist lookup failed, treating token as revoked");
                RevocationStatus::Unavailable
            }
            Err(_) => {
                tracing::error!(
                    jti = %jti,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Blacklist lookup timed out, treating token as revoked"
                );
                RevocationStatus::Unavailable
            }
        };
        telemetry::record_blacklist_check(status.as_str());
        status
    }

    pub async fn entries_for_user(&self, user_id: &str) -> Result<Vec<BlacklistEntry>> {
        self.storage.list_blacklist_entries(user_id).await
    }

    /// Delete entries already past their retention deadline
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.storage
            .delete_expired_blacklist_entries(Utc::now())
            .await
    }
}

#[async_trait]
impl RevocationCheck for RevocationRegistry {
    async fn check(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
    ) -> RevocationStatus {
        self.status(jti, user_id, issued_at).await
    }
}

fn new_entry(
    jti: &str,
    user_id: &str,
    reason: RevocationReason,
    ttl: Duration,
    now: DateTime<Utc>,
) -> BlacklistEntry {
    BlacklistEntry {
        id: Uuid::new_v4().to_string(),
        jti: jti.to_string(),
        user_id: user_id.to_string(),
        reason,
        created_at: now,
        expires_at: now + ttl + Duration::seconds(TOKEN_LEEWAY_SECS as i64),
    }
}

/// Body of `POST /token/check-blacklist`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistCheckRequest {
    pub jti: String,
    pub user_id: String,
    /// Token issue time (unix seconds), needed to evaluate revoke-all entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistCheckResponse {
    pub blacklisted: bool,
}

/// Blacklist check over HTTP, for services that do not own the blacklist
pub struct RemoteRevocationClient {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
}

impl RemoteRevocationClient {
    pub fn new(base_url: &str, service_key: &str, timeout_ms: u64) -> Result<Self> {
        // A relative join keeps any path prefix the authority is mounted under
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let endpoint = url::Url::parse(&base)
            .and_then(|base| base.join("token/check-blacklist"))
            .map_err(|e| NetworkError::InvalidUrl(format!("{base_url}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(NetworkError::from)?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            service_key: service_key.to_string(),
        })
    }

    async fn lookup(&self, body: &BlacklistCheckRequest) -> std::result::Result<bool, NetworkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(HEADER_SERVICE_KEY, &self.service_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NetworkError::Http(format!(
                "blacklist check returned {}",
                response.status()
            )));
        }

        Ok(response.json::<BlacklistCheckResponse>().await?.blacklisted)
    }
}

#[async_trait]
impl RevocationCheck for RemoteRevocationClient {
    async fn check(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
    ) -> RevocationStatus {
        let body = BlacklistCheckRequest {
            jti: jti.to_string(),
            user_id: user_id.to_string(),
            iat: issued_at.map(|t| t.timestamp()),
        };

        let status = match self.lookup(&body).await {
            Ok(true) => RevocationStatus::Revoked,
            Ok(false) => RevocationStatus::Valid,
            Err(e) => {
                tracing::error!(error = %e, jti = %jti, "Remote blacklist check failed, treating token as revoked");
                RevocationStatus::Unavailable
            }
        };
        telemetry::record_blacklist_check(status.as_str());
        status
    }
}
