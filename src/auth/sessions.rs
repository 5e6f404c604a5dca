//! OIDC sessions
//!
//! One session per (user, client). Sessions record which token ids were most
//! recently issued so a single device can be signed out; they never decide
//! whether a token is valid.

use crate::model::Session;
use crate::storage::Storage;
use crate::{AuthorityError, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Data recorded after a successful token exchange
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub nonce: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub claims: serde_json::Value,
    pub access_jti: Option<String>,
    pub refresh_jti: Option<String>,
    /// Lifetime override; the store default applies when `None`
    pub ttl: Option<Duration>,
}

pub struct SessionStore {
    storage: Arc<dyn Storage>,
    default_ttl: Duration,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, default_ttl_secs: i64) -> Self {
        Self {
            storage,
            default_ttl: Duration::seconds(default_ttl_secs),
        }
    }

    /// Create the session for (user, client) or refresh the existing one
    pub async fn upsert(&self, new: NewSession) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: new.user_id,
            client_id: new.client_id,
            scopes: new.scopes,
            nonce: new.nonce,
            auth_time: new.auth_time,
            claims: new.claims,
            access_jti: new.access_jti,
            refresh_jti: new.refresh_jti,
            created_at: now,
            expires_at: now + new.ttl.unwrap_or(self.default_ttl),
        };

        let stored = self.storage.upsert_session(&session).await?;
        tracing::debug!(
            session_id = %stored.id,
            user_id = %stored.user_id,
            client_id = %stored.client_id,
            "Session recorded"
        );
        Ok(stored)
    }

    pub async fn list(&self, user_id: &str, client_id: Option<&str>) -> Result<Vec<Session>> {
        self.storage.list_sessions(user_id, client_id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.storage.get_session(id).await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<bool> {
        self.storage.delete_session(id).await
    }

    pub async fn extend(&self, id: &str, additional_secs: i64) -> Result<DateTime<Utc>> {
        if additional_secs <= 0 {
            return Err(AuthorityError::validation(
                "session extension must be positive",
            ));
        }
        self.storage
            .extend_session(id, Duration::seconds(additional_secs))
            .await?
            .ok_or_else(|| AuthorityError::not_found(format!("session '{id}'")))
    }

    pub async fn sweep_expired(&self) -> Result<u64> {
        self.storage.delete_expired_sessions(Utc::now()).await
    }
}
