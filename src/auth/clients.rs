//! Client registry
//!
//! Registration, lookup, credential checks and lifecycle of OAuth clients.
//! Secrets are generated here, returned once, and stored only as digests.

use super::{constant_time_eq, generate_random_token, sha256_hex};
use crate::constants::MAX_REDIRECT_URI_LEN;
use crate::error::OAuthError;
use crate::model::Client;
use crate::scope::ScopeRegistry;
use crate::storage::Storage;
use crate::{AuthorityError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

/// Registration request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ClientSpec {
    #[validate(length(min = 1, max = 100))]
    pub name: String,

    #[validate(length(min = 1, max = 20))]
    pub redirect_uris: Vec<String>,

    #[validate(length(min = 1))]
    pub allowed_scopes: Vec<String>,

    /// Confidential clients get a secret; public clients must use PKCE
    #[serde(default = "default_confidential")]
    pub confidential: bool,

    /// Skip the duplicate-name check
    #[serde(default)]
    pub allow_duplicate_name: bool,
}

fn default_confidential() -> bool {
    true
}

/// Partial update of a client's metadata
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ClientUpdate {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,

    #[validate(length(min = 1, max = 20))]
    pub redirect_uris: Option<Vec<String>>,

    #[validate(length(min = 1))]
    pub allowed_scopes: Option<Vec<String>>,

    pub active: Option<bool>,
}

/// A client together with its freshly generated plaintext secret
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredClient {
    #[serde(flatten)]
    pub client: Client,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

pub struct ClientRegistry {
    storage: Arc<dyn Storage>,
    scopes: Arc<ScopeRegistry>,
    allow_localhost_redirects: bool,
}

impl ClientRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        scopes: Arc<ScopeRegistry>,
        allow_localhost_redirects: bool,
    ) -> Self {
        Self {
            storage,
            scopes,
            allow_localhost_redirects,
        }
    }

    /// Register a new client and return its one-time plaintext secret
    pub async fn register(&self, spec: ClientSpec) -> Result<RegisteredClient> {
        spec.validate()
            .map_err(|e| AuthorityError::validation(e.to_string()))?;
        self.check_redirect_uris(&spec.redirect_uris)?;
        self.scopes.ensure_known(&spec.allowed_scopes)?;

        if !spec.allow_duplicate_name {
            let taken = self
                .storage
                .list_clients()
                .await?
                .iter()
                .any(|c| c.name == spec.name);
            if taken {
                return Err(AuthorityError::validation(format!(
                    "a client named '{}' already exists",
                    spec.name
                )));
            }
        }

        let secret = spec.confidential.then(generate_random_token);
        let now = Utc::now();
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            secret_hash: secret.as_deref().map(sha256_hex),
            name: spec.name,
            redirect_uris: spec.redirect_uris,
            allowed_scopes: spec.allowed_scopes,
            active: true,
            created_at: now,
            updated_at: now,
        };

        self.storage.save_client(&client).await?;
        tracing::info!(
            client_id = %client.id,
            confidential = client.is_confidential(),
            "Registered OAuth client"
        );

        Ok(RegisteredClient {
            client,
            client_secret: secret,
        })
    }

    /// Administrative lookup; includes inactive clients
    pub async fn find(&self, client_id: &str) -> Result<Client> {
        self.storage
            .get_client(client_id)
            .await?
            .ok_or_else(|| AuthorityError::not_found(format!("client '{client_id}'")))
    }

    /// Lookup used by protocol endpoints; inactive clients do not exist
    pub async fn find_active(&self, client_id: &str) -> Result<Option<Client>> {
        Ok(self
            .storage
            .get_client(client_id)
            .await?
            .filter(|c| c.active))
    }

    pub async fn list(&self) -> Result<Vec<Client>> {
        self.storage.list_clients().await
    }

    /// Authenticate a client at the token endpoint.
    ///
    /// Confidential clients must present their secret; public clients must
    /// not present one.
    pub async fn validate_credentials(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Client> {
        let client = self
            .find_active(client_id)
            .await?
            .ok_or_else(|| OAuthError::InvalidClient("unknown client".to_string()))?;

        match (&client.secret_hash, client_secret) {
            (Some(stored), Some(presented)) => {
                if !constant_time_eq(stored, &sha256_hex(presented)) {
                    tracing::warn!(client_id = %client_id, "Client secret mismatch");
                    return Err(OAuthError::InvalidClient("invalid client credentials".to_string()).into());
                }
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidClient("client authentication required".to_string()).into());
            }
            (None, Some(_)) => {
                return Err(OAuthError::InvalidClient(
                    "public clients do not authenticate with a secret".to_string(),
                )
                .into());
            }
            (None, None) => {}
        }

        Ok(client)
    }

    /// Soft-delete: the client can no longer authorize or redeem
    pub async fn deactivate(&self, client_id: &str) -> Result<Client> {
        let mut client = self.find(client_id).await?;
        client.active = false;
        client.updated_at = Utc::now();
        self.storage.save_client(&client).await?;
        tracing::info!(client_id = %client_id, "Deactivated OAuth client");
        Ok(client)
    }

    /// Replace the client secret; the old one stops working immediately
    pub async fn rotate_secret(&self, client_id: &str) -> Result<String> {
        let mut client = self.find(client_id).await?;
        if !client.is_confidential() {
            return Err(AuthorityError::validation(
                "public clients do not have a secret",
            ));
        }

        let secret = generate_random_token();
        client.secret_hash = Some(sha256_hex(&secret));
        client.updated_at = Utc::now();
        self.storage.save_client(&client).await?;
        tracing::info!(client_id = %client_id, "Rotated OAuth client secret");
        Ok(secret)
    }

    pub async fn update(&self, client_id: &str, changes: ClientUpdate) -> Result<Client> {
        changes
            .validate()
            .map_err(|e| AuthorityError::validation(e.to_string()))?;

        let mut client = self.find(client_id).await?;

        if let Some(name) = changes.name {
            client.name = name;
        }
        if let Some(uris) = changes.redirect_uris {
            self.check_redirect_uris(&uris)?;
            client.redirect_uris = uris;
        }
        if let Some(scopes) = changes.allowed_scopes {
            self.scopes.ensure_known(&scopes)?;
            client.allowed_scopes = scopes;
        }
        if let Some(active) = changes.active {
            client.active = active;
        }

        client.updated_at = Utc::now();
        self.storage.save_client(&client).await?;
        Ok(client)
    }

    fn check_redirect_uris(&self, uris: &[String]) -> Result<()> {
        match uris
            .iter()
            .find(|uri| !is_valid_redirect_uri(uri, self.allow_localhost_redirects))
        {
            Some(bad) => Err(AuthorityError::validation(format!(
                "invalid redirect URI '{bad}': must be https (or loopback http), without fragment"
            ))),
            None => Ok(()),
        }
    }
}

/// Redirect URIs must be https (or http on loopback when allowed) and carry no fragment
pub fn is_valid_redirect_uri(uri: &str, allow_localhost: bool) -> bool {
    if uri.is_empty() || uri.len() > MAX_REDIRECT_URI_LEN {
        return false;
    }

    let Ok(parsed) = url::Url::parse(uri) else {
        return false;
    };

    let loopback = matches!(parsed.host_str(), Some("localhost") | Some("127.0.0.1"));
    let scheme_ok = match parsed.scheme() {
        "https" => true,
        "http" => allow_localhost && loopback,
        _ => false,
    };

    scheme_ok && parsed.fragment().is_none() && parsed.host_str().is_some()
}
