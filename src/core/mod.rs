//! Service wiring
//!
//! Builds every component once from configuration and hands the same
//! shared instances to the HTTP server, the CLI and the sweeper.

use crate::Result;
use crate::auth::{
    AuthorizationCodeIssuer, AuthorizationFlow, ClientRegistry, HmacKeyProvider,
    RevocationRegistry, SessionStore, SigningKeyProvider, TokenIssuer, TokenPolicy,
};
use crate::config::Config;
use crate::scope::ScopeRegistry;
use crate::storage::Storage;
use std::sync::Arc;

/// Shared service components
#[derive(Clone)]
pub struct Dependencies {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub scopes: Arc<ScopeRegistry>,
    pub keys: Arc<dyn SigningKeyProvider>,
    pub clients: Arc<ClientRegistry>,
    pub codes: Arc<AuthorizationCodeIssuer>,
    pub tokens: Arc<TokenIssuer>,
    pub sessions: Arc<SessionStore>,
    pub revocation: Arc<RevocationRegistry>,
    pub flow: Arc<AuthorizationFlow>,
}

/// Create all dependencies from configuration
pub async fn create_dependencies(config: &Config) -> Result<Dependencies> {
    let storage = crate::storage::create_storage_from_config(&config.storage).await?;
    create_dependencies_with_storage(config, storage)
}

/// Same as [`create_dependencies`] over an existing storage backend
pub fn create_dependencies_with_storage(
    config: &Config,
    storage: Arc<dyn Storage>,
) -> Result<Dependencies> {
    let oauth = config.get_oauth();
    let blacklist = config.get_blacklist();
    let scopes = Arc::new(config.scope_registry()?);

    let signing = config.signing.clone().unwrap_or_default();
    let keys: Arc<dyn SigningKeyProvider> = match signing.secret {
        Some(ref secret) => Arc::new(HmacKeyProvider::from_secrets(
            secret,
            &signing.previous_secrets,
        )?),
        None => Arc::new(HmacKeyProvider::ephemeral()),
    };

    let clients = Arc::new(ClientRegistry::new(
        storage.clone(),
        scopes.clone(),
        oauth.allow_localhost_redirects,
    ));
    let codes = Arc::new(AuthorizationCodeIssuer::new(
        storage.clone(),
        scopes.clone(),
        oauth.code_ttl_secs,
    ));
    let tokens = Arc::new(TokenIssuer::new(
        keys.clone(),
        scopes.clone(),
        TokenPolicy::from_config(config),
    ));
    let sessions = Arc::new(SessionStore::new(storage.clone(), oauth.session_ttl_secs));
    let revocation = Arc::new(RevocationRegistry::new(
        storage.clone(),
        blacklist.check_timeout_ms,
        oauth.refresh_token_ttl_secs.max(oauth.access_token_ttl_secs),
    ));
    let flow = Arc::new(AuthorizationFlow::new(
        clients.clone(),
        codes.clone(),
        tokens.clone(),
        sessions.clone(),
        scopes.clone(),
        storage.clone(),
    ));

    Ok(Dependencies {
        config: Arc::new(config.clone()),
        storage,
        scopes,
        keys,
        clients,
        codes,
        tokens,
        sessions,
        revocation,
        flow,
    })
}
