//! Storage backends for Authority
//!
//! Persistence is split into one trait per concern so components depend only
//! on what they use. [`Storage`] bundles them for wiring.

pub mod memory;
pub mod sql_common;
pub mod sqlite;

use crate::{Result, model::*};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Registered client persistence
#[async_trait]
pub trait ClientStorage: Send + Sync {
    /// Insert or replace a client
    async fn save_client(&self, client: &Client) -> Result<()>;

    /// Get a client by ID, active or not
    async fn get_client(&self, id: &str) -> Result<Option<Client>>;

    /// List all clients, oldest first
    async fn list_clients(&self) -> Result<Vec<Client>>;
}

/// Authorization code persistence
#[async_trait]
pub trait AuthCodeStorage: Send + Sync {
    /// Persist a freshly issued code
    async fn save_authorization_code(&self, code: &AuthorizationCode) -> Result<()>;

    /// Atomically find and delete the code issued to `client_id`.
    ///
    /// At most one caller ever receives `Some` for a given code; this is what
    /// makes codes single-use under concurrent redemption.
    async fn take_authorization_code(
        &self,
        code_hash: &str,
        client_id: &str,
    ) -> Result<Option<AuthorizationCode>>;

    /// Delete codes whose expiry is at or before `now`
    async fn delete_expired_authorization_codes(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// OIDC session persistence
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Insert a session, or refresh the existing one for the same
    /// (user, client) pair. Returns the stored row; an existing session keeps
    /// its id and creation time.
    async fn upsert_session(&self, session: &Session) -> Result<Session>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Sessions of a user, optionally narrowed to one client
    async fn list_sessions(&self, user_id: &str, client_id: Option<&str>) -> Result<Vec<Session>>;

    /// Returns whether a session was deleted
    async fn delete_session(&self, id: &str) -> Result<bool>;

    /// Push the expiry out by `additional`; returns the new expiry
    async fn extend_session(&self, id: &str, additional: Duration)
    -> Result<Option<DateTime<Utc>>>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Token blacklist persistence
#[async_trait]
pub trait BlacklistStorage: Send + Sync {
    /// Insert an entry, merging with an existing (jti, user) entry by keeping
    /// the later creation and expiry times
    async fn save_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<()>;

    /// Insert only if no (jti, user) entry exists; returns whether inserted
    async fn insert_blacklist_entry_if_absent(&self, entry: &BlacklistEntry) -> Result<bool>;

    /// Whether an unexpired entry blocks the token
    async fn is_blacklisted(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Entries recorded for a user, newest first
    async fn list_blacklist_entries(&self, user_id: &str) -> Result<Vec<BlacklistEntry>>;

    async fn delete_expired_blacklist_entries(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// User profile persistence
#[async_trait]
pub trait UserStorage: Send + Sync {
    async fn save_user_profile(&self, profile: &UserProfile) -> Result<()>;

    async fn get_user_profile(&self, id: &str) -> Result<Option<UserProfile>>;
}

/// Every storage concern in one object-safe trait
pub trait Storage:
    ClientStorage + AuthCodeStorage + SessionStorage + BlacklistStorage + UserStorage
{
}

impl<T> Storage for T where
    T: ClientStorage + AuthCodeStorage + SessionStorage + BlacklistStorage + UserStorage
{
}

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Create a storage backend from configuration
pub async fn create_storage_from_config(
    config: &crate::config::StorageConfig,
) -> crate::Result<Arc<dyn Storage>> {
    match config.driver.as_str() {
        crate::constants::STORAGE_DRIVER_MEMORY => Ok(Arc::new(MemoryStorage::new())),
        crate::constants::STORAGE_DRIVER_SQLITE => {
            Ok(Arc::new(SqliteStorage::new(&config.dsn).await?))
        }
        _ => Err(crate::AuthorityError::config(format!(
            "Unknown storage driver: {}. Supported: memory, sqlite",
            config.driver
        ))),
    }
}

#[cfg(test)]
mod memory_test;
#[cfg(test)]
mod sqlite_test;
