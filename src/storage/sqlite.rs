//! SQLite storage implementation
//!
//! Persistent storage for clients, authorization codes, sessions, the token
//! blacklist and user profiles.

use crate::model::*;
use crate::storage::{
    AuthCodeStorage, BlacklistStorage, ClientStorage, SessionStorage, UserStorage, sql_common::*,
};
use crate::{AuthorityError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::path::Path;

const SESSION_COLUMNS: &str = "id, user_id, client_id, scopes, nonce, auth_time, claims, \
     access_jti, refresh_jti, created_at, expires_at";

const BLACKLIST_COLUMNS: &str = "id, jti, user_id, reason, created_at, expires_at";

/// SQLite storage backend
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage
    ///
    /// # Arguments
    /// * `dsn` - Database path (e.g., "~/.authority/authority.db" or ":memory:" for in-memory)
    pub async fn new(dsn: &str) -> Result<Self> {
        let in_memory = dsn == ":memory:" || dsn == "sqlite::memory:";

        // Prepend sqlite: prefix if not present and add create-if-missing option
        let connection_string = if in_memory {
            "sqlite::memory:".to_string()
        } else if dsn.starts_with("sqlite:") {
            if dsn.contains('?') {
                dsn.to_string()
            } else {
                format!("{}?mode=rwc", dsn)
            }
        } else {
            format!("sqlite:{}?mode=rwc", dsn)
        };

        let file_path = dsn.strip_prefix("sqlite:").unwrap_or(dsn);

        // Validate path to prevent directory traversal attacks
        if file_path.contains("..") {
            return Err(AuthorityError::config(
                "Database path cannot contain '..' (path traversal not allowed)",
            ));
        }

        if !in_memory
            && let Some(parent) = Path::new(file_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePool::connect(&connection_string)
            .await
            .map_err(|e| AuthorityError::storage(format!("Failed to connect to SQLite: {}", e)))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .map_err(|e| AuthorityError::storage(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!(dsn = %file_path, "SQLite storage ready");

        Ok(Self { pool })
    }

    fn parse_client(row: &SqliteRow) -> Result<Client> {
        Ok(Client {
            id: row.try_get("id")?,
            secret_hash: row.try_get("secret_hash")?,
            name: row.try_get("name")?,
            redirect_uris: decode_list(&row.try_get::<String, _>("redirect_uris")?)?,
            allowed_scopes: decode_list(&row.try_get::<String, _>("allowed_scopes")?)?,
            active: row.try_get::<i64, _>("active")? != 0,
            created_at: from_unix("created_at", row.try_get("created_at")?)?,
            updated_at: from_unix("updated_at", row.try_get("updated_at")?)?,
        })
    }

    fn parse_code(row: &SqliteRow) -> Result<AuthorizationCode> {
        Ok(AuthorizationCode {
            code_hash: row.try_get("code_hash")?,
            client_id: row.try_get("client_id")?,
            user_id: row.try_get("user_id")?,
            scopes: decode_list(&row.try_get::<String, _>("scopes")?)?,
            redirect_uri: row.try_get("redirect_uri")?,
            nonce: row.try_get("nonce")?,
            auth_time: from_unix("auth_time", row.try_get("auth_time")?)?,
            claims: serde_json::from_str(&row.try_get::<String, _>("claims")?)?,
            code_challenge: row.try_get("code_challenge")?,
            code_challenge_method: row.try_get("code_challenge_method")?,
            created_at: from_unix("created_at", row.try_get("created_at")?)?,
            expires_at: from_unix("expires_at", row.try_get("expires_at")?)?,
        })
    }

    fn parse_session(row: &SqliteRow) -> Result<Session> {
        Ok(Session {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            client_id: row.try_get("client_id")?,
            scopes: decode_list(&row.try_get::<String, _>("scopes")?)?,
            nonce: row.try_get("nonce")?,
            auth_time: from_unix("auth_time", row.try_get("auth_time")?)?,
            claims: serde_json::from_str(&row.try_get::<String, _>("claims")?)?,
            access_jti: row.try_get("access_jti")?,
            refresh_jti: row.try_get("refresh_jti")?,
            created_at: from_unix("created_at", row.try_get("created_at")?)?,
            expires_at: from_unix("expires_at", row.try_get("expires_at")?)?,
        })
    }

    fn parse_blacklist_entry(row: &SqliteRow) -> Result<BlacklistEntry> {
        let reason: String = row.try_get("reason")?;
        Ok(BlacklistEntry {
            id: row.try_get("id")?,
            jti: row.try_get("jti")?,
            user_id: row.try_get("user_id")?,
            reason: reason
                .parse()
                .map_err(|e: String| crate::error::StorageError::Corrupt(e))?,
            created_at: from_unix("created_at", row.try_get("created_at")?)?,
            expires_at: from_unix("expires_at", row.try_get("expires_at")?)?,
        })
    }

    fn parse_user_profile(row: &SqliteRow) -> Result<UserProfile> {
        Ok(UserProfile {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            role: row.try_get("role")?,
            permissions: decode_list(&row.try_get::<String, _>("permissions")?)?,
            updated_at: from_unix("updated_at", row.try_get("updated_at")?)?,
        })
    }
}

#[async_trait]
impl ClientStorage for SqliteStorage {
    async fn save_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            "INSERT INTO clients (id, secret_hash, name, redirect_uris, allowed_scopes, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                secret_hash = excluded.secret_hash,
                name = excluded.name,
                redirect_uris = excluded.redirect_uris,
                allowed_scopes = excluded.allowed_scopes,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&client.id)
        .bind(&client.secret_hash)
        .bind(&client.name)
        .bind(encode_list(&client.redirect_uris)?)
        .bind(encode_list(&client.allowed_scopes)?)
        .bind(client.active as i64)
        .bind(to_unix(client.created_at))
        .bind(to_unix(client.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_client(&self, id: &str) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_client).transpose()
    }

    async fn list_clients(&self) -> Result<Vec<Client>> {
        let rows = sqlx::query("SELECT * FROM clients ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_client).collect()
    }
}

#[async_trait]
impl AuthCodeStorage for SqliteStorage {
    async fn save_authorization_code(&self, code: &AuthorizationCode) -> Result<()> {
        sqlx::query(
            "INSERT INTO authorization_codes
                (code_hash, client_id, user_id, scopes, redirect_uri, nonce, auth_time,
                 claims, code_challenge, code_challenge_method, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&code.code_hash)
        .bind(&code.client_id)
        .bind(&code.user_id)
        .bind(encode_list(&code.scopes)?)
        .bind(&code.redirect_uri)
        .bind(&code.nonce)
        .bind(to_unix(code.auth_time))
        .bind(serde_json::to_string(&code.claims)?)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(to_unix(code.created_at))
        .bind(expiry_to_unix(code.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn take_authorization_code(
        &self,
        code_hash: &str,
        client_id: &str,
    ) -> Result<Option<AuthorizationCode>> {
        // DELETE ... RETURNING is a single statement, so only one caller can
        // observe the row (SQLite 3.35+)
        let row = sqlx::query(
            "DELETE FROM authorization_codes WHERE code_hash = ? AND client_id = ? RETURNING *",
        )
        .bind(code_hash)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_code).transpose()
    }

    async fn delete_expired_authorization_codes(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM authorization_codes WHERE expires_at <= ?")
            .bind(to_unix(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    async fn upsert_session(&self, session: &Session) -> Result<Session> {
        let query = format!(
            "INSERT INTO sessions ({SESSION_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, client_id) DO UPDATE SET
                scopes = excluded.scopes,
                nonce = excluded.nonce,
                auth_time = excluded.auth_time,
                claims = excluded.claims,
                access_jti = excluded.access_jti,
                refresh_jti = excluded.refresh_jti,
                expires_at = excluded.expires_at
             RETURNING {SESSION_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(&session.id)
            .bind(&session.user_id)
            .bind(&session.client_id)
            .bind(encode_list(&session.scopes)?)
            .bind(&session.nonce)
            .bind(to_unix(session.auth_time))
            .bind(serde_json::to_string(&session.claims)?)
            .bind(&session.access_jti)
            .bind(&session.refresh_jti)
            .bind(to_unix(session.created_at))
            .bind(expiry_to_unix(session.expires_at))
            .fetch_one(&self.pool)
            .await?;

        Self::parse_session(&row)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_session).transpose()
    }

    async fn list_sessions(&self, user_id: &str, client_id: Option<&str>) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE user_id = ? AND (? IS NULL OR client_id = ?)
             ORDER BY created_at DESC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(client_id)
            .bind(client_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_session).collect()
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend_session(
        &self,
        id: &str,
        additional: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "UPDATE sessions SET expires_at = expires_at + ? WHERE id = ? RETURNING expires_at",
        )
        .bind(additional.num_seconds())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(from_unix("expires_at", row.try_get("expires_at")?)?)),
            None => Ok(None),
        }
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(to_unix(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BlacklistStorage for SqliteStorage {
    async fn save_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<()> {
        let query = format!(
            "INSERT INTO token_blacklist ({BLACKLIST_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(jti, user_id) DO UPDATE SET
                reason = excluded.reason,
                created_at = MAX(created_at, excluded.created_at),
                expires_at = MAX(expires_at, excluded.expires_at)"
        );

        sqlx::query(&query)
            .bind(&entry.id)
            .bind(&entry.jti)
            .bind(&entry.user_id)
            .bind(entry.reason.as_str())
            .bind(to_unix(entry.created_at))
            .bind(expiry_to_unix(entry.expires_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_blacklist_entry_if_absent(&self, entry: &BlacklistEntry) -> Result<bool> {
        let query = format!(
            "INSERT INTO token_blacklist ({BLACKLIST_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(jti, user_id) DO NOTHING"
        );

        let result = sqlx::query(&query)
            .bind(&entry.id)
            .bind(&entry.jti)
            .bind(&entry.user_id)
            .bind(entry.reason.as_str())
            .bind(to_unix(entry.created_at))
            .bind(expiry_to_unix(entry.expires_at))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn is_blacklisted(
        &self,
        jti: &str,
        user_id: &str,
        issued_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let issued_at = issued_at.map(to_unix);
        let row = sqlx::query(
            "SELECT 1 FROM token_blacklist
             WHERE user_id = ?
               AND expires_at > ?
               AND (jti = ? OR (jti = ? AND (? IS NULL OR created_at >= ?)))
             LIMIT 1",
        )
        .bind(user_id)
        .bind(to_unix(now))
        .bind(jti)
        .bind(crate::constants::ALL_TOKENS)
        .bind(issued_at)
        .bind(issued_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn list_blacklist_entries(&self, user_id: &str) -> Result<Vec<BlacklistEntry>> {
        let query = format!(
            "SELECT {BLACKLIST_COLUMNS} FROM token_blacklist
             WHERE user_id = ? ORDER BY created_at DESC, id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_blacklist_entry).collect()
    }

    async fn delete_expired_blacklist_entries(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= ?")
            .bind(to_unix(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserStorage for SqliteStorage {
    async fn save_user_profile(&self, profile: &UserProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_profiles (id, name, email, role, permissions, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                role = excluded.role,
                permissions = excluded.permissions,
                updated_at = excluded.updated_at",
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.role)
        .bind(encode_list(&profile.permissions)?)
        .bind(to_unix(profile.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user_profile(&self, id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM user_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_user_profile).transpose()
    }
}
