//! Core data models for Authority
//!
//! Registered clients, authorization codes, OIDC sessions, blacklist entries
//! and user profiles. These are the records persisted by the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered OAuth client application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    /// Public client identifier
    pub id: String,

    /// SHA-256 (hex) of the client secret, `None` for public clients.
    /// The plaintext secret is only ever returned at creation or rotation.
    #[serde(skip_serializing)]
    pub secret_hash: Option<String>,

    /// Display name
    pub name: String,

    /// Redirect URIs, matched exactly
    pub redirect_uris: Vec<String>,

    /// Scopes this client may request
    pub allowed_scopes: Vec<String>,

    /// Soft-delete flag; inactive clients cannot authorize or redeem
    pub active: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Client {
    /// Confidential clients hold a secret; public clients rely on PKCE.
    pub fn is_confidential(&self) -> bool {
        self.secret_hash.is_some()
    }

    /// Exact-match redirect URI membership
    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|registered| registered == uri)
    }

    /// Whether every requested scope is in the client's allowed set
    pub fn allows_scopes<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        scopes
            .iter()
            .all(|scope| self.allowed_scopes.iter().any(|a| a == scope.as_ref()))
    }
}

/// A pending, single-use authorization code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationCode {
    /// SHA-256 (hex) of the code value handed to the client
    pub code_hash: String,

    /// Client the code was issued to
    pub client_id: String,

    /// Authenticated end user
    pub user_id: String,

    /// Granted scopes
    pub scopes: Vec<String>,

    /// Redirect URI used in the authorization request
    pub redirect_uri: String,

    /// OIDC nonce echoed into the ID token
    pub nonce: Option<String>,

    /// When the user authenticated
    pub auth_time: DateTime<Utc>,

    /// Claims asserted by the login service at authentication time
    pub claims: ProfileClaims,

    /// PKCE challenge
    pub code_challenge: Option<String>,

    /// PKCE method (only S256 is accepted)
    pub code_challenge_method: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    /// Accepted strictly before `expires_at`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An OIDC session for a (user, client) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Session identifier
    pub id: String,

    /// End user
    pub user_id: String,

    /// Client the session belongs to
    pub client_id: String,

    /// Scopes granted in the most recent exchange
    pub scopes: Vec<String>,

    /// Nonce from the most recent authorization request
    pub nonce: Option<String>,

    /// When the user authenticated
    pub auth_time: DateTime<Utc>,

    /// Opaque claims snapshot
    pub claims: serde_json::Value,

    /// Access token most recently issued under this session
    pub access_jti: Option<String>,

    /// Refresh token most recently issued under this session
    pub refresh_jti: Option<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Expiry; only informational for token validity
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Why a token (or every token of a user) was revoked
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    PasswordChange,
    RoleChange,
    AccountSuspended,
    SessionRevoked,
    LoginTicketUsed,
    Manual,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::RoleChange => "role_change",
            RevocationReason::AccountSuspended => "account_suspended",
            RevocationReason::SessionRevoked => "session_revoked",
            RevocationReason::LoginTicketUsed => "login_ticket_used",
            RevocationReason::Manual => "manual",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(RevocationReason::Logout),
            "password_change" => Ok(RevocationReason::PasswordChange),
            "role_change" => Ok(RevocationReason::RoleChange),
            "account_suspended" => Ok(RevocationReason::AccountSuspended),
            "session_revoked" => Ok(RevocationReason::SessionRevoked),
            "login_ticket_used" => Ok(RevocationReason::LoginTicketUsed),
            "manual" => Ok(RevocationReason::Manual),
            other => Err(format!("unknown revocation reason: {other}")),
        }
    }
}

/// A blacklist record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistEntry {
    /// Entry identifier
    pub id: String,

    /// Revoked token id, or [`crate::constants::ALL_TOKENS`]
    pub jti: String,

    /// Subject the entry applies to
    pub user_id: String,

    /// Why the entry was written
    pub reason: RevocationReason,

    /// Creation time; for the sentinel, tokens issued at or before this are revoked
    pub created_at: DateTime<Utc>,

    /// Retention deadline, never earlier than the blocked token's expiry
    pub expires_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn is_all_tokens(&self) -> bool {
        self.jti == crate::constants::ALL_TOKENS
    }

    /// Whether this entry blocks a token with the given id and issue time
    pub fn blocks(&self, jti: &str, issued_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if now >= self.expires_at {
            return false;
        }
        if self.is_all_tokens() {
            // `iat` has whole-second resolution, so a token minted in the same
            // second as the revoke-all is blocked too; the user may need to
            // sign in again up to one second after the revocation.
            return issued_at.is_none_or(|iat| iat <= self.created_at);
        }
        self.jti == jti
    }
}

/// Profile claims carried inside tokens and login artefacts.
///
/// Every field is optional so "absent" is distinguishable from "empty".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl ProfileClaims {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.role.is_none() && self.permissions.is_none()
    }
}

/// Profile data owned by the user-management service
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    /// Subject identifier
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default)]
    pub permissions: Vec<String>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}
