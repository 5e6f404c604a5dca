//! Error types for Authority
//!
//! This module provides the error hierarchy using thiserror.
//! Protocol-level failures are [`OAuthError`]; everything else is wrapped in
//! [`AuthorityError`] for unified handling.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type for Authority operations
#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Token encoding error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("UUID parse error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for AuthorityError {
    fn from(err: sqlx::Error) -> Self {
        AuthorityError::Storage(StorageError::from(err))
    }
}

impl From<sqlx::migrate::MigrateError> for AuthorityError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AuthorityError::Storage(StorageError::Database(format!("migration failed: {err}")))
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

/// OAuth 2.0 / OIDC protocol errors.
///
/// Every variant maps to a registered OAuth `error` code and an HTTP status.
/// The `String` payloads become `error_description` and must never carry
/// secrets, codes or tokens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OAuthError {
    #[error("invalid client: {0}")]
    InvalidClient(String),

    #[error("invalid redirect uri: {0}")]
    InvalidRedirectUri(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("unsupported response type: {0}")]
    UnsupportedResponseType(String),

    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authorization code is invalid or expired")]
    InvalidOrExpiredCode,

    #[error("redirect_uri does not match the authorization request")]
    RedirectUriMismatch,

    #[error("PKCE verification failed: {0}")]
    PkceMismatch(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("revocation status could not be determined")]
    BlacklistCheckUnavailable,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("server error: {0}")]
    ServerError(String),
}

impl OAuthError {
    /// The OAuth 2.0 `error` code for this failure.
    pub fn error_code(&self) -> &'static str {
        match self {
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidRedirectUri(_) | OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidScope(_) => "invalid_scope",
            OAuthError::UnsupportedResponseType(_) => "unsupported_response_type",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::InvalidOrExpiredCode
            | OAuthError::RedirectUriMismatch
            | OAuthError::PkceMismatch(_) => "invalid_grant",
            OAuthError::InvalidToken(_)
            | OAuthError::TokenRevoked
            | OAuthError::BlacklistCheckUnavailable => "invalid_token",
            OAuthError::AccessDenied(_) => "access_denied",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    /// Human readable `error_description`.
    ///
    /// An unavailable blacklist is reported exactly like a revoked token so
    /// callers cannot distinguish an outage from a revocation.
    pub fn description(&self) -> String {
        match self {
            OAuthError::BlacklistCheckUnavailable => OAuthError::TokenRevoked.to_string(),
            OAuthError::ServerError(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status used when the error is returned as a JSON body.
    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidClient(_)
            | OAuthError::InvalidOrExpiredCode
            | OAuthError::RedirectUriMismatch
            | OAuthError::PkceMismatch(_)
            | OAuthError::InvalidToken(_)
            | OAuthError::TokenRevoked
            | OAuthError::BlacklistCheckUnavailable => StatusCode::UNAUTHORIZED,
            OAuthError::AccessDenied(_) => StatusCode::FORBIDDEN,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the failure concerns a presented bearer token.
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            OAuthError::InvalidToken(_)
                | OAuthError::TokenRevoked
                | OAuthError::BlacklistCheckUnavailable
        )
    }
}

/// JSON `{error, error_description}` body, never cached.
///
/// Bearer token failures also carry a `WWW-Authenticate` challenge.
impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error_code();
        let description = self.description();

        let mut response = (
            status,
            [(header::CACHE_CONTROL, "no-store")],
            Json(json!({
                "error": code,
                "error_description": description,
            })),
        )
            .into_response();

        if self.is_token_error() {
            let challenge = format!("Bearer error=\"{code}\", error_description=\"{description}\"");
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Convenient result type for Authority operations
pub type Result<T> = std::result::Result<T, AuthorityError>;

impl AuthorityError {
    /// Create a validation error
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        AuthorityError::Validation(msg.into())
    }

    /// Create a config error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AuthorityError::Config(msg.into())
    }

    /// Create a storage error
    #[inline]
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        AuthorityError::Storage(StorageError::Database(msg.into()))
    }

    /// Create a not found error
    #[inline]
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AuthorityError::NotFound(msg.into())
    }

    /// Create a forbidden error
    #[inline]
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        AuthorityError::Forbidden(msg.into())
    }

    /// Collapse into an OAuth error for protocol responses.
    ///
    /// Non-protocol failures become `server_error`; the detail stays in logs.
    pub fn into_oauth(self) -> OAuthError {
        match self {
            AuthorityError::OAuth(err) => err,
            AuthorityError::Validation(msg) => OAuthError::InvalidRequest(msg),
            other => {
                tracing::error!(error = %other, "internal failure during OAuth request");
                OAuthError::ServerError(other.to_string())
            }
        }
    }
}
