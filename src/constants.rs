//! Constants used throughout Authority
//!
//! Configuration paths, protocol identifiers, lifetimes and header/cookie
//! names shared by the HTTP layer and the token machinery.

use once_cell::sync::Lazy;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Default config directory (~/.authority)
pub fn default_config_dir() -> &'static str {
    static CONFIG_DIR: Lazy<String> = Lazy::new(|| {
        dirs::home_dir()
            .map(|home| home.join(".authority").to_string_lossy().to_string())
            .unwrap_or_else(|| ".authority".to_string())
    });
    &CONFIG_DIR
}

/// Default SQLite DSN (~/.authority/authority.db)
pub fn default_sqlite_dsn() -> &'static str {
    static SQLITE_DSN: Lazy<String> =
        Lazy::new(|| format!("{}/authority.db", default_config_dir()));
    &SQLITE_DSN
}

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "authority.config.json";

/// Storage driver: SQLite
pub const STORAGE_DRIVER_SQLITE: &str = "sqlite";

/// Storage driver: in-memory
pub const STORAGE_DRIVER_MEMORY: &str = "memory";

/// Environment variable: HMAC signing secret
pub const ENV_SIGNING_SECRET: &str = "AUTHORITY_SIGNING_SECRET";

/// Environment variable: comma separated service keys
pub const ENV_SERVICE_KEYS: &str = "AUTHORITY_SERVICE_KEYS";

/// Environment variable: issuer URL override
pub const ENV_ISSUER: &str = "AUTHORITY_ISSUER";

/// Environment variable: database DSN override
pub const ENV_DATABASE_URL: &str = "AUTHORITY_DATABASE_URL";

/// Environment variable: `json` switches logs to one JSON object per line
pub const ENV_LOG_FORMAT: &str = "AUTHORITY_LOG_FORMAT";

// ============================================================================
// HTTP
// ============================================================================

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 4000;

/// Default HTTP host
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Header carrying the service-to-service credential
pub const HEADER_SERVICE_KEY: &str = "x-service-key";

/// Cookie holding the signed browser identity
pub const IDENTITY_COOKIE: &str = "authority_session";

/// Cookie holding the parked authorization request
pub const PENDING_COOKIE: &str = "authority_pending";

// ============================================================================
// PROTOCOL
// ============================================================================

/// The only supported authorization response type
pub const RESPONSE_TYPE_CODE: &str = "code";

/// The only supported PKCE transformation
pub const PKCE_METHOD_S256: &str = "S256";

/// Grant type: authorization code
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";

/// Grant type: client credentials
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";

/// Token type returned from the token endpoint
pub const TOKEN_TYPE_BEARER: &str = "Bearer";

/// Blacklist sentinel meaning "every token of this user"
pub const ALL_TOKENS: &str = "all-tokens";

/// Scope wildcard meaning "honoured by every service"
pub const SCOPE_WILDCARD: &str = "*";

/// Scope that makes a request an OpenID Connect request
pub const SCOPE_OPENID: &str = "openid";

/// Role granting access to client administration
pub const ADMIN_ROLE: &str = "admin";

/// Subject prefix for client-credentials tokens
pub const SERVICE_SUBJECT_PREFIX: &str = "client:";

// ============================================================================
// LIFETIMES (seconds)
// ============================================================================

/// Authorization code lifetime (10 minutes)
pub const AUTH_CODE_TTL_SECS: i64 = 10 * 60;

/// Access token lifetime (1 hour)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 60 * 60;

/// ID token lifetime (1 hour)
pub const ID_TOKEN_TTL_SECS: i64 = 60 * 60;

/// Refresh token lifetime (30 days)
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Browser identity cookie lifetime (12 hours)
pub const BROWSER_SESSION_TTL_SECS: i64 = 12 * 60 * 60;

/// Parked authorization request lifetime (10 minutes)
pub const PENDING_AUTHORIZATION_TTL_SECS: i64 = 10 * 60;

/// Login ticket lifetime (2 minutes)
pub const LOGIN_TICKET_TTL_SECS: i64 = 2 * 60;

/// Clock skew tolerated when validating token expiry
pub const TOKEN_LEEWAY_SECS: u64 = 60;

/// Default blacklist lookup timeout (milliseconds)
pub const BLACKLIST_CHECK_TIMEOUT_MS: u64 = 250;

/// Default sweep interval (1 hour)
pub const SWEEP_INTERVAL_SECS: u64 = 60 * 60;

// ============================================================================
// LIMITS
// ============================================================================

/// Maximum accepted redirect URI length
pub const MAX_REDIRECT_URI_LEN: usize = 2048;

/// Minimum signing secret length in bytes
pub const MIN_SIGNING_SECRET_LEN: usize = 32;

/// Number of previous signing keys kept for verification
pub const MAX_RETIRED_KEYS: usize = 4;

/// Random bytes in client secrets, codes and ids
pub const RANDOM_TOKEN_BYTES: usize = 32;
