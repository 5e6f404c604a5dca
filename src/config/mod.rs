//! Configuration management for Authority
//!
//! Loads configuration from `authority.config.json` (or YAML), then applies
//! environment overrides for secrets and deployment-specific values.

use crate::constants::{
    self, ACCESS_TOKEN_TTL_SECS, AUTH_CODE_TTL_SECS, BLACKLIST_CHECK_TIMEOUT_MS,
    ENV_DATABASE_URL, ENV_ISSUER, ENV_SERVICE_KEYS, ENV_SIGNING_SECRET, ID_TOKEN_TTL_SECS,
    MIN_SIGNING_SECRET_LEN, REFRESH_TOKEN_TTL_SECS, SWEEP_INTERVAL_SECS,
};
use crate::scope::{ScopeDefinition, ScopeRegistry};
use crate::{AuthorityError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete Authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Storage configuration (required)
    pub storage: StorageConfig,

    /// HTTP server configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    /// Logging configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,

    /// OAuth/OIDC behaviour
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,

    /// Token signing keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing: Option<SigningConfig>,

    /// Blacklist check and service credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<BlacklistConfig>,

    /// Background expiry sweeps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepConfig>,

    /// Scope table; built-in defaults when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<ScopeDefinition>>,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Driver name (sqlite, memory)
    pub driver: String,

    /// Data source name / connection string
    pub dsn: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Mark browser cookies `Secure` (requires HTTPS)
    #[serde(default)]
    pub secure: bool,

    /// Allowed CORS origins. Defaults to localhost origins for development
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,

    /// Include internal error details in responses. Never enable in production
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure: false,
            allowed_origins: None,
            dev_mode: false,
        }
    }
}

fn default_host() -> String {
    constants::DEFAULT_HTTP_HOST.to_string()
}

fn default_port() -> u16 {
    constants::DEFAULT_HTTP_PORT
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// OAuth/OIDC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfig {
    /// Issuer URL placed in `iss`. Defaults to http://host:port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// External login page users are sent to when unauthenticated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,

    #[serde(default = "default_code_ttl")]
    pub code_ttl_secs: i64,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: i64,

    #[serde(default = "default_id_ttl")]
    pub id_token_ttl_secs: i64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: i64,

    /// OIDC session lifetime; defaults to the refresh token lifetime
    #[serde(default = "default_refresh_ttl")]
    pub session_ttl_secs: i64,

    /// Accept http://localhost redirect URIs at client registration
    #[serde(default = "default_true")]
    pub allow_localhost_redirects: bool,
}

fn default_true() -> bool {
    true
}

fn default_code_ttl() -> i64 {
    AUTH_CODE_TTL_SECS
}

fn default_access_ttl() -> i64 {
    ACCESS_TOKEN_TTL_SECS
}

fn default_id_ttl() -> i64 {
    ID_TOKEN_TTL_SECS
}

fn default_refresh_ttl() -> i64 {
    REFRESH_TOKEN_TTL_SECS
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            login_url: None,
            code_ttl_secs: default_code_ttl(),
            access_token_ttl_secs: default_access_ttl(),
            id_token_ttl_secs: default_id_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            session_ttl_secs: default_refresh_ttl(),
            allow_localhost_redirects: true,
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningConfig {
    /// Current HMAC secret. Usually supplied through `AUTHORITY_SIGNING_SECRET`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Retired secrets still accepted for verification
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_secrets: Vec<String>,
}

/// Blacklist check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistConfig {
    /// Upper bound for a single revocation lookup
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    /// Shared keys accepted from dependent services on internal endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_keys: Vec<String>,
}

fn default_check_timeout() -> u64 {
    BLACKLIST_CHECK_TIMEOUT_MS
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: default_check_timeout(),
            service_keys: Vec::new(),
        }
    }
}

/// Background sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    SWEEP_INTERVAL_SECS
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the default file name, with env overrides
    pub fn load() -> Result<Self> {
        Self::load_with_env(constants::CONFIG_FILE_NAME)
    }

    /// Load configuration from specific path
    ///
    /// Supports both JSON and YAML formats based on file extension:
    /// - `.json` files are parsed as JSON
    /// - `.yaml` or `.yml` files are parsed as YAML
    /// - Files without extension default to JSON parsing
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            // Return default config if file doesn't exist
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                AuthorityError::config(format!("Failed to parse YAML config: {}", e))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                AuthorityError::config(format!("Failed to parse JSON config: {}", e))
            })?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Load from `path`, then apply process environment overrides
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load_from_path(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(ENV_SIGNING_SECRET).filter(|s| !s.is_empty()) {
            self.signing.get_or_insert_with(SigningConfig::default).secret = Some(secret);
        }

        if let Some(keys) = lookup(ENV_SERVICE_KEYS) {
            let keys: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            if !keys.is_empty() {
                self.blacklist
                    .get_or_insert_with(BlacklistConfig::default)
                    .service_keys = keys;
            }
        }

        if let Some(issuer) = lookup(ENV_ISSUER).filter(|s| !s.is_empty()) {
            self.oauth.get_or_insert_with(OAuthConfig::default).issuer = Some(issuer);
        }

        if let Some(dsn) = lookup(ENV_DATABASE_URL).filter(|s| !s.is_empty()) {
            self.storage.dsn = dsn;
        }
    }

    /// Save configuration to specific path (JSON or YAML by extension)
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = match path_ref.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self).map_err(|e| {
                AuthorityError::config(format!("Failed to serialize to YAML: {}", e))
            })?,
            _ => serde_json::to_string_pretty(self)?,
        };

        std::fs::write(path_ref, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage.driver.is_empty() {
            return Err(AuthorityError::config("storage.driver is required"));
        }

        if self.storage.dsn.is_empty() {
            return Err(AuthorityError::config("storage.dsn is required"));
        }

        match self.storage.driver.as_str() {
            constants::STORAGE_DRIVER_SQLITE | constants::STORAGE_DRIVER_MEMORY => {}
            _ => {
                return Err(AuthorityError::config(format!(
                    "Unsupported storage driver: '{}'. Supported: sqlite, memory",
                    self.storage.driver
                )));
            }
        }

        if let Some(ref http) = self.http {
            if http.port == 0 {
                return Err(AuthorityError::config("http.port must be nonzero (1-65535)"));
            }

            if http.host.is_empty() {
                return Err(AuthorityError::config("http.host cannot be empty"));
            }

            if let Some(ref origins) = http.allowed_origins {
                for origin in origins {
                    if !origin.starts_with("http://") && !origin.starts_with("https://") {
                        return Err(AuthorityError::config(format!(
                            "Invalid CORS origin '{}': must start with http:// or https://",
                            origin
                        )));
                    }
                }
            }
        }

        if let Some(ref oauth) = self.oauth {
            for (name, value) in [
                ("oauth.codeTtlSecs", oauth.code_ttl_secs),
                ("oauth.accessTokenTtlSecs", oauth.access_token_ttl_secs),
                ("oauth.idTokenTtlSecs", oauth.id_token_ttl_secs),
                ("oauth.refreshTokenTtlSecs", oauth.refresh_token_ttl_secs),
                ("oauth.sessionTtlSecs", oauth.session_ttl_secs),
            ] {
                if value <= 0 {
                    return Err(AuthorityError::config(format!(
                        "{name} must be greater than 0"
                    )));
                }
            }

            if let Some(ref issuer) = oauth.issuer {
                url::Url::parse(issuer).map_err(|e| {
                    AuthorityError::config(format!("oauth.issuer is not a valid URL: {e}"))
                })?;
            }

            if let Some(ref login_url) = oauth.login_url {
                url::Url::parse(login_url).map_err(|e| {
                    AuthorityError::config(format!("oauth.loginUrl is not a valid URL: {e}"))
                })?;
            }
        }

        if let Some(ref signing) = self.signing {
            for secret in signing.secret.iter().chain(signing.previous_secrets.iter()) {
                if secret.len() < MIN_SIGNING_SECRET_LEN {
                    return Err(AuthorityError::config(format!(
                        "signing secrets must be at least {MIN_SIGNING_SECRET_LEN} bytes"
                    )));
                }
            }
        }

        if let Some(ref blacklist) = self.blacklist
            && blacklist.check_timeout_ms == 0
        {
            return Err(AuthorityError::config(
                "blacklist.checkTimeoutMs must be greater than 0",
            ));
        }

        if let Some(ref sweep) = self.sweep
            && sweep.enabled
            && sweep.interval_secs == 0
        {
            return Err(AuthorityError::config(
                "sweep.intervalSecs must be greater than 0",
            ));
        }

        if let Some(ref scopes) = self.scopes {
            ScopeRegistry::new(scopes.clone())?;
        }

        Ok(())
    }

    /// OAuth settings (with defaults if not configured)
    pub fn get_oauth(&self) -> OAuthConfig {
        self.oauth.clone().unwrap_or_default()
    }

    /// Blacklist settings (with defaults if not configured)
    pub fn get_blacklist(&self) -> BlacklistConfig {
        self.blacklist.clone().unwrap_or_default()
    }

    /// Sweep settings (with defaults if not configured)
    pub fn get_sweep(&self) -> SweepConfig {
        self.sweep.clone().unwrap_or_default()
    }

    /// HTTP settings (with defaults if not configured)
    pub fn get_http(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }

    /// Issuer URL without a trailing slash
    pub fn issuer(&self) -> String {
        match self.oauth.as_ref().and_then(|o| o.issuer.clone()) {
            Some(issuer) => issuer.trim_end_matches('/').to_string(),
            None => {
                let http = self.get_http();
                format!("http://{}:{}", http.host, http.port)
            }
        }
    }

    /// Build the scope registry from configuration
    pub fn scope_registry(&self) -> Result<ScopeRegistry> {
        match self.scopes {
            Some(ref scopes) => ScopeRegistry::new(scopes.clone()),
            None => Ok(ScopeRegistry::with_defaults()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                driver: constants::STORAGE_DRIVER_SQLITE.to_string(),
                dsn: constants::default_sqlite_dsn().to_string(),
            },
            http: Some(HttpConfig {
                host: default_host(),
                port: default_port(),
                secure: false,
                allowed_origins: None,
                dev_mode: false,
            }),
            log: Some(LogConfig {
                level: Some("info".to_string()),
            }),
            oauth: Some(OAuthConfig::default()),
            signing: None,
            blacklist: Some(BlacklistConfig::default()),
            sweep: Some(SweepConfig::default()),
            scopes: None,
        }
    }
}
