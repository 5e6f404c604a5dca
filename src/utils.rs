//! Utility functions and helpers
//!
//! Test support shared by unit and integration tests.

use crate::config::{BlacklistConfig, Config, OAuthConfig, SigningConfig, StorageConfig};
use crate::constants::STORAGE_DRIVER_SQLITE;
use tempfile::TempDir;

/// Signing secret used by [`TestEnvironment`]
pub const TEST_SIGNING_SECRET: &str = "test-environment-signing-secret-0123456789";

/// Service key accepted by [`TestEnvironment`] internal endpoints
pub const TEST_SERVICE_KEY: &str = "test-service-key";

/// Issuer used by [`TestEnvironment`]
pub const TEST_ISSUER: &str = "https://auth.test";

/// Test environment with an isolated temporary SQLite database
///
/// The temp directory is removed when the environment is dropped.
///
/// # Example
///
/// ```no_run
/// use authority::utils::TestEnvironment;
///
/// # async fn example() {
/// let env = TestEnvironment::new().await;
/// let clients = env.deps.clients.list().await.unwrap();
/// # }
/// ```
pub struct TestEnvironment {
    /// Temporary directory - kept alive for test duration
    _temp_dir: TempDir,

    /// Complete dependencies object ready to use
    pub deps: crate::core::Dependencies,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create an environment after adjusting the default test configuration
    pub async fn with_config<F>(adjust: F) -> Self
    where
        F: FnOnce(&mut Config),
    {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join(".authority").join("authority.db");

        let mut config = Config {
            storage: StorageConfig {
                driver: STORAGE_DRIVER_SQLITE.to_string(),
                dsn: db_path.to_string_lossy().into_owned(),
            },
            oauth: Some(OAuthConfig {
                issuer: Some(TEST_ISSUER.to_string()),
                login_url: Some("https://login.test/signin".to_string()),
                ..Default::default()
            }),
            signing: Some(SigningConfig {
                secret: Some(TEST_SIGNING_SECRET.to_string()),
                previous_secrets: Vec::new(),
            }),
            blacklist: Some(BlacklistConfig {
                service_keys: vec![TEST_SERVICE_KEY.to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        adjust(&mut config);

        let deps = crate::core::create_dependencies(&config)
            .await
            .expect("Failed to create test dependencies");

        TestEnvironment {
            _temp_dir: temp_dir,
            deps,
        }
    }
}
