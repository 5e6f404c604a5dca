//! Authority - OAuth 2.0 / OpenID Connect identity service
//!
//! Registers client applications, runs the authorization-code flow with PKCE,
//! issues signed access/refresh/ID tokens and keeps a blacklist that other
//! services consult before trusting a token.
//!
//! # Architecture
//!
//! - Scope and client registries backed by pluggable storage (memory, SQLite)
//! - Single-use, PKCE-bound authorization codes
//! - JWT issuance behind an injectable signing key provider
//! - Per (user, client) sessions and a fail-closed revocation registry
//! - An axum HTTP surface plus a CLI for administration
//!
//! # Example
//!
//! ```rust,no_run
//! use authority::config::Config;
//! use authority::core::create_dependencies;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load()?;
//!     let deps = create_dependencies(&config).await?;
//!
//!     for client in deps.clients.list().await? {
//!         println!("{} ({})", client.name, client.id);
//!     }
//!     Ok(())
//! }
//! ```

// Core modules
pub mod constants;
pub mod error;
pub mod model;
pub mod scope;

// Shared wiring of all components
pub mod core;

// Infrastructure
pub mod config;
pub mod storage;
pub mod telemetry;

// Interface layers
pub mod auth;
pub mod cli;
pub mod http;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use error::{AuthorityError, OAuthError, Result};

/// Initialize logging for the application
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "authority=info".into());
    let json = std::env::var(constants::ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
