//! Authority CLI - OAuth 2.0 / OpenID Connect identity service
//!
//! Run with: cargo run --bin authority -- <command>
//! Or after build: ./target/release/authority <command>

#[tokio::main]
async fn main() {
    // Signing secrets and service keys usually come from .env in development
    let _ = dotenvy::dotenv();

    authority::init_logging();

    if let Err(e) = authority::cli::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
