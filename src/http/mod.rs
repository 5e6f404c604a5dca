//! HTTP server for Authority
//!
//! Mounts the OAuth routes together with health and metrics endpoints and
//! the shared middleware stack.

pub mod session;

use crate::auth::{OAuthServerState, create_oauth_routes};
use crate::config::{Config, HttpConfig};
use crate::core::Dependencies;
use crate::{AuthorityError, Result};
use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tower::ServiceBuilder;
use tower_http::{
    LatencyUnit,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// When set, error bodies carry internal details
static DEV_MODE: AtomicBool = AtomicBool::new(false);

/// Error type for HTTP handlers
#[derive(Debug)]
pub struct AppError(AuthorityError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self.0 {
            AuthorityError::OAuth(err) => return err.into_response(),
            AuthorityError::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AuthorityError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AuthorityError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            other => {
                // Log full error details internally
                tracing::error!(error = ?other, "Internal error");
                let message = if DEV_MODE.load(Ordering::Relaxed) {
                    other.to_string()
                } else {
                    "An internal error occurred".to_string()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };

        tracing::debug!(
            error_type = error_type,
            status = %status,
            message = %message,
            "HTTP request error response"
        );

        let body = json!({
            "error": {
                "type": error_type,
                "message": message,
                "status": status.as_u16(),
            }
        });

        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<AuthorityError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let http_config = config.get_http();
    DEV_MODE.store(http_config.dev_mode, Ordering::Relaxed);
    if http_config.dev_mode {
        tracing::warn!("Development mode: error responses include internal details");
    }

    // Use centralized dependency creation from core module
    let dependencies = crate::core::create_dependencies(&config).await?;

    if config.get_sweep().enabled {
        crate::auth::Sweeper::from_dependencies(&dependencies).spawn();
    }

    let app = build_router(dependencies, &http_config);

    // Determine bind address
    let addr = format!("{}:{}", http_config.host, http_config.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| AuthorityError::config(format!("Invalid address {}: {}", addr, e)))?;

    tracing::info!(issuer = %config.issuer(), "Starting HTTP server on {}", socket_addr);

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AuthorityError::config(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down HTTP server");
}

/// Build the router with all endpoints
pub fn build_router(deps: Dependencies, http_config: &HttpConfig) -> Router {
    let oauth_state = Arc::new(OAuthServerState::new(deps));

    Router::new()
        .merge(create_oauth_routes(oauth_state))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                // Request counters and latency histograms
                .layer(axum::middleware::from_fn(crate::telemetry::track_http))
                // Tracing layer for request/response logging
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().include_headers(false))
                        .on_response(
                            DefaultOnResponse::new()
                                .level(tracing::Level::INFO)
                                .latency_unit(LatencyUnit::Micros),
                        ),
                )
                .layer(cors_layer(http_config)),
        )
}

/// CORS for browser clients; only configured origins are allowed.
/// Without configuration the local development origins are used.
fn cors_layer(http_config: &HttpConfig) -> CorsLayer {
    let configured = http_config.allowed_origins.clone().unwrap_or_else(|| {
        vec![
            format!("http://localhost:{}", http_config.port),
            format!("http://127.0.0.1:{}", http_config.port),
        ]
    });
    let origins: Vec<HeaderValue> = configured
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler() -> std::result::Result<(StatusCode, String), AppError> {
    let metrics = crate::telemetry::get_metrics()?;
    Ok((StatusCode::OK, metrics))
}
