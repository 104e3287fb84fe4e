//! HTTP front end of the subdomain relay
//!
//! `POST /register` validates the request, runs the registrar on the blocking
//! pool and applies the new configuration when anything changed.

pub mod error;
pub mod handlers;
pub mod models;
pub mod reload;

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use subrelay_registry::Registrar;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

pub use error::ApiError;
pub use reload::{NoopReloader, ReloadError, Reloader, SystemdReloader};

/// Application state shared across handlers
pub struct AppState {
    pub registrar: Arc<Registrar>,
    pub reloader: Arc<dyn Reloader>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Subrelay API",
        version = "0.1.0",
        description = "Register appliances under a subdomain of the relay"
    ),
    paths(handlers::register, handlers::health_check),
    components(schemas(
        models::RegisterRequest,
        models::RegisterResponse,
        models::RegisterData,
        models::ResultKind,
        models::HealthResponse,
    )),
    tags(
        (name = "registration", description = "Appliance registration"),
        (name = "system", description = "System health and info endpoints")
    )
)]
struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        registrar: Arc<Registrar>,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        let state = Arc::new(AppState {
            registrar,
            reloader,
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/register", post(handlers::register))
            .route("/health", get(handlers::health_check))
            .route("/openapi.json", get(openapi_json))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until ctrl-c
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down API server");
            })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
