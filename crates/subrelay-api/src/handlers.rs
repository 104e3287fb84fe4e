use axum::{body::Bytes, extract::State, Json};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::ApiError;
use crate::models::*;
use crate::AppState;

/// Register an appliance under a subdomain
#[utoipa::path(
    post,
    path = "/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Binding created or confirmed", body = RegisterResponse),
        (status = 400, description = "Malformed or invalid request", body = RegisterResponse),
        (status = 403, description = "Unknown token", body = RegisterResponse),
        (status = 409, description = "Subdomain held by another appliance", body = RegisterResponse),
        (status = 503, description = "State busy, retry later", body = RegisterResponse),
        (status = 500, description = "Internal server error", body = RegisterResponse)
    ),
    tag = "registration"
)]
pub async fn register(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    let variant = state.registrar.variant();
    let registration = RegisterRequest::parse(&body, variant)?;
    debug!("Register request for {}", registration.subdomain);

    let registrar = state.registrar.clone();
    let outcome = match tokio::task::spawn_blocking(move || registrar.register(&registration))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        Ok(outcome) => outcome,
        Err(failure) => {
            // Purged site files are gone whatever the verdict
            if failure.removed > 0 {
                apply_config(&state, false).await;
            }
            return Err(failure.error.into());
        }
    };

    if outcome.needs_reload() {
        apply_config(&state, outcome.needs_agent_restart()).await;
    }

    Ok(Json(RegisterResponse::success(RegisterData::from_binding(
        &outcome.binding,
        variant,
    ))))
}

/// Reload the reverse proxy on the blocking pool
///
/// The new state is already on disk; a failed reload is picked up by the next
/// one, so it is logged rather than returned.
async fn apply_config(state: &AppState, restart_agents: bool) {
    let reloader = state.reloader.clone();
    match tokio::task::spawn_blocking(move || reloader.apply(restart_agents)).await {
        Ok(Ok(())) => info!("Configuration applied (restart agents: {})", restart_agents),
        Ok(Err(e)) => error!("Reload failed: {}", e),
        Err(e) => error!("Reload task failed: {}", e),
    }
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tokens: state.registrar.tokens().len(),
        variant: state.registrar.variant().to_string(),
    })
}
