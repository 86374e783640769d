//! Registry HTTP server
//!
//! Every access response is HTTP 200 with the `{data, error}` envelope;
//! failures are reported in `error` rather than through the status code.

use crate::auth::TokenValidator;
use crate::selector::{Capabilities, NodeSelector};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use meshtun_proto::{AccessRequest, AccessResponse, ApiResponse, ACCESS_PATH};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: SocketAddr, reason: String },
}

#[derive(Clone)]
pub struct RegistryState {
    pub selector: Arc<NodeSelector>,
    pub validator: Arc<dyn TokenValidator>,
}

impl RegistryState {
    pub fn new(selector: Arc<NodeSelector>, validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            selector,
            validator,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    nodes: usize,
    available: usize,
}

pub fn build_router(state: RegistryState) -> Router {
    Router::new()
        .route(ACCESS_PATH, post(access))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Body is taken raw so malformed JSON still gets the envelope, not a 4xx
async fn access(
    State(state): State<RegistryState>,
    body: Bytes,
) -> Json<ApiResponse<AccessResponse>> {
    let request: AccessRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!("Malformed access request: {}", e);
            return Json(ApiResponse::err(e.to_string()));
        }
    };

    if let Err(e) = state.validator.validate(&request.auth_token).await {
        warn!("Rejected access request: {}", e);
        return Json(ApiResponse::err(e.to_string()));
    }

    let required = if request.is_windows {
        Capabilities::WINDOWS_DRIVER
    } else {
        Capabilities::NONE
    };

    match state.selector.select(required) {
        Ok(node) => {
            info!(
                node = %node.id,
                windows = request.is_windows,
                "Assigned relay node {}",
                node.server_address()
            );
            Json(ApiResponse::ok(AccessResponse {
                server_address: node.server_address(),
            }))
        }
        Err(e) => {
            warn!("No relay node for request (windows={}): {}", request.is_windows, e);
            Json(ApiResponse::err(e.to_string()))
        }
    }
}

async fn health(State(state): State<RegistryState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        nodes: state.selector.len(),
        available: state.selector.available_count(),
    })
}

pub struct RegistryServer {
    bind_addr: SocketAddr,
    state: RegistryState,
}

impl RegistryServer {
    pub fn new(bind_addr: SocketAddr, state: RegistryState) -> Self {
        Self { bind_addr, state }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn start(self) -> Result<(), RegistryError> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| RegistryError::Bind {
                address: self.bind_addr,
                reason: e.to_string(),
            })?;
        info!("Registry listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
