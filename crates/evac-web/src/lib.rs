//! Axum read-through API over the context store.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use evac_storage::{ContextStore, PaginatedFetcher, StoreError};
use evac_sync::{connect_store, SyncConfig};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "evac-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ContextStore>,
    pub fetcher: PaginatedFetcher,
}

impl AppState {
    pub fn new(store: Arc<dyn ContextStore>, fetcher: PaginatedFetcher) -> Self {
        Self { store, fetcher }
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        Ok(Self::new(connect_store(config)?, config.fetcher()))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/getOrionData", get(orion_data_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "HTTP server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    serve(AppState::from_config(&config)?, config.web_port).await
}

async fn orion_data_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("received request to /api/getOrionData");
    match state.fetcher.fetch_all(state.store.as_ref()).await {
        Ok(all) => Json(all).into_response(),
        Err(err) => fetch_error(err),
    }
}

fn fetch_error(err: StoreError) -> Response {
    let detail = match err {
        StoreError::RemoteStatus { status, body } => {
            error!(status, body = %body, "error response from Orion");
            body
        }
        StoreError::TransportUnreachable { message } => {
            error!(error = %message, "no response from Orion");
            "No response received from server".to_string()
        }
        StoreError::Other { message } => {
            error!(error = %message, "error fetching data from Orion");
            message
        }
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Error fetching data from Orion: {detail}"),
    )
        .into_response()
}
