//! Explorer REST API over the indexed tables

mod handlers;
mod responses;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::DbPool;
use crate::types::config::indexer::ApiSettings;

use handlers::*;

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub pool: Arc<DbPool>,
    pub max_page_size: u32,
    pub native_token_symbol: String,
}

impl ApiState {
    pub fn new(pool: Arc<DbPool>, settings: &ApiSettings, native_token_symbol: &str) -> Self {
        Self {
            pool,
            max_page_size: settings.max_page_size,
            native_token_symbol: native_token_symbol.to_string(),
        }
    }
}

pub fn create_explorer_routes() -> Router<ApiState> {
    Router::new()
        .route("/v1/explorer/blocks", get(list_blocks))
        .route("/v1/explorer/block/:number_or_hash", get(get_block))
        .route("/v1/explorer/transactions", get(list_transactions))
        .route("/v1/explorer/transaction/:hash", get(get_transaction))
        .route("/v1/explorer/token_transfers", get(list_token_transfers))
        .route("/v1/explorer/address/:address/token_transfers", get(get_address_token_transfers))
        .route("/v1/explorer/token/:address", get(get_token))
}

pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .merge(create_explorer_routes())
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve until `shutdown` flips to true.
pub async fn serve(state: ApiState, bind_address: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = create_app(state);
    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind API server to {}", bind_address))?;
    tracing::info!("API server listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("API server error")?;

    tracing::info!("API server stopped");
    Ok(())
}
