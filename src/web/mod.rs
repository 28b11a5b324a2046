//! Read-only JSON API over the log store

mod routes;

use anyhow::Result;
use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::error::LogStoreError;
use crate::LogStore;

pub struct AppState {
    pub store: Arc<LogStore>,
}

/// Store failure rendered as a JSON error body.
#[derive(Debug)]
pub struct ApiError(LogStoreError);

impl From<LogStoreError> for ApiError {
    fn from(err: LogStoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %self.0, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn router(store: Arc<LogStore>) -> Router {
    let state = Arc::new(AppState { store });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/api/logs", get(routes::api_list))
        .route("/api/logs/search", get(routes::api_search))
        .route("/api/logs/:request_id", get(routes::api_find))
        .route("/api/stats/top-ips", get(routes::api_top_ips))
        .route("/api/stats/top-regions", get(routes::api_top_regions))
        .route("/api/stats/attacked-hosts", get(routes::api_attacked_hosts))
        .route("/api/stats/attacked-uris", get(routes::api_attacked_uris))
        .route("/api/stats/status-codes", get(routes::api_status_codes))
        .route("/api/stats/waf-categories", get(routes::api_waf_categories))
        .route("/api/stats/totals", get(routes::api_totals))
        .route("/api/stats/daily", get(routes::api_daily_totals))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(config: &Config, store: Arc<LogStore>) -> Result<()> {
    let app = router(store);

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!("API server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
