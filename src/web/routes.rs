//! API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cached::proc_macro::cached;
use serde::Deserialize;
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::directory::Region;
use crate::query::{Page, QueryFilter, SearchPage};
use crate::stats::{DailyTotals, IpRegion, Ranking, StatsQuery, Totals};
use crate::LogStore;

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn api_list(State(state): State<Arc<AppState>>, Query(filter): Query<QueryFilter>) -> ApiResult<Page> {
    Ok(Json(state.store.list(&filter).await?))
}

pub async fn api_search(State(state): State<Arc<AppState>>, Query(filter): Query<QueryFilter>) -> ApiResult<SearchPage> {
    Ok(Json(state.store.search(&filter).await?))
}

pub async fn api_find(State(state): State<Arc<AppState>>, Path(request_id): Path<String>) -> Result<Response, ApiError> {
    Ok(match state.store.find(&request_id).await? {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

pub async fn api_top_ips(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<IpRegion>> {
    Ok(Json(state.store.stats().top_ips(&query).await?))
}

pub async fn api_top_regions(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<Region>> {
    Ok(Json(state.store.stats().top_regions(&query).await?))
}

pub async fn api_attacked_hosts(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<String>> {
    Ok(Json(state.store.stats().top_attacked_hosts(&query).await?))
}

pub async fn api_attacked_uris(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<String>> {
    Ok(Json(state.store.stats().top_attacked_uris(&query).await?))
}

pub async fn api_status_codes(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<i32>> {
    Ok(Json(state.store.stats().status_codes(&query).await?))
}

pub async fn api_waf_categories(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Ranking<String>> {
    Ok(Json(state.store.stats().waf_categories(&query).await?))
}

pub async fn api_totals(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResult<Totals> {
    Ok(Json(state.store.stats().totals(&query).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyQuery {
    pub from: String,
    pub to: String,
    pub user_id: Option<i64>,
    pub server_id: Option<i64>,
}

/// Cached per-day totals - 60 second TTL
#[cached(
    time = 60,
    key = "String",
    convert = r#"{ format!("{}:{}:{:?}:{:?}", from, to, user_id, server_id) }"#,
    result = true
)]
async fn get_cached_daily_totals(
    from: String,
    to: String,
    user_id: Option<i64>,
    server_id: Option<i64>,
    store: Arc<LogStore>,
) -> Result<Vec<DailyTotals>, ApiError> {
    let query = StatsQuery {
        user_id,
        server_id,
        ..Default::default()
    };
    Ok(store.stats().daily_totals(&from, &to, &query).await?)
}

/// API: access/attack totals per day (cached for 60 seconds)
pub async fn api_daily_totals(State(state): State<Arc<AppState>>, Query(query): Query<DailyQuery>) -> ApiResult<Vec<DailyTotals>> {
    let days = get_cached_daily_totals(query.from, query.to, query.user_id, query.server_id, state.store.clone()).await?;
    Ok(Json(days))
}
