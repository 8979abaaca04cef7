// afc-rcache-service: Control-plane REST API

use std::sync::Arc;

use afc_rcache::models::{RcacheInvalidateReq, RcacheSpatialInvalidateReq, RcacheStatus, RcacheUpdateReq};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::metrics::ServiceMetrics;
use crate::service::RcacheService;

/// Shared state of the control router
pub struct ControlState {
    pub service: Arc<RcacheService>,
    pub metrics: Arc<ServiceMetrics>,
}

/// Builds the control-plane router
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route(
            "/invalidation_state",
            get(get_invalidation_state).post(set_invalidation_state),
        )
        .route(
            "/precomputation_state",
            get(get_precomputation_state).post(set_precomputation_state),
        )
        .route("/update_state", get(get_update_state).post(set_update_state))
        .route(
            "/precompute_quota",
            get(get_precompute_quota).post(set_precompute_quota),
        )
        .route("/invalidate", post(invalidate))
        .route("/spatial_invalidate", post(spatial_invalidate))
        .route("/update", post(update))
        .route("/status", get(status))
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn get_invalidation_state(
    State(state): State<Arc<ControlState>>,
) -> Result<Json<bool>, StatusCode> {
    state
        .service
        .get_invalidation_enabled()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn set_invalidation_state(
    State(state): State<Arc<ControlState>>,
    Json(value): Json<bool>,
) -> Result<StatusCode, StatusCode> {
    state
        .service
        .set_invalidation_enabled(value)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_precomputation_state(
    State(state): State<Arc<ControlState>>,
) -> Result<Json<bool>, StatusCode> {
    state
        .service
        .get_precomputation_enabled()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn set_precomputation_state(
    State(state): State<Arc<ControlState>>,
    Json(value): Json<bool>,
) -> Result<StatusCode, StatusCode> {
    state
        .service
        .set_precomputation_enabled(value)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_update_state(
    State(state): State<Arc<ControlState>>,
) -> Result<Json<bool>, StatusCode> {
    state
        .service
        .get_update_enabled()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn set_update_state(
    State(state): State<Arc<ControlState>>,
    Json(value): Json<bool>,
) -> Result<StatusCode, StatusCode> {
    state
        .service
        .set_update_enabled(value)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_precompute_quota(State(state): State<Arc<ControlState>>) -> Json<usize> {
    Json(state.service.precompute_quota())
}

async fn set_precompute_quota(
    State(state): State<Arc<ControlState>>,
    Json(value): Json<usize>,
) -> StatusCode {
    state.service.set_precompute_quota(value);
    StatusCode::OK
}

async fn invalidate(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<RcacheInvalidateReq>,
) -> StatusCode {
    state.service.enqueue_invalidation(req);
    StatusCode::OK
}

async fn spatial_invalidate(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<RcacheSpatialInvalidateReq>,
) -> StatusCode {
    state.service.enqueue_spatial_invalidation(req);
    StatusCode::OK
}

async fn update(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<RcacheUpdateReq>,
) -> StatusCode {
    state.service.enqueue_update(req);
    StatusCode::OK
}

async fn status(State(state): State<Arc<ControlState>>) -> Json<RcacheStatus> {
    Json(state.service.status().await)
}

async fn healthcheck(State(state): State<Arc<ControlState>>) -> (StatusCode, &'static str) {
    if state.service.healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Service unhealthy")
    }
}

async fn metrics(State(state): State<Arc<ControlState>>) -> String {
    let store = state.service.store();
    if let Ok(invalid) = store.num_invalid().await {
        state.metrics.invalid_entries.set(invalid);
    }
    if let Ok(precomputing) = store.num_precomputing().await {
        state.metrics.precomputing_entries.set(precomputing);
    }
    state.metrics.gather()
}
