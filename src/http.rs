// afc-server: HTTP ingress

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use crate::metrics::Metrics;
use crate::msg_proc::{MessageProcessor, RequestFlags};

/// Header marking requests originating inside the cluster
pub const INTERNAL_REQUEST_HEADER: &str = "x-request-internal";

/// Shared state of the ingress router
pub struct AppState {
    pub processor: Arc<MessageProcessor>,
    pub metrics: Arc<Metrics>,
    /// Cleared when a background task (bus reader) dies
    pub healthy: Arc<AtomicBool>,
}

/// Query flags of the inquiry endpoint
#[derive(Debug, Default, Deserialize)]
pub struct InquiryParams {
    debug: Option<String>,
    edebug: Option<String>,
    nocache: Option<String>,
    gui: Option<String>,
}

fn flag_set(value: &Option<String>) -> bool {
    match value.as_deref() {
        None => false,
        Some(text) => {
            text.is_empty() || text.eq_ignore_ascii_case("true") || text == "1"
        }
    }
}

/// Builds the ingress router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/availableSpectrumInquiry", post(available_spectrum_inquiry))
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// The inquiry endpoint always answers 200 with a structured response
/// message; only an unparseable body is rejected outright
async fn available_spectrum_inquiry(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InquiryParams>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> Json<Value> {
    let flags = RequestFlags {
        debug: flag_set(&params.debug),
        edebug: flag_set(&params.edebug),
        nocache: flag_set(&params.nocache),
        gui: flag_set(&params.gui),
        internal: headers
            .get(INTERNAL_REQUEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map_or(false, |value| {
                value.eq_ignore_ascii_case("true") || value == "1"
            }),
    };
    Json(state.processor.process_msg(msg, flags).await)
}

async fn healthcheck(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Background task failed")
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        assert!(!flag_set(&None));
        assert!(flag_set(&Some(String::new())));
        assert!(flag_set(&Some("True".to_string())));
        assert!(flag_set(&Some("1".to_string())));
        assert!(!flag_set(&Some("False".to_string())));
        assert!(!flag_set(&Some("0".to_string())));
    }
}
