use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use super::session::{has_session_flag, session_flag_cookie};
use crate::config::{DedupMode, VisitorConfig};
use crate::counter::VisitCounter;
use crate::models::VisitCountResponse;
use crate::storage::StorageError;
use crate::visitor::{extract_client_ip, VisitorIdentity};

pub struct AppState {
    pub counter: Arc<VisitCounter>,
    pub dedup_mode: DedupMode,
    pub visitor: VisitorConfig,
    pub identity: VisitorIdentity,
    pub session_cookie_name: String,
}

/// Record the visit (if it qualifies) and return the current count
pub async fn visit_count(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match state.dedup_mode {
        DedupMode::Window => count_by_visitor(&state, addr, &headers).await,
        DedupMode::Session => count_by_session(&state, &headers).await,
    }
}

async fn count_by_visitor(state: &AppState, addr: SocketAddr, headers: &HeaderMap) -> Response {
    let client_ip = extract_client_ip(headers, addr.ip(), &state.visitor);
    let visitor_id = state.identity.identify(client_ip);

    match state.counter.record_visit(&visitor_id).await {
        Ok(outcome) => fresh_response(outcome.count()).into_response(),
        Err(e) => degraded_response(state, e),
    }
}

async fn count_by_session(state: &AppState, headers: &HeaderMap) -> Response {
    let already_counted = has_session_flag(headers, &state.session_cookie_name);

    match state.counter.record_session_visit(already_counted).await {
        Ok(outcome) if outcome.is_counted() => (
            [(header::SET_COOKIE, session_flag_cookie(&state.session_cookie_name))],
            fresh_response(outcome.count()),
        )
            .into_response(),
        Ok(outcome) => fresh_response(outcome.count()).into_response(),
        Err(e) => degraded_response(state, e),
    }
}

fn fresh_response(count: u64) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(VisitCountResponse::fresh(count)),
    )
}

/// Storage failed: answer 200 with the last known count marked stale
fn degraded_response(state: &AppState, error: StorageError) -> Response {
    let count = state.counter.last_known_count();
    tracing::error!("Failed to record visit, serving stale count {}: {}", count, error);

    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(VisitCountResponse::stale(count)),
    )
        .into_response()
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
