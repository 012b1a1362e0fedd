use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::warn;

use crate::config::FrontendConfig;

use super::handlers::{health_check, visit_count, AppState};

pub fn create_api_router(state: Arc<AppState>, frontend: &FrontendConfig) -> Router {
    let router = Router::new()
        .route("/visit-count", get(visit_count))
        .route("/health", get(health_check))
        .layer(cors_layer(&frontend.cors_allowed_origins))
        .with_state(state);

    match &frontend.static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    }
}

/// `*` (or nothing) allows any origin without credentials; an explicit list
/// also allows credentials so a cross-origin site can send the session cookie.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    layer
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}
