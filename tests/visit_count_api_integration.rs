//! Visit count API integration tests
//!
//! These tests drive the axum router end to end: client identity from the
//! connection or proxy headers, window and session deduplication, and the
//! degraded response when storage is unavailable.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tally::api::{self, AppState};
use tally::clock::{FixedPurgeChance, ManualClock};
use tally::config::{
    CounterConfig, DedupMode, FrontendConfig, TrustedProxyMode, VisitorConfig,
};
use tally::counter::VisitCounter;
use tally::models::{VisitLogStats, VisitRecord};
use tally::storage::{FileStorage, Storage, StorageError, StorageResult};
use tally::visitor::VisitorIdentity;
use tempfile::TempDir;
use tower::ServiceExt;

const WINDOW: i64 = 86_400;
const START: i64 = 1_700_000_000;

struct TestApp {
    app: Router,
    clock: Arc<ManualClock>,
    storage: Arc<FileStorage>,
    _dir: TempDir,
}

/// Helper to build the router over file storage in a scratch directory
async fn create_test_app(dedup_mode: DedupMode, visitor: VisitorConfig) -> TestApp {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()));
    storage.init().await.unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let counter = Arc::new(VisitCounter::new(
        storage.clone(),
        clock.clone(),
        Arc::new(FixedPurgeChance(false)),
        WINDOW,
    ));

    let identity = VisitorIdentity::new(visitor.id_salt.as_deref()).unwrap();
    let state = Arc::new(AppState {
        counter,
        dedup_mode,
        visitor,
        identity,
        session_cookie_name: CounterConfig::default().session_cookie_name,
    });

    TestApp {
        app: api::create_api_router(state, &FrontendConfig::default()),
        clock,
        storage,
        _dir: dir,
    }
}

/// Build a `GET /visit-count` request arriving from `ip`
fn visit_request(ip: [u8; 4]) -> Request<Body> {
    let mut request = Request::builder()
        .uri("/visit-count")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
    request
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn get_count(app: &Router, request: Request<Body>) -> Value {
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    read_json(response).await
}

#[tokio::test]
async fn test_example_sequence() {
    let test = create_test_app(DedupMode::Window, VisitorConfig::default()).await;

    let body = get_count(&test.app, visit_request([1, 2, 3, 4])).await;
    assert_eq!(body, serde_json::json!({"count": 1}));

    let body = get_count(&test.app, visit_request([1, 2, 3, 4])).await;
    assert_eq!(body, serde_json::json!({"count": 1}));

    let body = get_count(&test.app, visit_request([5, 6, 7, 8])).await;
    assert_eq!(body, serde_json::json!({"count": 2}));

    let log = tokio::fs::read_to_string(test.storage.visit_log_path())
        .await
        .unwrap();
    assert_eq!(log, format!("1.2.3.4|{START}\n5.6.7.8|{START}\n"));
}

#[tokio::test]
async fn test_repeat_visitor_counted_again_after_window() {
    let test = create_test_app(DedupMode::Window, VisitorConfig::default()).await;

    assert_eq!(get_count(&test.app, visit_request([1, 2, 3, 4])).await["count"], 1);

    test.clock.advance(WINDOW - 1);
    assert_eq!(get_count(&test.app, visit_request([1, 2, 3, 4])).await["count"], 1);

    test.clock.advance(1);
    assert_eq!(get_count(&test.app, visit_request([1, 2, 3, 4])).await["count"], 2);
}

#[tokio::test]
async fn test_response_is_not_cacheable() {
    let test = create_test_app(DedupMode::Window, VisitorConfig::default()).await;
    let response = test.app.clone().oneshot(visit_request([1, 2, 3, 4])).await.unwrap();

    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );
}

#[tokio::test]
async fn test_forwarded_for_identifies_visitors_behind_proxy() {
    let visitor = VisitorConfig {
        trusted_proxy_mode: TrustedProxyMode::Standard,
        ..VisitorConfig::default()
    };
    let test = create_test_app(DedupMode::Window, visitor).await;

    // Same proxy socket, different clients
    for (client, expected) in [("203.0.113.1", 1), ("203.0.113.2", 2), ("203.0.113.1", 2)] {
        let mut request = visit_request([10, 0, 0, 1]);
        request
            .headers_mut()
            .insert("x-forwarded-for", client.parse().unwrap());
        assert_eq!(get_count(&test.app, request).await["count"], expected);
    }
}

#[tokio::test]
async fn test_salted_ids_keep_raw_addresses_off_disk() {
    let visitor = VisitorConfig {
        id_salt: Some("test-salt".to_string()),
        ..VisitorConfig::default()
    };
    let test = create_test_app(DedupMode::Window, visitor).await;

    assert_eq!(get_count(&test.app, visit_request([1, 2, 3, 4])).await["count"], 1);
    assert_eq!(get_count(&test.app, visit_request([1, 2, 3, 4])).await["count"], 1);

    let log = tokio::fs::read_to_string(test.storage.visit_log_path())
        .await
        .unwrap();
    assert!(!log.contains("1.2.3.4"));
    assert_eq!(log.lines().count(), 1);
}

#[tokio::test]
async fn test_session_mode_sets_cookie_once() {
    let test = create_test_app(DedupMode::Session, VisitorConfig::default()).await;

    let response = test.app.clone().oneshot(visit_request([1, 2, 3, 4])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("first visit should set the session flag")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("tally_counted=1"));
    assert_eq!(read_json(response).await["count"], 1);

    // Same session: unchanged count, no new cookie
    let mut request = visit_request([1, 2, 3, 4]);
    request
        .headers_mut()
        .insert(header::COOKIE, "tally_counted=1".parse().unwrap());
    let response = test.app.clone().oneshot(request).await.unwrap();
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(read_json(response).await["count"], 1);

    // Same address, new session: counted again
    let body = get_count(&test.app, visit_request([1, 2, 3, 4])).await;
    assert_eq!(body["count"], 2);

    // Session mode keeps no visit history
    let log = tokio::fs::read_to_string(test.storage.visit_log_path())
        .await
        .unwrap();
    assert!(log.is_empty());
}

#[tokio::test]
async fn test_health_check() {
    let test = create_test_app(DedupMode::Window, VisitorConfig::default()).await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

    let response = test.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "OK");
}

/// Storage that can be read but never written
struct ReadOnlyStorage {
    count: u64,
}

#[async_trait]
impl Storage for ReadOnlyStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "read-only"
    }

    async fn load_count(&self) -> StorageResult<u64> {
        Ok(self.count)
    }

    async fn increment_count(&self) -> StorageResult<u64> {
        Err(StorageError::io(
            "/readonly/counter.txt",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        ))
    }

    async fn set_count(&self, _value: u64) -> StorageResult<()> {
        Err(StorageError::Other(anyhow::anyhow!("read-only")))
    }

    async fn latest_live_visit(&self, _: &str, _: i64, _: i64) -> StorageResult<Option<i64>> {
        Ok(None)
    }

    async fn append_visit(&self, _record: &VisitRecord) -> StorageResult<()> {
        Err(StorageError::Other(anyhow::anyhow!("read-only")))
    }

    async fn purge_visits(&self, _: i64, _: i64) -> StorageResult<u64> {
        Ok(0)
    }

    async fn visit_log_stats(&self, _: i64, _: i64) -> StorageResult<VisitLogStats> {
        Ok(VisitLogStats::default())
    }
}

fn create_app_over(storage: Arc<dyn Storage>, dedup_mode: DedupMode) -> Router {
    let counter = Arc::new(VisitCounter::new(
        storage,
        Arc::new(ManualClock::new(START)),
        Arc::new(FixedPurgeChance(false)),
        WINDOW,
    ));
    let state = Arc::new(AppState {
        counter,
        dedup_mode,
        visitor: VisitorConfig::default(),
        identity: VisitorIdentity::new(None).unwrap(),
        session_cookie_name: "tally_counted".to_string(),
    });
    api::create_api_router(state, &FrontendConfig::default())
}

#[tokio::test]
async fn test_unwritable_storage_serves_last_known_count() {
    let app = create_app_over(Arc::new(ReadOnlyStorage { count: 41 }), DedupMode::Window);

    let body = get_count(&app, visit_request([1, 2, 3, 4])).await;
    assert_eq!(body, serde_json::json!({"count": 41, "stale": true}));
}

#[tokio::test]
async fn test_unwritable_storage_in_session_mode_sets_no_cookie() {
    let app = create_app_over(Arc::new(ReadOnlyStorage { count: 7 }), DedupMode::Session);

    let response = app.clone().oneshot(visit_request([1, 2, 3, 4])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(
        read_json(response).await,
        serde_json::json!({"count": 7, "stale": true})
    );
}

#[tokio::test]
async fn test_missing_data_directory_degrades_to_zero() {
    let dir = TempDir::new().unwrap();
    // A regular file where the data directory should be
    let blocker = dir.path().join("not-a-dir");
    tokio::fs::write(&blocker, "x").await.unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(blocker.join("data")));

    let app = create_app_over(storage, DedupMode::Window);
    let body = get_count(&app, visit_request([1, 2, 3, 4])).await;
    assert_eq!(body, serde_json::json!({"count": 0, "stale": true}));
}
