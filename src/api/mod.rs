//! Devicehub HTTP API
//!
//! HTTP and WebSocket surface, built with Axum.
//!
//! # Endpoints
//!
//! ## Ingest
//! - `POST /api/v1/uplinks` - Decoded device uplink
//!
//! ## WebSocket
//! - `GET /ws/device-messages` - Every device message
//! - `GET /ws/devices/:device_id/messages` - Messages for one device
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! ## Metrics
//! - `GET /metrics` - Prometheus text exposition
//!
//! # Example
//!
//! ```rust,ignore
//! use devicehub::api::{serve, AppState};
//! use devicehub::config::Config;
//!
//! let config = Config::load_default();
//! let state = AppState::new(broker, cache, metrics, config.hubs.clone(), config.api.clone());
//! serve(state, &config.api, shutdown_token).await?;
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, WorkerStatus};

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ApiConfig;
use crate::websocket::{device_messages_handler, device_specific_handler};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/uplinks", post(routes::uplinks::ingest_uplink))
        .layer(DefaultBodyLimit::max(state.config.max_body_size));

    let ws_routes = Router::new()
        .route("/device-messages", get(device_messages_handler))
        .route("/devices/:device_id/messages", get(device_specific_handler));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.config.cors_origins);
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/ws", ws_routes)
        .nest("/health", health_routes)
        .route("/metrics", get(routes::metrics::export_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Start the API server, returning once `shutdown` is cancelled and
/// in-flight requests have finished
pub async fn serve(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Devicehub API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Devicehub API shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
///
/// A handler that cannot be installed is logged and never fires; the other
/// one still does.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::cache::DeviceStateCache;
    use crate::events::{topics, Event, EventBroker};
    use crate::telemetry::Metrics;
    use crate::websocket::HubConfig;
    use crate::worker::LoopState;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tokio::sync::watch;
    use tower::util::ServiceExt;

    struct TestApp {
        router: Router,
        broker: Arc<EventBroker>,
        cache: Arc<DeviceStateCache>,
    }

    fn create_test_app() -> TestApp {
        let broker = Arc::new(EventBroker::new(BrokerConfig::default()));
        let cache = Arc::new(DeviceStateCache::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let state = AppState::new(
            Arc::clone(&broker),
            Arc::clone(&cache),
            metrics,
            HubConfig::default(),
            ApiConfig::default(),
        );

        TestApp {
            router: build_router(state),
            broker,
            cache,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_uplink(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/uplinks")
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_live() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready_without_workers() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready_waits_for_workers() {
        let broker = Arc::new(EventBroker::new(BrokerConfig::default()));
        let (tx, rx) = watch::channel(LoopState::Initializing);
        let state = AppState::new(
            broker,
            Arc::new(DeviceStateCache::new()),
            Arc::new(Metrics::new().unwrap()),
            HubConfig::default(),
            ApiConfig::default(),
        )
        .with_worker("command_worker", rx);
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send(LoopState::Running).unwrap();
        let response = router
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_full() {
        let app = create_test_app();
        let _sub = app.broker.subscribe(topics::DEVICE_MESSAGES).unwrap();

        let response = app
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["broker"]["topics"][0]["name"], "device_messages");
        assert_eq!(json["broker"]["topics"][0]["subscribers"], 1);
        assert_eq!(json["websocket"]["device_messages"], 0);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_ingest_uplink() {
        let app = create_test_app();
        let mut sub = app.broker.subscribe(topics::DEVICE_MESSAGES).unwrap();

        let response = app
            .router
            .oneshot(post_uplink(
                r#"{"device_id": "dev-1", "decoded_payload": {"temperature": [{"index": 0, "value": 21.5}]}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["device_id"], "dev-1");

        let state = app.cache.get_state("dev-1").await.unwrap();
        assert_eq!(state.data["temperature"][0].value, 21.5);

        let message = sub.try_recv().unwrap();
        match message.event {
            Event::Uplink(uplink) => assert_eq!(uplink.device_id, "dev-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_trims_device_id_everywhere() {
        let app = create_test_app();
        let mut sub = app.broker.subscribe(topics::DEVICE_MESSAGES).unwrap();

        let response = app
            .router
            .oneshot(post_uplink(
                r#"{"device_id": "  dev-1 ", "decoded_payload": {"temperature": [{"index": 0, "value": 19.0}]}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["device_id"], "dev-1");

        // Cache key and published event agree on the trimmed id
        assert!(app.cache.get_state("  dev-1 ").await.is_none());
        let state = app.cache.get_state("dev-1").await.unwrap();
        assert_eq!(state.device_id, "dev-1");

        match sub.try_recv().unwrap().event {
            Event::Uplink(uplink) => assert_eq!(uplink.device_id, "dev-1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_uplink_without_subscribers() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_uplink(r#"{"device_id": "dev-2"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(app.cache.get_state("dev-2").await.is_some());
    }

    #[tokio::test]
    async fn test_ingest_blank_device_id() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(post_uplink(r#"{"device_id": "   "}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_ingest_invalid_json() {
        let app = create_test_app();

        let response = app.router.oneshot(post_uplink("not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_device_socket_rejects_blank_id() {
        let app = create_test_app();

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .uri("/ws/devices/%20/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_cors_layer_with_origins() {
        // Invalid header values are skipped rather than rejected
        let _layer = cors_layer(&["https://app.example.com".to_string(), "bad\norigin".to_string()]);
    }
}
