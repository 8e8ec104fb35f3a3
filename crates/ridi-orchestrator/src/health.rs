// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health endpoints of both services.
//!
//! The router service is healthy while the plan listener is consuming and at
//! least one region boundary is serving. The map-data service is healthy once
//! it has registered its service record.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use ridi_core::Persistence;
use ridi_core::models::service_names;
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::Result;

/// Shared state of the health handlers.
#[derive(Clone)]
pub struct HealthState {
    /// Persistence used for the region count.
    pub store: Arc<dyn Persistence>,
    /// Set while the plan listener polls.
    pub messaging_running: Arc<AtomicBool>,
}

/// Build the health router.
pub fn create_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> Response {
    let messaging_running = state.messaging_running.load(Ordering::SeqCst);
    let region_count = match state.store.region_count_current().await {
        Ok(count) => Some(count),
        Err(e) => {
            error!(error = %e, "Health check failed to count regions");
            None
        }
    };

    if messaging_running && region_count.unwrap_or(0) > 0 {
        Json(json!({
            "status": "ok",
            "regionCount": region_count,
        }))
        .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "messagingRunning": messaging_running,
                "regionCount": region_count,
            })),
        )
            .into_response()
    }
}

/// Build the map-data health router.
pub fn create_map_data_router(store: Arc<dyn Persistence>) -> Router {
    Router::new()
        .route("/", get(map_data_health_check))
        .route("/health", get(map_data_health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn map_data_health_check(State(store): State<Arc<dyn Persistence>>) -> Response {
    match store.service_get(service_names::MAP_DATA).await {
        Ok(Some(_)) => "ok".into_response(),
        Ok(None) => (StatusCode::BAD_REQUEST, "nok").into_response(),
        Err(e) => {
            error!(error = %e, "Health check failed to read service record");
            (StatusCode::BAD_REQUEST, "nok").into_response()
        }
    }
}

/// Serve `router` until `true` is sent on `shutdown`.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    info!("Health endpoint stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SeedRegion, memory_store, seed_current, square};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthy() {
        let store = memory_store().await;
        seed_current(
            store.as_ref(),
            vec![SeedRegion {
                region: "europe/andorra",
                ring: square(1.4, 42.4, 1.8, 42.7),
                cache_mb: 10,
            }],
        )
        .await;
        let router = create_router(HealthState {
            store,
            messaging_running: Arc::new(AtomicBool::new(true)),
        });

        for uri in ["/", "/health"] {
            let (status, body) = get_json(router.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["regionCount"], 1);
        }
    }

    #[tokio::test]
    async fn test_unhealthy_without_regions() {
        let store = memory_store().await;
        let router = create_router(HealthState {
            store,
            messaging_running: Arc::new(AtomicBool::new(true)),
        });

        let (status, body) = get_json(router, "/health").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"messagingRunning": true, "regionCount": 0}));
    }

    #[tokio::test]
    async fn test_unhealthy_when_listener_stopped() {
        let store = memory_store().await;
        seed_current(
            store.as_ref(),
            vec![SeedRegion {
                region: "europe/andorra",
                ring: square(1.4, 42.4, 1.8, 42.7),
                cache_mb: 10,
            }],
        )
        .await;
        let router = create_router(HealthState {
            store,
            messaging_running: Arc::new(AtomicBool::new(false)),
        });

        let (status, body) = get_json(router, "/").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["messagingRunning"], false);
        assert_eq!(body["regionCount"], 1);
    }

    #[tokio::test]
    async fn test_map_data_health_follows_service_record() {
        let store = memory_store().await;
        let router = create_map_data_router(store.clone());

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        store
            .service_upsert(service_names::MAP_DATA, "v1")
            .await
            .unwrap();
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let store = memory_store().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(serve(
            "127.0.0.1:0".parse().unwrap(),
            create_map_data_router(store),
            rx,
        ));

        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
    }
}
