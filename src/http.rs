//! HTTP exposition of the reading store.
//!
//! Handlers serve point-in-time snapshots only: they never write to the
//! store and never touch the bus transport, so response time is bounded by
//! lock and copy cost.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::calibration::FillLevel;
use crate::config::SiloConfig;
use crate::health::SharedHealth;
use crate::store::{SharedStore, SiloStatus};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    store: SharedStore,
    health: SharedHealth,
    staleness: Duration,
    codes: Arc<BTreeMap<u8, String>>,
}

impl ApiState {
    /// Build the handler state. `staleness` is the threshold used to derive
    /// online/offline at request time.
    pub fn new(
        store: SharedStore,
        health: SharedHealth,
        staleness: Duration,
        silos: &[SiloConfig],
    ) -> Self {
        let codes = silos.iter().map(|s| (s.id, s.code.clone())).collect();
        Self {
            store,
            health,
            staleness,
            codes: Arc::new(codes),
        }
    }
}

/// One element of the `/api/data` response.
#[derive(Debug, Serialize)]
pub struct SiloSnapshot {
    /// Modbus unit id.
    pub id: u8,
    /// Display code.
    pub code: String,
    /// Raw register content of the last successful read, if any.
    pub raw_value: Option<u16>,
    /// Calibrated fill percentage, if any.
    pub percent: Option<u8>,
    /// Fill bucket, if any.
    pub level: Option<&'static str>,
    /// Derived availability.
    pub status: &'static str,
    /// RFC 3339 timestamp of the last successful read.
    pub last_update: Option<String>,
}

/// Create the HTTP router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/data", get(data_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the /health endpoint. Reflects the scheduler, not
/// individual silo status.
async fn health_handler(State(state): State<ApiState>) -> Response {
    let snapshot = state.health.snapshot();
    let code = if snapshot.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(snapshot)).into_response()
}

/// Handler for the /api/data endpoint: the full store snapshot with status
/// derived at request time, ascending by unit id.
async fn data_handler(State(state): State<ApiState>) -> Response {
    let now = Utc::now();

    let rows: Vec<SiloSnapshot> = state
        .store
        .snapshot()
        .into_iter()
        .map(|(id, reading)| {
            let status = SiloStatus::derive(reading.as_ref(), now, state.staleness);
            SiloSnapshot {
                id,
                code: state
                    .codes
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| format!("S{:02}", id)),
                raw_value: reading.map(|r| r.raw_value),
                percent: reading.map(|r| r.percent),
                level: reading.map(|r| FillLevel::from_percent(r.percent).as_str()),
                status: status.as_str(),
                last_update: reading
                    .map(|r| r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            }
        })
        .collect();

    Json(rows).into_response()
}

/// HTTP server with graceful shutdown.
pub struct HttpServer {
    state: ApiState,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(state: ApiState, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::MonitorHealth;
    use crate::store::{Reading, ReadingStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn silo(id: u8) -> SiloConfig {
        SiloConfig {
            id,
            capacity: 1000,
            code: format!("S{:02}", id),
        }
    }

    fn make_state(store: SharedStore, health: SharedHealth, ids: &[u8]) -> ApiState {
        let silos: Vec<SiloConfig> = ids.iter().map(|id| silo(*id)).collect();
        ApiState::new(store, health, Duration::from_secs(15), &silos)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_starting_is_unavailable() {
        let store = Arc::new(ReadingStore::new([1]));
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        let router = create_router(make_state(store, health, &[1]));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "starting");
    }

    #[tokio::test]
    async fn test_health_ok_after_first_cycle() {
        let store = Arc::new(ReadingStore::new([1]));
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        health.record_cycle(true);
        let router = create_router(make_state(store, health, &[1]));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["cycles_completed"], 1);
    }

    #[tokio::test]
    async fn test_health_degraded_while_bus_down() {
        let store = Arc::new(ReadingStore::new([1]));
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        health.record_cycle(false);
        let router = create_router(make_state(store, health, &[1]));

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn test_data_never_read_rows() {
        let store = Arc::new(ReadingStore::new([2, 1]));
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        let router = create_router(make_state(store, health, &[1, 2]));

        let response = router
            .oneshot(Request::get("/api/data").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let rows = json.as_array().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[1]["id"], 2);
        assert_eq!(rows[0]["status"], "never_read");
        assert!(rows[0]["raw_value"].is_null());
        assert!(rows[0]["percent"].is_null());
        assert!(rows[0]["level"].is_null());
        assert!(rows[0]["last_update"].is_null());
    }

    #[tokio::test]
    async fn test_data_online_row_with_level() {
        let store = Arc::new(ReadingStore::new([7]));
        store.put(
            7,
            Reading {
                raw_value: 300,
                percent: 30,
                timestamp: Utc::now(),
            },
        );
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        let router = create_router(make_state(store, health, &[7]));

        let response = router
            .oneshot(Request::get("/api/data").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        let row = &json.as_array().unwrap()[0];

        assert_eq!(row["id"], 7);
        assert_eq!(row["code"], "S07");
        assert_eq!(row["raw_value"], 300);
        assert_eq!(row["percent"], 30);
        assert_eq!(row["level"], "medium");
        assert_eq!(row["status"], "online");
        assert!(row["last_update"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_data_offline_row_keeps_last_reading() {
        let store = Arc::new(ReadingStore::new([3]));
        store.put(
            3,
            Reading {
                raw_value: 900,
                percent: 90,
                timestamp: Utc::now() - chrono::TimeDelta::seconds(3600),
            },
        );
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        let router = create_router(make_state(store, health, &[3]));

        let response = router
            .oneshot(Request::get("/api/data").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        let row = &json.as_array().unwrap()[0];

        assert_eq!(row["status"], "offline");
        // The stale reading stays visible alongside the offline status.
        assert_eq!(row["raw_value"], 900);
        assert_eq!(row["level"], "high");
    }

    #[tokio::test]
    async fn test_unknown_route_is_request_local() {
        let store = Arc::new(ReadingStore::new([1]));
        let health = Arc::new(MonitorHealth::new(Duration::from_secs(60)));
        let router = create_router(make_state(store, health, &[1]));

        let response = router
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
