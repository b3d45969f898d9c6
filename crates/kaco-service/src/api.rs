//! REST API endpoints for kaco-service.
//!
//! # Concurrency and Lock Acquisition
//!
//! - **`state.devices`** (RwLock): Read lock to look up a running device; the
//!   `Arc<DeviceRuntime>` is cloned and the lock released before any other
//!   await.
//! - **`state.store`** (Mutex): Held briefly for registry and statistics
//!   queries.
//! - **Poller cache** (RwLock, inside each device): Read only. Cache reads
//!   never wait for an in-flight fetch.
//!
//! ## Lock Ordering
//!
//! When multiple locks are needed, acquire in this order to prevent deadlocks:
//! 1. `devices` (if needed)
//! 2. `store` (if needed)
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Store errors
//! return HTTP 500; unknown devices 404; malformed queries 400; a repair
//! that is already running 409.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use kaco_core::statistics::current_statistic_id;
use kaco_core::{ConnectivityState, PollStats};
use kaco_store::{PointQuery, StoredDevice};
use kaco_types::{Channel, ChannelValue, EntryId, Quality, StatisticPoint, Unit};

use crate::repair::{RepairError, RepairStatus};
use crate::state::{AppState, DeviceRuntime};

/// Largest number of points returned by the statistics endpoint.
pub const MAX_POINTS: u32 = 10_000;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Registry
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{id}", get(get_device))
        // Live values
        .route("/api/devices/{id}/sensors", get(get_sensors))
        .route("/api/devices/{id}/connectivity", get(get_connectivity))
        // Long-term statistics
        .route("/api/devices/{id}/statistics/{channel}", get(get_statistics))
        .route("/api/devices/{id}/repair", get(get_repair).post(start_repair))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status with per-device poll statistics.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub devices: Vec<DeviceStatus>,
}

/// Poll statistics of one running device.
#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    pub entry_id: EntryId,
    pub name: String,
    pub address: String,
    pub connectivity: ConnectivityState,
    pub serial_number: Option<String>,
    pub polls: PollStats,
    pub repair: RepairStatus,
    /// Identity conflict that kept a learned serial number from being stored.
    pub identity_error: Option<String>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let runtimes: Vec<Arc<DeviceRuntime>> = state.devices.read().await.values().cloned().collect();

    let mut devices = Vec::with_capacity(runtimes.len());
    for runtime in runtimes {
        devices.push(DeviceStatus {
            entry_id: runtime.entry_id().clone(),
            name: runtime.config.display_name().to_string(),
            address: runtime.config.address.clone(),
            connectivity: runtime.poller.connectivity().await,
            serial_number: runtime.poller.identity().await.serial_number,
            polls: runtime.poller.stats().await,
            repair: runtime.repair.status().await,
            identity_error: runtime.identity_error.lock().await.clone(),
        });
    }
    devices.sort_by(|a, b| a.entry_id.cmp(&b.entry_id));

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        devices,
    })
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredDevice>>, AppError> {
    let store = state.store.lock().await;
    let devices = store.list_devices()?;
    Ok(Json(devices))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoredDevice>, AppError> {
    let store = state.store.lock().await;
    let device = store
        .get_device(&EntryId::new(id.as_str()))?
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))?;
    Ok(Json(device))
}

/// Current value of one channel.
#[derive(Debug, Serialize)]
pub struct SensorValue {
    pub channel: Channel,
    pub value: ChannelValue,
    pub quality: Quality,
    pub unit: &'static str,
    /// Seconds since the value was received.
    pub age_secs: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Every exposed channel of a device.
#[derive(Debug, Serialize)]
pub struct SensorsResponse {
    pub entry_id: EntryId,
    pub connectivity: ConnectivityState,
    /// Highest power seen since start, in W.
    pub peak_power: Option<f64>,
    /// Channels without any successful reading yet.
    pub unknown: Vec<Channel>,
    pub sensors: Vec<SensorValue>,
}

async fn get_sensors(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SensorsResponse>, AppError> {
    let runtime = running_device(&state, &id).await?;
    let cache = runtime.poller.cache().read().await;

    let mut sensors = Vec::new();
    let mut unknown = Vec::new();
    for channel in &runtime.channels {
        match cache.get(*channel) {
            Some(cached) => sensors.push(SensorValue {
                channel: *channel,
                value: cached.reading.value,
                quality: cached.reading.quality,
                unit: channel.unit().symbol(),
                age_secs: cached.age.as_secs(),
                timestamp: cached.reading.timestamp,
            }),
            None => unknown.push(*channel),
        }
    }

    Ok(Json(SensorsResponse {
        entry_id: runtime.entry_id().clone(),
        connectivity: cache.connectivity(),
        peak_power: cache.peak_power(),
        unknown,
        sensors,
    }))
}

/// Online/Offline state of a device.
#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    pub entry_id: EntryId,
    pub state: ConnectivityState,
    pub consecutive_fast_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

async fn get_connectivity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConnectivityResponse>, AppError> {
    let runtime = running_device(&state, &id).await?;
    let stats = runtime.poller.stats().await;

    Ok(Json(ConnectivityResponse {
        entry_id: runtime.entry_id().clone(),
        state: runtime.poller.connectivity().await,
        consecutive_fast_failures: stats.fast.consecutive_failures,
        last_success: stats.fast.last_success,
    }))
}

/// Query parameters for statistics.
#[derive(Debug, Default, Deserialize)]
pub struct StatisticsQuery {
    /// RFC 3339 timestamp; points at or after it.
    pub since: Option<String>,
    /// RFC 3339 timestamp; points at or before it.
    pub until: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Stored statistics of one channel.
#[derive(Debug, Serialize)]
pub struct StatisticsResponse {
    pub statistic_id: String,
    pub unit: Unit,
    pub count: usize,
    pub points: Vec<StatisticPoint>,
}

async fn get_statistics(
    State(state): State<Arc<AppState>>,
    Path((id, channel)): Path<(String, String)>,
    Query(params): Query<StatisticsQuery>,
) -> Result<Json<StatisticsResponse>, AppError> {
    let channel = Channel::from_key(&channel)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown channel: {}", channel)))?;
    if !channel.has_statistics() {
        return Err(AppError::BadRequest(format!(
            "Channel {} has no statistics",
            channel
        )));
    }

    let entry_id = EntryId::new(id.as_str());
    let statistic_id = current_statistic_id(&entry_id, channel);
    let mut query = PointQuery::new(statistic_id.as_str())
        .limit(params.limit.unwrap_or(MAX_POINTS).min(MAX_POINTS));
    if let Some(since) = &params.since {
        query = query.since(parse_timestamp("since", since)?);
    }
    if let Some(until) = &params.until {
        query = query.until(parse_timestamp("until", until)?);
    }
    if let Some(offset) = params.offset {
        query = query.offset(offset);
    }

    let store = state.store.lock().await;
    if store.get_device(&entry_id)?.is_none() {
        return Err(AppError::NotFound(format!("Device not found: {}", id)));
    }
    let points = store.query_points(&query)?;

    Ok(Json(StatisticsResponse {
        statistic_id,
        unit: channel.unit(),
        count: points.len(),
        points,
    }))
}

fn parse_timestamp(field: &str, value: &str) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
        AppError::BadRequest(format!("Invalid '{}' timestamp '{}': {}", field, value, e))
    })
}

async fn get_repair(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RepairStatus>, AppError> {
    let runtime = running_device(&state, &id).await?;
    Ok(Json(runtime.repair.status().await))
}

/// Start a reconciliation of one device.
async fn start_repair(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let runtime = running_device(&state, &id).await?;
    runtime
        .start_repair(Arc::clone(&state.store))
        .await
        .map_err(|e| match e {
            RepairError::AlreadyRunning => {
                AppError::Conflict(format!("Repair of {} is already running", id))
            }
            other => AppError::Internal(other.to_string()),
        })?;

    Ok((StatusCode::ACCEPTED, Json(runtime.repair.status().await)))
}

async fn running_device(state: &AppState, id: &str) -> Result<Arc<DeviceRuntime>, AppError> {
    state
        .device(&EntryId::new(id))
        .await
        .ok_or_else(|| AppError::NotFound(format!("Device not running: {}", id)))
}

/// API error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Store(kaco_store::Error),
    Internal(String),
}

impl From<kaco_store::Error> for AppError {
    fn from(e: kaco_store::Error) -> Self {
        AppError::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use kaco_store::Store;
    use time::macros::datetime;

    use crate::config::Config;

    fn create_test_state() -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        store
            .register_device(&EntryId::new("entry9f2"), Some("Roof"), "192.0.2.10")
            .unwrap();
        store
            .write_points(
                "sensor.kaco_entry9f2_power",
                Unit::Watt,
                &[
                    StatisticPoint::live(datetime!(2026-06-01 10:00 UTC), 1200.0),
                    StatisticPoint::live(datetime!(2026-06-01 11:00 UTC), 3400.0),
                ],
            )
            .unwrap();
        AppState::new(store, Config::default())
    }

    async fn response_body(response: axum::response::Response) -> String {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response_body(response).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = get(create_test_state(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_status_without_devices() {
        let (status, json) = get(create_test_state(), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["devices"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_list_and_get_devices() {
        let state = create_test_state();
        let (status, json) = get(state.clone(), "/api/devices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["entry_id"], "entry9f2");
        assert_eq!(json[0]["name"], "Roof");

        let (status, json) = get(state.clone(), "/api/devices/entry9f2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["address"], "192.0.2.10");

        let (status, json) = get(state, "/api/devices/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_statistics_endpoint() {
        let state = create_test_state();
        let (status, json) = get(state.clone(), "/api/devices/entry9f2/statistics/power").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["statistic_id"], "sensor.kaco_entry9f2_power");
        assert_eq!(json["count"], 2);
        assert_eq!(json["points"][1]["value"], 3400.0);

        let (_, json) = get(
            state,
            "/api/devices/entry9f2/statistics/power?since=2026-06-01T10:30:00Z",
        )
        .await;
        assert_eq!(json["count"], 1);
    }

    #[tokio::test]
    async fn test_statistics_errors() {
        let state = create_test_state();

        let (status, _) = get(state.clone(), "/api/devices/entry9f2/statistics/bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(state.clone(), "/api/devices/entry9f2/statistics/status").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(
            state.clone(),
            "/api/devices/entry9f2/statistics/power?since=yesterday",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(state, "/api/devices/other/statistics/power").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_live_endpoints_need_running_device() {
        let state = create_test_state();
        for uri in [
            "/api/devices/entry9f2/sensors",
            "/api/devices/entry9f2/connectivity",
            "/api/devices/entry9f2/repair",
        ] {
            let (status, _) = get(state.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = AppError::Conflict("busy".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = response_body(response).await;
        assert_eq!(body, r#"{"error":"busy"}"#);
    }
}
