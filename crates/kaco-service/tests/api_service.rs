//! API tests against a running collector with mock inverters.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use time::OffsetDateTime;
use tower::ServiceExt;

use kaco_core::MockFetcher;
use kaco_service::{AppState, Collector, Config, DeviceConfig, api};
use kaco_store::Store;
use kaco_types::EntryId;

const ENTRY: &str = "entry9f2";

fn device() -> DeviceConfig {
    let mut config = DeviceConfig::new("192.0.2.10");
    config.entry_id = Some(EntryId::new(ENTRY));
    config.name = Some("Roof".into());
    config
}

/// State with one device whose automatic reconciliation already ran.
async fn running_state(fetcher: Arc<MockFetcher>) -> (Arc<AppState>, Collector) {
    let store = Store::open_in_memory().unwrap();
    store
        .register_device(&EntryId::new(ENTRY), Some("Roof"), "192.0.2.10")
        .unwrap();
    store
        .set_migrated(&EntryId::new(ENTRY), OffsetDateTime::now_utc())
        .unwrap();

    let state = AppState::new(store, Config::default());
    let collector = Collector::new(Arc::clone(&state));
    collector.add_device(device(), fetcher).await.unwrap();
    (state, collector)
}

async fn request(
    state: &Arc<AppState>,
    method: Method,
    uri: &str,
) -> (StatusCode, serde_json::Value) {
    let response = api::router()
        .with_state(Arc::clone(state))
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn wait_for_sensors(state: &Arc<AppState>) -> serde_json::Value {
    for _ in 0..200 {
        let (status, json) = request(state, Method::GET, "/api/devices/entry9f2/sensors").await;
        assert_eq!(status, StatusCode::OK);
        if !json["sensors"].as_array().unwrap().is_empty() {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no sensor values after 2s");
}

#[tokio::test]
async fn test_sensors_after_first_poll() {
    let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
    let (state, collector) = running_state(fetcher).await;

    let json = wait_for_sensors(&state).await;
    assert_eq!(json["entry_id"], ENTRY);
    assert_eq!(json["connectivity"], "online");
    assert_eq!(json["peak_power"], 5000.0);

    let power = json["sensors"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["channel"] == "power")
        .unwrap();
    assert_eq!(power["value"], 5000.0);
    assert_eq!(power["quality"], "fresh");
    assert_eq!(power["unit"], "W");

    let (status, json) = request(&state, Method::GET, "/api/devices/entry9f2/connectivity").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "online");
    assert_eq!(json["consecutive_fast_failures"], 0);

    let (_, json) = request(&state, Method::GET, "/api/status").await;
    assert_eq!(json["devices"][0]["entry_id"], ENTRY);
    assert_eq!(json["devices"][0]["name"], "Roof");

    collector.stop().await;
}

#[tokio::test]
async fn test_offline_device_has_no_values() {
    let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
    fetcher.set_should_fail(true);
    let (state, collector) = running_state(fetcher).await;

    let (status, json) = request(&state, Method::GET, "/api/devices/entry9f2/sensors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["connectivity"], "offline");
    assert!(json["sensors"].as_array().unwrap().is_empty());
    assert_eq!(json["unknown"].as_array().unwrap().len(), 4);

    collector.stop().await;
}

#[tokio::test]
async fn test_repair_start_and_conflict() {
    let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
    let (state, collector) = running_state(fetcher).await;

    let (status, json) = request(&state, Method::GET, "/api/devices/entry9f2/repair").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "idle");

    // The history probe pauses between requests, so the first run is
    // still going when the second request arrives.
    let (status, json) = request(&state, Method::POST, "/api/devices/entry9f2/repair").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["state"], "running");

    let (status, json) = request(&state, Method::POST, "/api/devices/entry9f2/repair").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("already running"));

    let (status, _) = request(&state, Method::POST, "/api/devices/unknown/repair").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    collector.stop().await;
    let (_, json) = request(&state, Method::GET, "/api/status").await;
    assert!(json["devices"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_statistics_recorded_from_polls() {
    let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
    let (state, collector) = running_state(fetcher).await;
    wait_for_sensors(&state).await;

    let mut count = 0;
    for _ in 0..200 {
        let (status, json) =
            request(&state, Method::GET, "/api/devices/entry9f2/statistics/power").await;
        assert_eq!(status, StatusCode::OK);
        count = json["count"].as_u64().unwrap();
        if count > 0 {
            assert_eq!(json["points"][0]["value"], 5000.0);
            assert_eq!(json["points"][0]["origin"], "live");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count, 1);

    collector.stop().await;
}
