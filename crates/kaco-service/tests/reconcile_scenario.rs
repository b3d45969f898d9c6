//! Reconciliation against a real SQLite store.

use std::sync::Arc;

use time::macros::datetime;
use time::{Date, Month, OffsetDateTime, Time};
use tokio::sync::Mutex;

use kaco_service::Reconciler;
use kaco_store::{PointQuery, Store};
use kaco_types::{EntryId, PointOrigin, StatisticPoint, Unit};

const LEGACY: &str = "sensor.kaco_12345_power";
const CURRENT: &str = "sensor.kaco_entry9f2_power";

fn day(n: u8) -> OffsetDateTime {
    Date::from_calendar_date(2026, Month::June, n)
        .unwrap()
        .with_time(Time::from_hms(12, 0, 0).unwrap())
        .assume_utc()
}

fn seeded_store(path: &std::path::Path) -> Store {
    let store = Store::open(path).unwrap();
    store
        .register_device(&EntryId::new("entry9f2"), Some("Roof"), "192.0.2.10")
        .unwrap();

    let legacy: Vec<_> = (1..=5)
        .map(|d| StatisticPoint::live(day(d), 100.0 + f64::from(d)))
        .collect();
    let current: Vec<_> = (3..=7)
        .map(|d| StatisticPoint::live(day(d), 200.0 + f64::from(d)))
        .collect();
    store.write_points(LEGACY, Unit::Watt, &legacy).unwrap();
    store.write_points(CURRENT, Unit::Watt, &current).unwrap();
    store
}

#[tokio::test]
async fn test_legacy_series_merged_into_current() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Mutex::new(seeded_store(&dir.path().join("data.db"))));
    let reconciler = Reconciler::new(Arc::clone(&store), EntryId::new("entry9f2"));

    let report = reconciler.run().await.unwrap();
    assert!(report.completed);
    assert_eq!(report.legacy_series, 1);
    assert_eq!(report.points_merged, 2);
    assert_eq!(report.legacy_deleted, 1);

    let s = store.lock().await;
    let points = s.query_points(&PointQuery::new(CURRENT)).unwrap();
    let starts: Vec<_> = points.iter().map(|p| p.start).collect();
    assert_eq!(starts, (1..=7).map(day).collect::<Vec<_>>());

    for point in &points[..2] {
        assert_eq!(point.origin, PointOrigin::Imported);
    }
    assert_eq!(points[0].value, 101.0);
    assert_eq!(points[1].value, 102.0);

    for (point, d) in points[2..].iter().zip(3..=7u8) {
        assert_eq!(point.origin, PointOrigin::Live);
        assert_eq!(point.value, 200.0 + f64::from(d));
    }

    assert_eq!(s.count_points(LEGACY).unwrap(), 0);
    assert!(s.list_series(LEGACY).unwrap().is_empty());
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Mutex::new(seeded_store(&dir.path().join("data.db"))));
    let reconciler = Reconciler::new(Arc::clone(&store), EntryId::new("entry9f2"));

    reconciler.run().await.unwrap();
    let before = store
        .lock()
        .await
        .query_points(&PointQuery::new(CURRENT))
        .unwrap();

    let report = reconciler.run().await.unwrap();
    assert!(report.completed);
    assert_eq!(report.legacy_series, 0);
    assert_eq!(report.points_merged, 0);

    let after = store
        .lock()
        .await
        .query_points(&PointQuery::new(CURRENT))
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_reconciliation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    {
        let store = Arc::new(Mutex::new(seeded_store(&path)));
        Reconciler::new(store, EntryId::new("entry9f2"))
            .run()
            .await
            .unwrap();
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.count_points(CURRENT).unwrap(), 7);
    let state = store.get_repair_state(&EntryId::new("entry9f2")).unwrap();
    assert!(state.migrated_at.unwrap() > datetime!(2026-01-01 0:00 UTC));
}

#[tokio::test]
async fn test_duplicate_suffix_series_is_legacy() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir.path().join("data.db"));
    store
        .write_points(
            "sensor.kaco_12345_power_2",
            Unit::Watt,
            &[StatisticPoint::live(day(8), 300.0)],
        )
        .unwrap();
    let store = Arc::new(Mutex::new(store));

    let report = Reconciler::new(Arc::clone(&store), EntryId::new("entry9f2"))
        .run()
        .await
        .unwrap();
    assert_eq!(report.legacy_series, 2);
    assert_eq!(report.points_merged, 3);
    assert_eq!(store.lock().await.count_points(CURRENT).unwrap(), 8);
}
