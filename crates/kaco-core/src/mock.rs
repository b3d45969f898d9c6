//! Mock fetcher implementation for testing.
//!
//! This module provides a fetcher that serves canned CSV bodies, so the
//! poller and history download can be tested without an inverter on the
//! network. Bodies go through the real parsers.
//!
//! # Features
//!
//! - **Failure injection**: fail every request, or the next `n` requests
//! - **Latency simulation**: delay responses to trigger poller timeouts
//! - **Day logs**: serve a day log per date for history tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::Date;

use kaco_types::{DailyLog, RealtimeReadings, day_log_name};

use crate::error::{Error, FetchErrorKind, Result};
use crate::fetcher::ReadingFetcher;

/// Model string written into generated day logs.
pub const MOCK_MODEL: &str = "blueplanet 10.0 TL3";

/// Serial number written into generated day logs by default.
pub const MOCK_SERIAL: &str = "BPI000000001";

/// A mock inverter for testing.
///
/// # Example
///
/// ```
/// use kaco_core::{MockFetcher, ReadingFetcher};
///
/// #[tokio::main]
/// async fn main() {
///     let fetcher = MockFetcher::new("192.0.2.10");
///     let readings = fetcher.fetch_realtime().await.unwrap();
///     assert!(readings.status.is_feeding_in());
///
///     fetcher.set_should_fail(true);
///     assert!(fetcher.fetch_realtime().await.is_err());
/// }
/// ```
pub struct MockFetcher {
    address: String,
    realtime_body: Mutex<Bytes>,
    days: Mutex<BTreeMap<Date, Bytes>>,
    serial: Mutex<String>,
    should_fail: AtomicBool,
    fail_kind: Mutex<FetchErrorKind>,
    /// Number of requests to fail before succeeding again.
    remaining_failures: AtomicU32,
    /// Simulated latency in milliseconds (0 = no delay).
    latency_ms: AtomicU64,
    realtime_count: AtomicU32,
    day_count: AtomicU32,
}

impl std::fmt::Debug for MockFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFetcher")
            .field("address", &self.address)
            .field("should_fail", &self.should_fail.load(Ordering::Relaxed))
            .field(
                "remaining_failures",
                &self.remaining_failures.load(Ordering::Relaxed),
            )
            .field("latency_ms", &self.latency_ms.load(Ordering::Relaxed))
            .field("realtime_count", &self.realtime_count.load(Ordering::Relaxed))
            .field("day_count", &self.day_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockFetcher {
    /// Create a mock inverter feeding in 5 kW with no day logs.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            realtime_body: Mutex::new(Bytes::from(realtime_csv(3277, 4))),
            days: Mutex::new(BTreeMap::new()),
            serial: Mutex::new(MOCK_SERIAL.to_string()),
            should_fail: AtomicBool::new(false),
            fail_kind: Mutex::new(FetchErrorKind::Unreachable),
            remaining_failures: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            realtime_count: AtomicU32::new(0),
            day_count: AtomicU32::new(0),
        }
    }

    // --- Test control methods ---

    /// Serve `body` as `realtime.csv`.
    pub fn set_realtime_body(&self, body: impl Into<Bytes>) {
        *lock(&self.realtime_body) = body.into();
    }

    /// Serve a realtime body with the given raw power field.
    pub fn set_power_raw(&self, raw: u32) {
        self.set_realtime_body(realtime_csv(raw, 4));
    }

    /// Serial number written into day logs inserted after this call.
    pub fn set_serial(&self, serial: &str) {
        *lock(&self.serial) = serial.to_string();
    }

    /// Serve a day log for `date` reporting `energy` kWh.
    pub fn insert_day(&self, date: Date, energy: f64) {
        let serial = lock(&self.serial).clone();
        self.insert_day_body(date, daily_csv(date, &serial, energy));
    }

    /// Serve `body` as the day log for `date`.
    pub fn insert_day_body(&self, date: Date, body: impl Into<Bytes>) {
        lock(&self.days).insert(date, body.into());
    }

    /// Make every request fail until cleared.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// How injected failures are reported.
    pub fn set_fail_kind(&self, kind: FetchErrorKind) {
        *lock(&self.fail_kind) = kind;
    }

    /// Fail the next `count` requests, then succeed.
    pub fn set_transient_failures(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::Relaxed);
    }

    /// Get the number of remaining transient failures.
    pub fn remaining_failures(&self) -> u32 {
        self.remaining_failures.load(Ordering::Relaxed)
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of `realtime.csv` requests served or failed.
    pub fn realtime_request_count(&self) -> u32 {
        self.realtime_count.load(Ordering::Relaxed)
    }

    /// Number of day log requests served or failed.
    pub fn day_request_count(&self) -> u32 {
        self.day_count.load(Ordering::Relaxed)
    }

    async fn check_should_fail(&self, operation: &str) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let transient = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if transient || self.should_fail.load(Ordering::Relaxed) {
            let kind = *lock(&self.fail_kind);
            return Err(match kind {
                FetchErrorKind::Timeout => Error::timeout(operation, Duration::from_millis(latency)),
                FetchErrorKind::Unreachable => Error::unreachable(&self.address, "mock failure"),
                FetchErrorKind::MalformedResponse => {
                    Error::MalformedResponse("mock failure".to_string())
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingFetcher for MockFetcher {
    fn address(&self) -> &str {
        &self.address
    }

    async fn fetch_realtime(&self) -> Result<RealtimeReadings> {
        self.realtime_count.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail("fetch_realtime").await?;
        let body = lock(&self.realtime_body).clone();
        Ok(RealtimeReadings::from_csv(&body)?)
    }

    async fn fetch_day(&self, date: Date) -> Result<Option<DailyLog>> {
        self.day_count.fetch_add(1, Ordering::Relaxed);
        self.check_should_fail(&day_log_name(date)).await?;
        let body = lock(&self.days).get(&date).cloned();
        match body {
            Some(body) => Ok(Some(DailyLog::from_csv(&body)?)),
            None => Ok(None),
        }
    }
}

/// Build a `realtime.csv` body with the given raw power and status fields.
///
/// Voltages and currents are zero; temperature is 25 °C.
#[must_use]
pub fn realtime_csv(power_raw: u32, status: u16) -> String {
    format!("0;0;0;0;0;0;0;0;0;0;0;{power_raw};2500;{status}")
}

/// Build a two-row day log whose last row reports `energy` kWh.
#[must_use]
pub fn daily_csv(date: Date, serial: &str, energy: f64) -> String {
    let day = day_log_name(date);
    let day = day.trim_end_matches(".csv");
    format!(
        "{MOCK_MODEL};{serial};{day};060000;0;0;0\r{MOCK_MODEL};{serial};{day};235000;{energy};0;0\r"
    )
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
