//! Trait abstraction over the inverter's web server.
//!
//! This module provides the [`ReadingFetcher`] trait that abstracts over the
//! real HTTP client and the mock fetcher used in tests.

use async_trait::async_trait;
use time::Date;

use kaco_types::{DailyLog, HistoricalEnergyPoint, RealtimeReadings};

use crate::error::Result;
use crate::history::{HistoryOptions, download_history};

/// Source of inverter readings bound to one device address.
///
/// Implementations report failures as [`crate::Error`] values whose
/// [`fetch_kind`](crate::Error::fetch_kind) is `Some`; they never panic on
/// bad input.
///
/// # Example
///
/// ```ignore
/// use kaco_core::{ReadingFetcher, Result};
///
/// async fn print_power<F: ReadingFetcher>(fetcher: &F) -> Result<()> {
///     let readings = fetcher.fetch_realtime().await?;
///     println!("{} W", readings.power);
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ReadingFetcher: Send + Sync {
    // --- Device Identity ---

    /// Host name or IP address of the inverter.
    fn address(&self) -> &str;

    // --- Telemetry ---

    /// Fetch and parse `realtime.csv`.
    async fn fetch_realtime(&self) -> Result<RealtimeReadings>;

    /// Fetch and parse the day log for `date`.
    ///
    /// Returns `Ok(None)` when the device has no log for that day.
    async fn fetch_day(&self, date: Date) -> Result<Option<DailyLog>>;

    // --- History ---

    /// Download the device's daily energy log in bulk as a cumulative series.
    ///
    /// The default implementation probes for the earliest available day and
    /// then requests one day log at a time, see [`download_history`].
    async fn fetch_daily(&self, options: &HistoryOptions) -> Result<Vec<HistoricalEnergyPoint>> {
        download_history(self, options).await
    }
}
