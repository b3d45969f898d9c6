//! Bulk download of the inverter's daily energy log.
//!
//! The inverter keeps one `YYYYMMDD.csv` file per day but offers no index,
//! so the earliest available day has to be found by probing. Downloading is
//! a coarse probe backwards from today in fixed steps, a binary search
//! between the furthest hit and the next miss, then one request per day
//! with a pause in between so the embedded web server is not overwhelmed.

use std::sync::Arc;
use std::time::Duration;

use time::{Date, OffsetDateTime, UtcOffset};
use tokio::time::sleep;
use tracing::{debug, info};

use kaco_types::{DayEnergy, HistoricalEnergyPoint};

use crate::error::Result;
use crate::fetcher::ReadingFetcher;
use crate::retry::{RetryConfig, with_retry};

/// Phase of a history download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPhase {
    /// Looking for the earliest available day log.
    Probing,
    /// Requesting day logs one by one.
    Downloading,
}

/// Progress information for history downloads.
#[derive(Debug, Clone)]
pub struct HistoryProgress {
    pub phase: HistoryPhase,
    /// Requests completed in this phase.
    pub current: usize,
    /// Requests planned for this phase (an upper bound while probing).
    pub total: usize,
}

impl HistoryProgress {
    /// Fraction of the phase completed (0.0 to 1.0).
    #[must_use]
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.current as f32 / self.total as f32).min(1.0)
        }
    }
}

/// Type alias for progress callback function.
pub type ProgressCallback = Arc<dyn Fn(HistoryProgress) + Send + Sync>;

/// Options for downloading history.
#[derive(Clone)]
pub struct HistoryOptions {
    /// First day to download. If None, the earliest available day is probed.
    pub start: Option<Date>,
    /// Last day to download (inclusive). If None, today in `utc_offset`.
    pub end: Option<Date>,
    /// Offset of the inverter's clock, used to determine "today".
    pub utc_offset: UtcOffset,
    /// Step between coarse probes.
    pub probe_step_days: u16,
    /// How far back to probe.
    pub max_lookback_days: u16,
    /// Pause between consecutive requests.
    pub request_pause: Duration,
    /// Cumulative energy before the first downloaded day.
    pub base: f64,
    /// Retry policy for each request.
    pub retry: RetryConfig,
    /// Progress callback (optional).
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for HistoryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryOptions")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("utc_offset", &self.utc_offset)
            .field("probe_step_days", &self.probe_step_days)
            .field("max_lookback_days", &self.max_lookback_days)
            .field("request_pause", &self.request_pause)
            .field("base", &self.base)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            utc_offset: UtcOffset::UTC,
            probe_step_days: 180,
            max_lookback_days: 5 * 365,
            request_pause: Duration::from_secs(5),
            base: 0.0,
            retry: RetryConfig::for_history(),
            progress_callback: None,
        }
    }
}

impl HistoryOptions {
    /// Create new history options with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first day to download, skipping the probe.
    #[must_use]
    pub fn start(mut self, date: Date) -> Self {
        self.start = Some(date);
        self
    }

    /// Set the last day to download.
    #[must_use]
    pub fn end(mut self, date: Date) -> Self {
        self.end = Some(date);
        self
    }

    #[must_use]
    pub fn utc_offset(mut self, offset: UtcOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    /// Set the pause between requests.
    #[must_use]
    pub fn request_pause(mut self, pause: Duration) -> Self {
        self.request_pause = pause;
        self
    }

    #[must_use]
    pub fn probe_step_days(mut self, days: u16) -> Self {
        self.probe_step_days = days.max(1);
        self
    }

    #[must_use]
    pub fn max_lookback_days(mut self, days: u16) -> Self {
        self.max_lookback_days = days;
        self
    }

    /// Set the cumulative energy preceding the first day.
    #[must_use]
    pub fn base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set a progress callback.
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(HistoryProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Report progress if a callback is set.
    pub fn report_progress(&self, progress: &HistoryProgress) {
        if let Some(cb) = &self.progress_callback {
            cb(progress.clone());
        }
    }

    /// The last day to download.
    #[must_use]
    pub fn end_date(&self) -> Date {
        self.end.unwrap_or_else(|| device_today(self.utc_offset))
    }

    async fn pause(&self) {
        if !self.request_pause.is_zero() {
            sleep(self.request_pause).await;
        }
    }
}

/// Current date on the inverter's clock.
#[must_use]
pub fn device_today(offset: UtcOffset) -> Date {
    OffsetDateTime::now_utc().to_offset(offset).date()
}

/// Find the earliest day on or before `options.end_date()` with a day log.
///
/// Returns `Ok(None)` if no probe found a log. Assumes logs are contiguous
/// between the earliest day and today; missing days inside that range are
/// tolerated by [`download_days`].
pub async fn find_earliest_day<F>(fetcher: &F, options: &HistoryOptions) -> Result<Option<Date>>
where
    F: ReadingFetcher + ?Sized,
{
    let end = options.end_date();
    let step = u32::from(options.probe_step_days.max(1));
    let max = u32::from(options.max_lookback_days);
    let total = (max / step) as usize + 1;

    let mut furthest_hit: Option<u32> = None;
    let mut probes = 0usize;
    let mut offset = 0u32;
    while offset <= max {
        if probes > 0 {
            options.pause().await;
        }
        if has_log(fetcher, end, offset, options).await? {
            furthest_hit = Some(offset);
        }
        probes += 1;
        options.report_progress(&HistoryProgress {
            phase: HistoryPhase::Probing,
            current: probes,
            total,
        });
        offset += step;
    }

    let Some(mut lo) = furthest_hit else {
        debug!("No day logs found within {} days of {}", max, end);
        return Ok(None);
    };

    // `lo` has a log; `hi` is the first offset known to have none.
    let mut hi = (lo + step).min(max + 1);
    while hi - lo > 1 {
        options.pause().await;
        let mid = lo + (hi - lo) / 2;
        if has_log(fetcher, end, mid, options).await? {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(end.checked_sub(time::Duration::days(i64::from(lo))))
}

async fn has_log<F>(fetcher: &F, end: Date, offset: u32, options: &HistoryOptions) -> Result<bool>
where
    F: ReadingFetcher + ?Sized,
{
    let Some(date) = end.checked_sub(time::Duration::days(i64::from(offset))) else {
        return Ok(false);
    };
    let log = with_retry(&options.retry, "probe_day", || fetcher.fetch_day(date)).await?;
    debug!("Probe {}: {}", date, if log.is_some() { "hit" } else { "miss" });
    Ok(log.is_some())
}

/// Download the energy of each day from `from` to `to` inclusive.
///
/// Days without a log are skipped. A request that still fails after the
/// retry policy aborts the download with that error.
pub async fn download_days<F>(
    fetcher: &F,
    from: Date,
    to: Date,
    options: &HistoryOptions,
) -> Result<Vec<DayEnergy>>
where
    F: ReadingFetcher + ?Sized,
{
    if from > to {
        return Ok(Vec::new());
    }

    let total = ((to - from).whole_days() + 1) as usize;
    let mut days = Vec::with_capacity(total);
    let mut date = from;

    for index in 0..total {
        if index > 0 {
            options.pause().await;
        }

        let log = with_retry(&options.retry, "fetch_day", || fetcher.fetch_day(date)).await?;
        if let Some(log) = log {
            days.push(DayEnergy {
                date,
                energy: log.energy_today,
            });
        }

        let current = index + 1;
        options.report_progress(&HistoryProgress {
            phase: HistoryPhase::Downloading,
            current,
            total,
        });
        if current % 30 == 0 {
            info!("History download at {} ({}/{} days)", date, current, total);
        }

        match date.next_day() {
            Some(next) => date = next,
            None => break,
        }
    }

    Ok(days)
}

/// Download the full history as cumulative energy points.
///
/// Used by the default [`ReadingFetcher::fetch_daily`].
pub async fn download_history<F>(
    fetcher: &F,
    options: &HistoryOptions,
) -> Result<Vec<HistoricalEnergyPoint>>
where
    F: ReadingFetcher + ?Sized,
{
    let end = options.end_date();
    let start = match options.start {
        Some(start) => start,
        None => match find_earliest_day(fetcher, options).await? {
            Some(start) => start,
            None => return Ok(Vec::new()),
        },
    };

    info!(
        "Downloading history of {} from {} to {}",
        fetcher.address(),
        start,
        end
    );
    let days = download_days(fetcher, start, end, options).await?;
    Ok(HistoricalEnergyPoint::accumulate(&days, options.base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::date;

    fn fetcher_with_days(first: Date, last: Date, energy: f64) -> MockFetcher {
        let fetcher = MockFetcher::new("192.0.2.10");
        let mut date = first;
        while date <= last {
            fetcher.insert_day(date, energy);
            date = date.next_day().unwrap();
        }
        fetcher
    }

    #[test]
    fn test_history_options_default() {
        let options = HistoryOptions::default();
        assert_eq!(options.probe_step_days, 180);
        assert_eq!(options.max_lookback_days, 1825);
        assert_eq!(options.request_pause, Duration::from_secs(5));
        assert!(options.start.is_none());
    }

    #[test]
    fn test_history_options_debug_hides_callback() {
        let options = HistoryOptions::new().with_progress(|_| {});
        let debug = format!("{:?}", options);
        assert!(debug.contains("progress_callback: true"));
    }

    #[test]
    fn test_progress_fraction() {
        let progress = HistoryProgress {
            phase: HistoryPhase::Downloading,
            current: 5,
            total: 10,
        };
        assert!((progress.fraction() - 0.5).abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_earliest_day_refines_probe() {
        let end = date!(2026 - 03 - 01);
        let first = date!(2025 - 06 - 17);
        let fetcher = fetcher_with_days(first, end, 10.0);
        let options = HistoryOptions::new()
            .end(end)
            .probe_step_days(30)
            .max_lookback_days(400);

        let earliest = find_earliest_day(&fetcher, &options).await.unwrap();
        assert_eq!(earliest, Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_earliest_day_none() {
        let fetcher = MockFetcher::new("192.0.2.10");
        let options = HistoryOptions::new()
            .end(date!(2026 - 03 - 01))
            .max_lookback_days(360);

        assert_eq!(find_earliest_day(&fetcher, &options).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_earliest_day_respects_lookback() {
        let end = date!(2026 - 03 - 01);
        let fetcher = fetcher_with_days(date!(2020 - 01 - 01), end, 1.0);
        let options = HistoryOptions::new().end(end).max_lookback_days(100);

        let earliest = find_earliest_day(&fetcher, &options).await.unwrap();
        assert_eq!(earliest, Some(date!(2025 - 11 - 21)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_days_skips_missing() {
        let fetcher = MockFetcher::new("192.0.2.10");
        fetcher.insert_day(date!(2026 - 01 - 01), 4.0);
        fetcher.insert_day(date!(2026 - 01 - 03), 6.0);

        let days = download_days(
            &fetcher,
            date!(2026 - 01 - 01),
            date!(2026 - 01 - 03),
            &HistoryOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(days.len(), 2);
        assert_eq!(days[1].date, date!(2026 - 01 - 03));
        assert_eq!(fetcher.day_request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_history_accumulates() {
        let end = date!(2026 - 01 - 05);
        let fetcher = fetcher_with_days(date!(2026 - 01 - 01), end, 2.5);
        let progress = Arc::new(AtomicUsize::new(0));
        let seen = progress.clone();
        let options = HistoryOptions::new()
            .end(end)
            .base(100.0)
            .max_lookback_days(30)
            .with_progress(move |p| {
                if p.phase == HistoryPhase::Downloading {
                    seen.store(p.current, Ordering::SeqCst);
                }
            });

        let points = fetcher.fetch_daily(&options).await.unwrap();

        assert_eq!(points.len(), 5);
        assert_eq!(points[0].cumulative_energy, 102.5);
        assert_eq!(points[4].cumulative_energy, 112.5);
        assert_eq!(progress.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_aborts_on_persistent_failure() {
        let fetcher = fetcher_with_days(date!(2026 - 01 - 01), date!(2026 - 01 - 02), 1.0);
        fetcher.set_should_fail(true);
        let options = HistoryOptions::new().retry(RetryConfig::new(1).jitter(false));

        let result = download_days(
            &fetcher,
            date!(2026 - 01 - 01),
            date!(2026 - 01 - 02),
            &options,
        )
        .await;

        assert!(result.is_err());
    }
}
