//! Statistics reconciliation for one device.
//!
//! A run has four steps:
//!
//! 1. Discover legacy series: identifiers under `sensor.kaco_` whose middle
//!    part is not this device's entry id (and not another configured one).
//! 2. Merge every legacy point whose timestamp is missing from the current
//!    series, marked as imported. Existing points are never replaced.
//! 3. Import the device's day log history as a cumulative energy series,
//!    continuing from the last imported day. Live energy points recorded
//!    after the imported days are shifted onto the imported total.
//! 4. Delete the merged legacy series.
//!
//! Every step is keyed by timestamp, so re-running after a failure or a
//! cancellation picks up where the previous run stopped.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kaco_core::history::{HistoryOptions, device_today, download_days, find_earliest_day};
use kaco_core::statistics::{
    DEFAULT_REGRESSION_TOLERANCE, LegacySeries, STATISTIC_PREFIX, current_statistic_id,
    discover_legacy, history_points, merge_missing, segment_cumulative,
};
use kaco_core::ReadingFetcher;
use kaco_store::{DeviceRegistry, PointQuery, StatisticsStore};
use kaco_types::{Channel, EntryId, HistoricalEnergyPoint, PointOrigin, StatisticPoint};

/// Days requested per history chunk; progress is saved after each chunk.
pub const HISTORY_CHUNK_DAYS: i64 = 30;

/// What a reconciliation run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepairReport {
    /// Legacy series found.
    pub legacy_series: usize,
    /// Legacy points added to current series.
    pub points_merged: usize,
    /// Days imported from the device history.
    pub history_points: usize,
    /// Counter resets marked in the imported history.
    pub segments: usize,
    /// Live energy points shifted onto the imported total.
    pub live_rebased: usize,
    /// Legacy series deleted.
    pub legacy_deleted: usize,
    /// Whether every step finished.
    pub completed: bool,
    /// Why the history import stopped early, if it did.
    pub history_error: Option<String>,
}

/// Reconciliation errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RepairError {
    /// A store operation failed. Points written before the failure stay.
    #[error("Statistics store failed during reconciliation: {source}")]
    Store {
        source: kaco_store::Error,
        report: RepairReport,
    },
    #[error("Reconciliation is already running")]
    AlreadyRunning,
    #[error("Reconciliation cancelled")]
    Cancelled { report: RepairReport },
}

impl RepairError {
    /// Progress made before the error, if any.
    pub fn report(&self) -> Option<&RepairReport> {
        match self {
            RepairError::Store { report, .. } | RepairError::Cancelled { report } => Some(report),
            RepairError::AlreadyRunning => None,
        }
    }
}

/// Reconciles the statistics of one device.
pub struct Reconciler<S> {
    store: Arc<Mutex<S>>,
    fetcher: Option<Arc<dyn ReadingFetcher>>,
    entry_id: EntryId,
    options: HistoryOptions,
    tolerance: f64,
    cancel: CancellationToken,
}

impl<S> Reconciler<S>
where
    S: StatisticsStore + DeviceRegistry,
{
    /// A reconciler that only merges legacy series.
    pub fn new(store: Arc<Mutex<S>>, entry_id: EntryId) -> Self {
        Self {
            store,
            fetcher: None,
            entry_id,
            options: HistoryOptions::default(),
            tolerance: DEFAULT_REGRESSION_TOLERANCE,
            cancel: CancellationToken::new(),
        }
    }

    /// Also import the device history through `fetcher`.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ReadingFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_history_options(mut self, options: HistoryOptions) -> Self {
        self.options = options;
        self
    }

    /// Drop in kWh that marks a counter reset.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn entry_id(&self) -> &EntryId {
        &self.entry_id
    }

    /// Run all steps.
    ///
    /// A failed history download does not fail the run: the report is
    /// returned with `completed == false` and `history_error` set, legacy
    /// series are kept, and the device is not marked as migrated.
    pub async fn run(&self) -> Result<RepairReport, RepairError> {
        let mut report = RepairReport::default();
        info!("Reconciling statistics of {}", self.entry_id);

        let legacy = self.discover(&mut report).await?;
        for series in &legacy {
            self.check_cancelled(&report)?;
            self.merge_series(series, &mut report).await?;
        }

        if let Some(fetcher) = &self.fetcher {
            self.import_history(fetcher.as_ref(), &mut report).await?;
        }

        if report.history_error.is_some() {
            warn!(
                "Reconciliation of {} stopped early: {} legacy series kept",
                self.entry_id,
                legacy.len()
            );
            return Ok(report);
        }

        self.check_cancelled(&report)?;
        let store = self.store.lock().await;
        for series in &legacy {
            store
                .delete_series(&series.statistic_id)
                .map_err(|source| store_error(source, &report))?;
            report.legacy_deleted += 1;
        }
        store
            .set_migrated(&self.entry_id, OffsetDateTime::now_utc())
            .map_err(|source| store_error(source, &report))?;
        report.completed = true;

        info!(
            "Reconciled {}: {} legacy series, {} points merged, {} history points, {} segments",
            self.entry_id,
            report.legacy_series,
            report.points_merged,
            report.history_points,
            report.segments
        );
        Ok(report)
    }

    async fn discover(&self, report: &mut RepairReport) -> Result<Vec<LegacySeries>, RepairError> {
        let store = self.store.lock().await;
        let series = store
            .list_series(STATISTIC_PREFIX)
            .map_err(|source| store_error(source, report))?;
        let others: Vec<EntryId> = store
            .entry_ids()
            .map_err(|source| store_error(source, report))?
            .into_iter()
            .filter(|id| id != &self.entry_id)
            .collect();

        let legacy: Vec<LegacySeries> = discover_legacy(
            &self.entry_id,
            series.iter().map(|s| s.statistic_id.as_str()),
            &others,
        )
        .into_iter()
        .filter(|s| s.channel.has_statistics())
        .collect();

        report.legacy_series = legacy.len();
        if !legacy.is_empty() {
            info!("Found {} legacy series for {}", legacy.len(), self.entry_id);
        }
        Ok(legacy)
    }

    async fn merge_series(
        &self,
        series: &LegacySeries,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let current_id = current_statistic_id(&self.entry_id, series.channel);
        let store = self.store.lock().await;

        let legacy_points = store
            .query_points(&PointQuery::new(series.statistic_id.as_str()))
            .map_err(|source| store_error(source, report))?;
        let current_points = store
            .query_points(&PointQuery::new(current_id.as_str()))
            .map_err(|source| store_error(source, report))?;

        let missing = merge_missing(&current_points, &legacy_points);
        if missing.is_empty() {
            return Ok(());
        }

        let summary = store
            .write_points(&current_id, series.channel.unit(), &missing)
            .map_err(|source| store_error(source, report))?;
        info!(
            "Merged {} points from {} into {}",
            summary.inserted, series.statistic_id, current_id
        );
        report.points_merged += summary.inserted;
        Ok(())
    }

    async fn import_history(
        &self,
        fetcher: &dyn ReadingFetcher,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let Some(end) = device_today(self.options.utc_offset).previous_day() else {
            return Ok(());
        };

        let state = {
            let store = self.store.lock().await;
            store
                .repair_state(&self.entry_id)
                .map_err(|source| store_error(source, report))?
        };

        let start = match state.history_imported_until {
            Some(until) => match until.next_day() {
                Some(next) => next,
                None => return Ok(()),
            },
            None => {
                let probe = self.options.clone().end(end);
                match self.cancellable(report, find_earliest_day(fetcher, &probe)).await? {
                    Ok(Some(first)) => first,
                    Ok(None) => {
                        info!("{} has no day logs to import", self.entry_id);
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("History probe of {} failed: {}", self.entry_id, e);
                        report.history_error = Some(e.to_string());
                        return Ok(());
                    }
                }
            }
        };
        if start > end {
            return Ok(());
        }

        info!("Importing history of {} from {} to {}", self.entry_id, start, end);
        let statistic_id = current_statistic_id(&self.entry_id, Channel::EnergyToday);
        let mut cumulative = state.history_cumulative;
        let mut chunk_start = start;

        loop {
            self.check_cancelled(report)?;
            let chunk_end = chunk_last_day(chunk_start, end);

            let days = match self
                .cancellable(report, download_days(fetcher, chunk_start, chunk_end, &self.options))
                .await?
            {
                Ok(days) => days,
                Err(e) => {
                    warn!(
                        "History download of {} failed at {}: {}",
                        self.entry_id, chunk_start, e
                    );
                    report.history_error = Some(e.to_string());
                    return Ok(());
                }
            };

            let history = HistoricalEnergyPoint::accumulate(&days, cumulative);
            let mut points = history_points(&history);

            if let Some(last) = history.last() {
                cumulative = last.cumulative_energy;
            }
            self.write_history(&statistic_id, &mut points, chunk_end, cumulative, report)
                .await?;

            match chunk_end.next_day() {
                Some(next) if next <= end => chunk_start = next,
                _ => break,
            }
        }

        Ok(())
    }

    async fn write_history(
        &self,
        statistic_id: &str,
        points: &mut [StatisticPoint],
        until: Date,
        cumulative: f64,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let store = self.store.lock().await;
        if let (Some(first), Some(last)) = (points.first(), points.last()) {
            let (first_start, last_start) = (first.start, last.start);
            let previous = store
                .point_before(statistic_id, first_start)
                .map_err(|source| store_error(source, report))?
                .map(|p| p.value);
            report.segments += segment_cumulative(points, previous, self.tolerance);

            // Live energy after the chunk was recorded on top of whatever
            // preceded it; the import changes that value.
            let later = live_after(&*store, statistic_id, last_start)
                .map_err(|source| store_error(source, report))?;
            let old_base = base_of(&*store, statistic_id, &later)
                .map_err(|source| store_error(source, report))?;

            let summary = store
                .write_points(statistic_id, Channel::EnergyToday.unit(), points)
                .map_err(|source| store_error(source, report))?;
            report.history_points += summary.inserted;

            let new_base = base_of(&*store, statistic_id, &later)
                .map_err(|source| store_error(source, report))?;
            if let (Some(old), Some(new)) = (old_base, new_base)
                && (new - old).abs() > f64::EPSILON
            {
                let shifted: Vec<StatisticPoint> = later
                    .iter()
                    .map(|p| StatisticPoint {
                        value: p.value + (new - old),
                        ..*p
                    })
                    .collect();
                store
                    .write_points(statistic_id, Channel::EnergyToday.unit(), &shifted)
                    .map_err(|source| store_error(source, report))?;
                info!(
                    "Shifted {} live energy points of {} by {:.3} kWh",
                    shifted.len(),
                    self.entry_id,
                    new - old
                );
                report.live_rebased += shifted.len();
            }
        }
        store
            .set_history_progress(&self.entry_id, until, cumulative)
            .map_err(|source| store_error(source, report))
    }

    fn check_cancelled(&self, report: &RepairReport) -> Result<(), RepairError> {
        if self.cancel.is_cancelled() {
            return Err(RepairError::Cancelled {
                report: report.clone(),
            });
        }
        Ok(())
    }

    async fn cancellable<F, T>(&self, report: &RepairReport, future: F) -> Result<T, RepairError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RepairError::Cancelled { report: report.clone() }),
            output = future => Ok(output),
        }
    }
}

fn live_after<S>(store: &S, statistic_id: &str, after: OffsetDateTime) -> kaco_store::Result<Vec<StatisticPoint>>
where
    S: StatisticsStore + ?Sized,
{
    let points = store.query_points(
        &PointQuery::new(statistic_id)
            .since(after)
            .origin(PointOrigin::Live),
    )?;
    Ok(points.into_iter().filter(|p| p.start > after).collect())
}

/// Value the first of `points` was recorded on top of; `None` without points.
fn base_of<S>(store: &S, statistic_id: &str, points: &[StatisticPoint]) -> kaco_store::Result<Option<f64>>
where
    S: StatisticsStore + ?Sized,
{
    let Some(first) = points.first() else {
        return Ok(None);
    };
    Ok(Some(
        store
            .point_before(statistic_id, first.start)?
            .map_or(0.0, |p| p.value),
    ))
}

fn chunk_last_day(start: Date, end: Date) -> Date {
    start
        .checked_add(time::Duration::days(HISTORY_CHUNK_DAYS - 1))
        .map_or(end, |last| last.min(end))
}

fn store_error(source: kaco_store::Error, report: &RepairReport) -> RepairError {
    RepairError::Store {
        source,
        report: report.clone(),
    }
}

/// Where the last reconciliation of a device stands.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RepairStatus {
    #[default]
    Idle,
    Running {
        #[serde(with = "time::serde::rfc3339")]
        started_at: OffsetDateTime,
    },
    Completed {
        #[serde(with = "time::serde::rfc3339")]
        finished_at: OffsetDateTime,
        report: RepairReport,
    },
    Failed {
        #[serde(with = "time::serde::rfc3339")]
        finished_at: OffsetDateTime,
        error: String,
        report: Option<RepairReport>,
    },
}

impl RepairStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RepairStatus::Running { .. })
    }

    fn finished(result: Result<RepairReport, RepairError>) -> Self {
        let finished_at = OffsetDateTime::now_utc();
        match result {
            Ok(report) if report.completed => RepairStatus::Completed {
                finished_at,
                report,
            },
            Ok(report) => RepairStatus::Failed {
                finished_at,
                error: report
                    .history_error
                    .clone()
                    .unwrap_or_else(|| "reconciliation did not complete".to_string()),
                report: Some(report),
            },
            Err(e) => RepairStatus::Failed {
                finished_at,
                error: e.to_string(),
                report: e.report().cloned(),
            },
        }
    }
}

/// Runs at most one reconciliation per device in the background.
#[derive(Default)]
pub struct RepairTracker {
    status: Arc<Mutex<RepairStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RepairTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self) -> RepairStatus {
        self.status.lock().await.clone()
    }

    /// Start `reconciler` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RepairError::AlreadyRunning`] if a run is in progress.
    pub async fn start<S>(&self, reconciler: Reconciler<S>) -> Result<(), RepairError>
    where
        S: StatisticsStore + DeviceRegistry + 'static,
    {
        {
            let mut status = self.status.lock().await;
            if status.is_running() {
                return Err(RepairError::AlreadyRunning);
            }
            *status = RepairStatus::Running {
                started_at: OffsetDateTime::now_utc(),
            };
        }

        let status = Arc::clone(&self.status);
        let handle = tokio::spawn(async move {
            let result = reconciler.run().await;
            if let Err(e) = &result {
                warn!("Reconciliation of {} failed: {}", reconciler.entry_id(), e);
            }
            *status.lock().await = RepairStatus::finished(result);
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Wait for the current run, if any, to finish.
    pub async fn wait(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Reconciliation task failed: {}", e);
        }
    }
}
