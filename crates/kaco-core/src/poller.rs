//! Two-cadence backoff poller for one inverter.
//!
//! A [`Poller`] owns the fast (realtime) and slow (day log) cadences of a
//! single device. Each call to [`Poller::poll`] performs one bounded fetch,
//! updates the [`LastKnownCache`] and the [`ConnectivityMachine`], and
//! returns the delay until the next attempt. Failures never propagate: the
//! outcome is reported and the cache keeps serving the last values.
//!
//! # Lock Ordering
//!
//! `poll` takes `connectivity` and `cache` (write) together, then `backoff`,
//! then `identity`, then `stats`, each released before the next is taken.
//! Holding `connectivity` and `cache` together keeps the cache's
//! connectivity mirror in step with the machine, and cancellation is
//! checked again under them so nothing is written after teardown. Fetches
//! run with no lock held, so cache readers never wait on the network.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kaco_types::{CadenceClass, Channel, DailyLog, DeviceIdentity, EntryId, RealtimeReadings};

use crate::backoff::{BackoffPolicy, BackoffState};
use crate::cache::{CachedReading, DEFAULT_GRACE_FACTOR, LastKnownCache};
use crate::connectivity::{ConnectivityMachine, ConnectivityState, Transition};
use crate::error::{Error, FetchErrorKind, Result};
use crate::events::{DeviceEvent, EventSender};
use crate::fetcher::ReadingFetcher;
use crate::history::device_today;

/// Failures logged at `warn` before dropping to `debug`.
const LOUD_FAILURES: u32 = 3;

/// Timing and debounce settings for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    pub fast_timeout: Duration,
    pub slow_timeout: Duration,
    /// Backoff cap as a multiple of the class interval.
    pub cap_factor: u32,
    /// Randomize failure delays by up to ±15%.
    pub jitter: bool,
    /// Consecutive fast failures before going offline.
    pub debounce_threshold: u32,
    /// Cache grace period as a multiple of the class interval.
    pub grace_factor: u32,
    /// Offset of the inverter's clock; selects today's day log.
    pub utc_offset: UtcOffset,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(20),
            slow_interval: Duration::from_secs(120),
            fast_timeout: Duration::from_secs(10),
            slow_timeout: Duration::from_secs(15),
            cap_factor: BackoffPolicy::DEFAULT_CAP_FACTOR,
            jitter: false,
            debounce_threshold: ConnectivityMachine::DEFAULT_THRESHOLD,
            grace_factor: DEFAULT_GRACE_FACTOR,
            utc_offset: UtcOffset::UTC,
        }
    }
}

impl PollerConfig {
    pub const MIN_FAST_INTERVAL: Duration = Duration::from_secs(5);
    pub const MIN_SLOW_INTERVAL: Duration = Duration::from_secs(30);

    /// Check interval floors and counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.fast_interval < Self::MIN_FAST_INTERVAL {
            return Err(Error::invalid_config(format!(
                "fast interval {:?} is below the {:?} floor",
                self.fast_interval,
                Self::MIN_FAST_INTERVAL
            )));
        }
        if self.slow_interval < Self::MIN_SLOW_INTERVAL {
            return Err(Error::invalid_config(format!(
                "slow interval {:?} is below the {:?} floor",
                self.slow_interval,
                Self::MIN_SLOW_INTERVAL
            )));
        }
        if self.fast_timeout.is_zero() || self.slow_timeout.is_zero() {
            return Err(Error::invalid_config("fetch timeouts must be non-zero"));
        }
        if self.debounce_threshold == 0 {
            return Err(Error::invalid_config("debounce threshold must be at least 1"));
        }
        Ok(())
    }

    pub fn interval(&self, class: CadenceClass) -> Duration {
        match class {
            CadenceClass::Fast => self.fast_interval,
            CadenceClass::Slow => self.slow_interval,
        }
    }

    pub fn timeout(&self, class: CadenceClass) -> Duration {
        match class {
            CadenceClass::Fast => self.fast_timeout,
            CadenceClass::Slow => self.slow_timeout,
        }
    }

    pub fn policy(&self, class: CadenceClass) -> BackoffPolicy {
        let policy = BackoffPolicy::new(self.interval(class)).cap_factor(self.cap_factor);
        if self.jitter {
            policy.jitter(BackoffPolicy::DEFAULT_JITTER)
        } else {
            policy
        }
    }
}

/// What a single poll produced.
#[derive(Debug, Clone)]
pub enum PollResult {
    Realtime(RealtimeReadings),
    /// `None` when the device answered but has no log for today yet.
    Daily(Option<DailyLog>),
    Failed {
        kind: FetchErrorKind,
        message: String,
    },
    /// The device is being torn down; nothing was written.
    Cancelled,
}

/// Result of one poll of one cadence class.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub class: CadenceClass,
    pub timestamp: OffsetDateTime,
    pub result: PollResult,
    /// Delay until the next attempt of this class.
    pub next_delay: Duration,
}

impl PollOutcome {
    fn cancelled(class: CadenceClass, timestamp: OffsetDateTime) -> Self {
        Self {
            class,
            timestamp,
            result: PollResult::Cancelled,
            next_delay: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result, PollResult::Realtime(_) | PollResult::Daily(_))
    }
}

/// Poll counters for one cadence class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassStats {
    pub polls: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub current_delay: Duration,
}

/// Poll counters for both cadence classes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub fast: ClassStats,
    pub slow: ClassStats,
}

impl PollStats {
    pub fn class(&self, class: CadenceClass) -> &ClassStats {
        match class {
            CadenceClass::Fast => &self.fast,
            CadenceClass::Slow => &self.slow,
        }
    }

    fn class_mut(&mut self, class: CadenceClass) -> &mut ClassStats {
        match class {
            CadenceClass::Fast => &mut self.fast,
            CadenceClass::Slow => &mut self.slow,
        }
    }
}

struct Backoff {
    fast: BackoffState,
    slow: BackoffState,
}

impl Backoff {
    fn class_mut(&mut self, class: CadenceClass) -> &mut BackoffState {
        match class {
            CadenceClass::Fast => &mut self.fast,
            CadenceClass::Slow => &mut self.slow,
        }
    }
}

/// Poller for one inverter.
pub struct Poller {
    entry_id: EntryId,
    fetcher: Arc<dyn ReadingFetcher>,
    config: PollerConfig,
    cache: Arc<RwLock<LastKnownCache>>,
    connectivity: Mutex<ConnectivityMachine>,
    backoff: Mutex<Backoff>,
    identity: Mutex<DeviceIdentity>,
    stats: Mutex<PollStats>,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("entry_id", &self.entry_id)
            .field("address", &self.fetcher.address())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Poller {
    pub fn new(entry_id: EntryId, fetcher: Arc<dyn ReadingFetcher>, config: PollerConfig) -> Self {
        let cache = LastKnownCache::new(
            config.fast_interval,
            config.slow_interval,
            config.grace_factor,
        );
        let backoff = Backoff {
            fast: BackoffState::new(&config.policy(CadenceClass::Fast)),
            slow: BackoffState::new(&config.policy(CadenceClass::Slow)),
        };
        Self {
            entry_id,
            fetcher,
            cache: Arc::new(RwLock::new(cache)),
            connectivity: Mutex::new(ConnectivityMachine::new(config.debounce_threshold)),
            backoff: Mutex::new(backoff),
            identity: Mutex::new(DeviceIdentity::default()),
            stats: Mutex::new(PollStats::default()),
            events: None,
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Identity known before the first poll (from configuration or registry).
    #[must_use]
    pub fn with_identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Mutex::new(identity);
        self
    }

    /// Publish events on `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Use `token` to tear the poller down.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    // --- Accessors ---

    pub fn entry_id(&self) -> &EntryId {
        &self.entry_id
    }

    pub fn fetcher(&self) -> &Arc<dyn ReadingFetcher> {
        &self.fetcher
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Shared cache; readers take the read lock only.
    pub fn cache(&self) -> &Arc<RwLock<LastKnownCache>> {
        &self.cache
    }

    pub async fn connectivity(&self) -> ConnectivityState {
        self.connectivity.lock().await.state()
    }

    pub async fn backoff_state(&self, class: CadenceClass) -> BackoffState {
        *self.backoff.lock().await.class_mut(class)
    }

    pub async fn stats(&self) -> PollStats {
        self.stats.lock().await.clone()
    }

    pub async fn identity(&self) -> DeviceIdentity {
        self.identity.lock().await.clone()
    }

    /// Cached readings for `channels`.
    pub async fn readings<I>(&self, channels: I) -> Vec<CachedReading>
    where
        I: IntoIterator<Item = Channel>,
    {
        self.cache.read().await.snapshot(channels)
    }

    // --- Polling ---

    /// Perform one bounded fetch for `class` and fold the result into the
    /// cache, connectivity machine, and backoff state.
    pub async fn poll(&self, class: CadenceClass) -> PollOutcome {
        let timeout = self.config.timeout(class);
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.fetch(class)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!("{class} poll"), timeout)),
            },
        };
        let timestamp = OffsetDateTime::now_utc();

        if self.cancel.is_cancelled() {
            return PollOutcome::cancelled(class, timestamp);
        }

        match fetched {
            Ok(result) => self.on_success(class, timestamp, result).await,
            Err(err) => self.on_failure(class, timestamp, err).await,
        }
    }

    async fn fetch(&self, class: CadenceClass) -> Result<PollResult> {
        match class {
            CadenceClass::Fast => Ok(PollResult::Realtime(self.fetcher.fetch_realtime().await?)),
            CadenceClass::Slow => {
                let today = device_today(self.config.utc_offset);
                Ok(PollResult::Daily(self.fetcher.fetch_day(today).await?))
            }
        }
    }

    async fn on_success(
        &self,
        class: CadenceClass,
        timestamp: OffsetDateTime,
        result: PollResult,
    ) -> PollOutcome {
        let transition = {
            let mut machine = self.connectivity.lock().await;
            let mut cache = self.cache.write().await;
            // Teardown may have happened while waiting for the locks
            if self.cancel.is_cancelled() {
                return PollOutcome::cancelled(class, timestamp);
            }
            let transition = machine.record(class, true);
            match &result {
                PollResult::Realtime(readings) => cache.apply_realtime(readings, timestamp),
                PollResult::Daily(Some(log)) => cache.apply_daily(log, timestamp),
                _ => {}
            }
            cache.set_connectivity(machine.state());
            transition
        };

        let policy = self.config.policy(class);
        let (next_delay, previous_failures) = {
            let mut backoff = self.backoff.lock().await;
            let state = backoff.class_mut(class);
            let previous = state.consecutive_failures;
            (state.record_success(&policy), previous)
        };

        if previous_failures > 0 {
            info!(
                "{} {} poll recovered after {} failures",
                self.entry_id, class, previous_failures
            );
        }

        if let PollResult::Daily(Some(log)) = &result {
            self.learn_identity(log).await;
        }

        {
            let mut stats = self.stats.lock().await;
            let stats = stats.class_mut(class);
            stats.polls += 1;
            stats.consecutive_failures = 0;
            stats.last_success = Some(timestamp);
            stats.current_delay = next_delay;
        }

        match &result {
            PollResult::Realtime(readings) => self.emit(DeviceEvent::Realtime {
                entry_id: self.entry_id.clone(),
                timestamp,
                readings: readings.clone(),
            }),
            PollResult::Daily(Some(log)) => self.emit(DeviceEvent::Daily {
                entry_id: self.entry_id.clone(),
                timestamp,
                log: log.clone(),
            }),
            _ => {}
        }
        self.emit_transition(transition);

        PollOutcome {
            class,
            timestamp,
            result,
            next_delay,
        }
    }

    async fn on_failure(&self, class: CadenceClass, timestamp: OffsetDateTime, err: Error) -> PollOutcome {
        let kind = err.fetch_kind().unwrap_or(FetchErrorKind::Unreachable);
        let message = err.to_string();
        let transition = {
            let mut machine = self.connectivity.lock().await;
            let mut cache = self.cache.write().await;
            if self.cancel.is_cancelled() {
                return PollOutcome::cancelled(class, timestamp);
            }
            let transition = machine.record(class, false);
            cache.mark_failure(class, timestamp);
            cache.set_connectivity(machine.state());
            transition
        };

        let policy = self.config.policy(class);
        let (next_delay, failures) = {
            let mut backoff = self.backoff.lock().await;
            let state = backoff.class_mut(class);
            let delay = state.record_failure(&policy);
            (delay, state.consecutive_failures)
        };

        if failures <= LOUD_FAILURES {
            warn!(
                "{} {} poll failed ({} in a row): {}, next attempt in {:?}",
                self.entry_id, class, failures, message, next_delay
            );
        } else {
            debug!(
                "{} {} poll failed ({} in a row): {}, next attempt in {:?}",
                self.entry_id, class, failures, message, next_delay
            );
        }

        {
            let mut stats = self.stats.lock().await;
            let stats = stats.class_mut(class);
            stats.polls += 1;
            stats.failures += 1;
            stats.consecutive_failures = failures;
            stats.last_failure = Some(timestamp);
            stats.last_error = Some(message.clone());
            stats.current_delay = next_delay;
        }

        self.emit(DeviceEvent::PollFailed {
            entry_id: self.entry_id.clone(),
            class,
            kind,
            consecutive_failures: failures,
        });
        self.emit_transition(transition);

        PollOutcome {
            class,
            timestamp,
            result: PollResult::Failed { kind, message },
            next_delay,
        }
    }

    async fn learn_identity(&self, log: &DailyLog) {
        if log.serial_number.is_empty() {
            return;
        }
        let mut identity = self.identity.lock().await;
        let serial_known = identity.serial_number.as_deref() == Some(log.serial_number.as_str());
        let model_known = identity.model.as_deref() == Some(log.model.as_str());
        if serial_known && model_known {
            return;
        }

        let previous_serial = identity
            .serial_number
            .replace(log.serial_number.clone())
            .filter(|prev| prev != &log.serial_number);
        identity.model = Some(log.model.clone());
        drop(identity);

        match &previous_serial {
            Some(prev) => warn!(
                "{} reports serial {} (was {})",
                self.entry_id, log.serial_number, prev
            ),
            None => info!(
                "{} identified as {} serial {}",
                self.entry_id, log.model, log.serial_number
            ),
        }

        self.emit(DeviceEvent::IdentityLearned {
            entry_id: self.entry_id.clone(),
            serial_number: log.serial_number.clone(),
            model: log.model.clone(),
            previous_serial,
        });
    }

    fn emit_transition(&self, transition: Option<Transition>) {
        if let Some(transition) = transition {
            info!(
                "{} is now {} (was {})",
                self.entry_id, transition.to, transition.from
            );
            self.emit(DeviceEvent::ConnectivityChanged {
                entry_id: self.entry_id.clone(),
                transition,
            });
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Some(sender) = &self.events {
            // Ignore error if no receivers
            let _ = sender.send(event);
        }
    }

    // --- Scheduling ---

    /// Start both cadence loops on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> PollerHandle {
        PollerHandle {
            fast: tokio::spawn(Arc::clone(self).run(CadenceClass::Fast)),
            slow: tokio::spawn(Arc::clone(self).run(CadenceClass::Slow)),
            cancel: self.cancel.clone(),
        }
    }

    async fn run(self: Arc<Self>, class: CadenceClass) {
        debug!("{} {} loop started", self.entry_id, class);
        while !self.cancel.is_cancelled() {
            let outcome = self.poll(class).await;
            if matches!(outcome.result, PollResult::Cancelled) {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(outcome.next_delay) => {}
            }
        }
        debug!("{} {} loop stopped", self.entry_id, class);
    }
}

/// Handles of a running poller's two loops.
#[derive(Debug)]
pub struct PollerHandle {
    fast: JoinHandle<()>,
    slow: JoinHandle<()>,
    cancel: CancellationToken,
}

impl PollerHandle {
    pub fn is_finished(&self) -> bool {
        self.fast.is_finished() && self.slow.is_finished()
    }

    /// Cancel both loops and any in-flight fetch, then wait for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in futures::future::join_all([self.fast, self.slow]).await {
            if let Err(e) = result {
                warn!("Poller task ended abnormally: {}", e);
            }
        }
    }
}
