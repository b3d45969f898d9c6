//! Last-known value per channel.
//!
//! Values are replaced only by a successful poll of their own channel and
//! are never cleared by failures. Once a value is older than
//! `grace_factor` times its channel's polling interval it is reported as
//! [`Quality::Stale`], but it is still returned.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use kaco_types::{CadenceClass, Channel, ChannelValue, DailyLog, Quality, RealtimeReadings, Reading};

use crate::connectivity::ConnectivityState;

/// Default grace period as a multiple of the polling interval.
pub const DEFAULT_GRACE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: ChannelValue,
    timestamp: OffsetDateTime,
    received_at: Instant,
}

/// A cached reading with its age.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedReading {
    #[serde(flatten)]
    pub reading: Reading,
    pub age: Duration,
}

/// Most recent successful reading per channel, plus a connectivity mirror.
#[derive(Debug, Clone)]
pub struct LastKnownCache {
    entries: HashMap<Channel, CacheEntry>,
    fast_interval: Duration,
    slow_interval: Duration,
    grace_factor: u32,
    peak_power: Option<f64>,
    connectivity: ConnectivityState,
    last_failure: HashMap<CadenceClass, OffsetDateTime>,
}

impl LastKnownCache {
    pub fn new(fast_interval: Duration, slow_interval: Duration, grace_factor: u32) -> Self {
        Self {
            entries: HashMap::new(),
            fast_interval,
            slow_interval,
            grace_factor: grace_factor.max(1),
            peak_power: None,
            connectivity: ConnectivityState::Offline,
            last_failure: HashMap::new(),
        }
    }

    /// Age after which a channel's value is stale.
    pub fn grace_period(&self, channel: Channel) -> Duration {
        let interval = match channel.cadence() {
            CadenceClass::Fast => self.fast_interval,
            CadenceClass::Slow => self.slow_interval,
        };
        interval.saturating_mul(self.grace_factor)
    }

    /// Store a successful reading for `channel`.
    pub fn update(&mut self, channel: Channel, value: ChannelValue, timestamp: OffsetDateTime) {
        self.update_at(channel, value, timestamp, Instant::now());
    }

    /// Like [`update`](Self::update) with an explicit receive instant.
    pub fn update_at(
        &mut self,
        channel: Channel,
        value: ChannelValue,
        timestamp: OffsetDateTime,
        received_at: Instant,
    ) {
        if channel == Channel::Power {
            let power = value.as_f64();
            self.peak_power = Some(self.peak_power.map_or(power, |peak| peak.max(power)));
        }
        self.entries.insert(
            channel,
            CacheEntry {
                value,
                timestamp,
                received_at,
            },
        );
    }

    /// Store every channel of a realtime snapshot.
    pub fn apply_realtime(&mut self, readings: &RealtimeReadings, timestamp: OffsetDateTime) {
        let now = Instant::now();
        for (channel, value) in readings.channel_values() {
            self.update_at(channel, value, timestamp, now);
        }
    }

    /// Store the slow-cadence channels of a day log.
    pub fn apply_daily(&mut self, log: &DailyLog, timestamp: OffsetDateTime) {
        self.update(
            Channel::EnergyToday,
            ChannelValue::Number(log.energy_today),
            timestamp,
        );
    }

    /// Note a failed poll. Cached values are left untouched.
    pub fn mark_failure(&mut self, class: CadenceClass, timestamp: OffsetDateTime) {
        self.last_failure.insert(class, timestamp);
    }

    /// Time of the most recent failure of `class`, if any.
    pub fn last_failure(&self, class: CadenceClass) -> Option<OffsetDateTime> {
        self.last_failure.get(&class).copied()
    }

    pub fn get(&self, channel: Channel) -> Option<CachedReading> {
        self.get_at(channel, Instant::now())
    }

    /// Cached reading for `channel` as seen at `now`.
    pub fn get_at(&self, channel: Channel, now: Instant) -> Option<CachedReading> {
        let entry = self.entries.get(&channel)?;
        let age = now.saturating_duration_since(entry.received_at);
        let quality = if age > self.grace_period(channel) {
            Quality::Stale
        } else {
            Quality::Fresh
        };
        Some(CachedReading {
            reading: Reading {
                channel,
                value: entry.value,
                timestamp: entry.timestamp,
                quality,
            },
            age,
        })
    }

    /// Cached readings for `channels`, skipping channels never seen.
    pub fn snapshot<I>(&self, channels: I) -> Vec<CachedReading>
    where
        I: IntoIterator<Item = Channel>,
    {
        let now = Instant::now();
        channels
            .into_iter()
            .filter_map(|c| self.get_at(c, now))
            .collect()
    }

    /// Highest AC power seen since start.
    pub fn peak_power(&self) -> Option<f64> {
        self.peak_power
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn set_connectivity(&mut self, state: ConnectivityState) {
        self.connectivity = state;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
