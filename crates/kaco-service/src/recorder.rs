//! Turns poll events into long-term statistic points.
//!
//! Numeric realtime channels are kept as hourly means: every sample
//! rewrites the live point of the current hour. Energy is stored as a
//! cumulative series, the day's running total on top of the value at the
//! end of the previous day. That value is read from the store on every
//! write, so history imported meanwhile is picked up at once.

use std::collections::HashMap;

use time::{OffsetDateTime, Time, UtcOffset};
use tracing::debug;

use kaco_core::statistics::current_statistic_id;
use kaco_store::{Result, StatisticsStore};
use kaco_types::{CadenceClass, Channel, DailyLog, EntryId, RealtimeReadings, StatisticPoint};

#[derive(Debug, Clone, Copy)]
struct HourMean {
    start: OffsetDateTime,
    sum: f64,
    count: u32,
}

impl HourMean {
    fn mean(&self) -> f64 {
        self.sum / f64::from(self.count.max(1))
    }
}

/// Writes live statistic points for one device.
#[derive(Debug)]
pub struct StatisticsRecorder {
    entry_id: EntryId,
    channels: Vec<Channel>,
    utc_offset: UtcOffset,
    hours: HashMap<Channel, HourMean>,
}

impl StatisticsRecorder {
    /// Recorder for the numeric channels among `channels`.
    pub fn new(entry_id: EntryId, channels: &[Channel], utc_offset: UtcOffset) -> Self {
        Self {
            entry_id,
            channels: channels
                .iter()
                .copied()
                .filter(Channel::has_statistics)
                .collect(),
            utc_offset,
            hours: HashMap::new(),
        }
    }

    /// Fold a realtime snapshot into the hourly means.
    ///
    /// Returns the number of series written.
    pub fn record_realtime<S>(
        &mut self,
        store: &S,
        readings: &RealtimeReadings,
        timestamp: OffsetDateTime,
    ) -> Result<usize>
    where
        S: StatisticsStore + ?Sized,
    {
        let hour = hour_start(timestamp);
        let mut written = 0;

        for channel in &self.channels {
            if channel.cadence() != CadenceClass::Fast {
                continue;
            }
            let Some(value) = readings.value(*channel) else {
                continue;
            };

            let mean = self
                .hours
                .entry(*channel)
                .and_modify(|m| {
                    if m.start != hour {
                        *m = HourMean {
                            start: hour,
                            sum: 0.0,
                            count: 0,
                        };
                    }
                })
                .or_insert(HourMean {
                    start: hour,
                    sum: 0.0,
                    count: 0,
                });
            mean.sum += value.as_f64();
            mean.count += 1;

            let point = StatisticPoint::live(hour, mean.mean());
            store.write_points(
                &current_statistic_id(&self.entry_id, *channel),
                channel.unit(),
                &[point],
            )?;
            written += 1;
        }

        Ok(written)
    }

    /// Record the day's energy as a cumulative value.
    pub fn record_daily<S>(
        &self,
        store: &S,
        log: &DailyLog,
        timestamp: OffsetDateTime,
    ) -> Result<f64>
    where
        S: StatisticsStore + ?Sized,
    {
        let statistic_id = current_statistic_id(&self.entry_id, Channel::EnergyToday);
        let day = log
            .date
            .unwrap_or_else(|| timestamp.to_offset(self.utc_offset).date());

        let day_start = day.with_time(Time::MIDNIGHT).assume_offset(self.utc_offset);
        let base = store
            .point_before(&statistic_id, day_start)?
            .map_or(0.0, |p| p.value);
        debug!("{} energy base for {} is {} kWh", self.entry_id, day, base);

        let total = base + log.energy_today;
        store.write_points(
            &statistic_id,
            Channel::EnergyToday.unit(),
            &[StatisticPoint::live(hour_start(timestamp), total)],
        )?;
        Ok(total)
    }
}

/// Start of the UTC hour containing `timestamp`.
pub fn hour_start(timestamp: OffsetDateTime) -> OffsetDateTime {
    let utc = timestamp.to_offset(UtcOffset::UTC);
    utc - time::Duration::minutes(i64::from(utc.minute()))
        - time::Duration::seconds(i64::from(utc.second()))
        - time::Duration::nanoseconds(i64::from(utc.nanosecond()))
}
