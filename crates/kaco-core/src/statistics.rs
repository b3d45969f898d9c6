//! Statistics reconciliation algorithms.
//!
//! Pure functions used by the repair operation:
//!
//! - identifier scheme and legacy-series discovery
//! - timestamp-keyed merge of a legacy series into the current one
//! - conversion of the device's daily history into statistic points
//! - segmentation of cumulative series at counter resets
//!
//! Nothing here touches storage; the service applies the results.

use std::collections::BTreeSet;

use time::macros::time;
use time::OffsetDateTime;

use kaco_types::{Channel, EntryId, HistoricalEnergyPoint, PointOrigin, StatisticPoint};

/// Prefix shared by every statistic identifier this integration has used.
pub const STATISTIC_PREFIX: &str = "sensor.kaco_";

/// Default drop in a cumulative series treated as a counter reset, in kWh.
pub const DEFAULT_REGRESSION_TOLERANCE: f64 = 0.5;

/// Identifier of the current series for `channel` of `entry_id`.
///
/// ```
/// use kaco_core::statistics::current_statistic_id;
/// use kaco_types::{Channel, EntryId};
///
/// let id = current_statistic_id(&EntryId::new("entry9f2"), Channel::Power);
/// assert_eq!(id, "sensor.kaco_entry9f2_power");
/// ```
pub fn current_statistic_id(entry_id: &EntryId, channel: Channel) -> String {
    format!("{STATISTIC_PREFIX}{}_{}", entry_id, channel.key())
}

/// Channel of a legacy series belonging to `entry_id`, if `statistic_id` is one.
///
/// A legacy identifier is `sensor.kaco_<middle>_<key>` with an optional
/// numeric duplicate suffix, where `<key>` is any spelling of a channel key
/// and the identifier is not the current one. Series whose middle part is
/// the entry id of another configured device belong to that device.
pub fn legacy_channel(
    statistic_id: &str,
    entry_id: &EntryId,
    other_entries: &[EntryId],
) -> Option<Channel> {
    let rest = statistic_id.strip_prefix(STATISTIC_PREFIX)?;

    let mut candidates = vec![rest];
    if let Some((head, tail)) = rest.rsplit_once('_')
        && !tail.is_empty()
        && tail.bytes().all(|b| b.is_ascii_digit())
    {
        candidates.push(head);
    }

    let keys = keys_longest_first();
    for candidate in candidates {
        for (key, channel) in &keys {
            let Some(middle) = candidate
                .strip_suffix(key.as_str())
                .and_then(|m| m.strip_suffix('_'))
            else {
                continue;
            };
            if middle.is_empty() {
                continue;
            }
            if other_entries.iter().any(|other| other.as_str() == middle) {
                return None;
            }
            if statistic_id == current_statistic_id(entry_id, *channel) {
                return None;
            }
            return Some(*channel);
        }
    }
    None
}

fn keys_longest_first() -> Vec<(String, Channel)> {
    let mut keys: Vec<(String, Channel)> = Channel::ALL
        .into_iter()
        .flat_map(|c| c.identifier_keys().into_iter().map(move |k| (k, c)))
        .collect();
    keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    keys
}

/// A legacy series found in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LegacySeries {
    pub statistic_id: String,
    pub channel: Channel,
}

/// Legacy series among `statistic_ids`, sorted by identifier.
pub fn discover_legacy<'a, I>(
    entry_id: &EntryId,
    statistic_ids: I,
    other_entries: &[EntryId],
) -> Vec<LegacySeries>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut found: Vec<LegacySeries> = statistic_ids
        .into_iter()
        .filter_map(|id| {
            legacy_channel(id, entry_id, other_entries).map(|channel| LegacySeries {
                statistic_id: id.to_string(),
                channel,
            })
        })
        .collect();
    found.sort();
    found.dedup();
    found
}

/// A legacy series paired with the current series it merges into.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsSeriesRef {
    pub legacy_identifier: Option<String>,
    pub current_identifier: String,
    /// Points ordered by `start`.
    pub points: Vec<StatisticPoint>,
}

/// Legacy points whose timestamp is absent from `current`, marked imported.
///
/// Duplicate timestamps inside `legacy` keep the first occurrence. The
/// result is ordered by `start`.
pub fn merge_missing(current: &[StatisticPoint], legacy: &[StatisticPoint]) -> Vec<StatisticPoint> {
    let mut taken: BTreeSet<OffsetDateTime> = current.iter().map(|p| p.start).collect();
    let mut missing: Vec<StatisticPoint> = legacy
        .iter()
        .filter(|p| taken.insert(p.start))
        .map(|p| StatisticPoint {
            origin: PointOrigin::Imported,
            ..*p
        })
        .collect();
    missing.sort_by_key(|p| p.start);
    missing
}

/// `current` plus the missing legacy points, ordered by `start`.
///
/// Points already in `current` are never replaced, so live data wins and
/// merging the result again with the same legacy series changes nothing.
pub fn merge(current: &[StatisticPoint], legacy: &[StatisticPoint]) -> Vec<StatisticPoint> {
    let mut merged = current.to_vec();
    merged.extend(merge_missing(current, legacy));
    merged.sort_by_key(|p| p.start);
    merged
}

/// Imported statistic points for a device history, one per day at 12:00 UTC.
pub fn history_points(history: &[HistoricalEnergyPoint]) -> Vec<StatisticPoint> {
    history
        .iter()
        .map(|h| StatisticPoint::imported(h.date.with_time(time!(12:00)).assume_utc(), h.cumulative_energy))
        .collect()
}

/// Mark counter resets in a cumulative series.
///
/// `previous` is the value preceding `points[0]` in the stored series. A
/// drop larger than `tolerance` starts a new segment (`segment_start`); the
/// value is kept as reported, never interpolated. Smaller drops on imported
/// points are treated as noise and clamped to the previous value. Returns
/// the number of segment starts marked.
pub fn segment_cumulative(
    points: &mut [StatisticPoint],
    previous: Option<f64>,
    tolerance: f64,
) -> usize {
    let mut prev = previous;
    let mut resets = 0;

    for point in points.iter_mut() {
        if let Some(p) = prev {
            let drop = p - point.value;
            if drop > tolerance {
                point.segment_start = true;
                resets += 1;
            } else if drop > 0.0 && point.origin == PointOrigin::Imported {
                point.value = p;
            }
        }
        prev = Some(point.value);
    }
    resets
}

/// Number of monotonic segments in a series.
pub fn count_segments(points: &[StatisticPoint]) -> usize {
    if points.is_empty() {
        return 0;
    }
    1 + points.iter().skip(1).filter(|p| p.segment_start).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::{date, datetime};

    fn entry() -> EntryId {
        EntryId::new("entry9f2")
    }

    fn day(n: u8) -> OffsetDateTime {
        date!(2026 - 01 - 01)
            .replace_day(n)
            .unwrap()
            .with_time(time!(12:00))
            .assume_utc()
    }

    fn live(n: u8, value: f64) -> StatisticPoint {
        StatisticPoint::live(day(n), value)
    }

    #[test]
    fn test_legacy_channel_patterns() {
        let entry = entry();
        assert_eq!(
            legacy_channel("sensor.kaco_12345_power", &entry, &[]),
            Some(Channel::Power)
        );
        assert_eq!(
            legacy_channel("sensor.kaco_pv_roof_current_power_2", &entry, &[]),
            Some(Channel::Power)
        );
        assert_eq!(
            legacy_channel("sensor.kaco_12345_energytoday", &entry, &[]),
            Some(Channel::EnergyToday)
        );
        assert_eq!(
            legacy_channel("sensor.kaco_12345_generator_voltage1", &entry, &[]),
            Some(Channel::GeneratorVoltage1)
        );
        assert_eq!(
            legacy_channel("sensor.kaco_12345_generator_voltage1_3", &entry, &[]),
            Some(Channel::GeneratorVoltage1)
        );
    }

    #[test]
    fn test_current_and_foreign_are_not_legacy() {
        let entry = entry();
        assert_eq!(legacy_channel("sensor.kaco_entry9f2_power", &entry, &[]), None);
        assert_eq!(
            legacy_channel("sensor.kaco_other1_power", &entry, &[EntryId::new("other1")]),
            None
        );
        assert_eq!(legacy_channel("sensor.kaco_power", &entry, &[]), None);
        assert_eq!(legacy_channel("sensor.solar_12345_power", &entry, &[]), None);
        assert_eq!(legacy_channel("sensor.kaco_12345_humidity", &entry, &[]), None);
    }

    #[test]
    fn test_duplicate_of_current_is_legacy() {
        assert_eq!(
            legacy_channel("sensor.kaco_entry9f2_power_2", &entry(), &[]),
            Some(Channel::Power)
        );
    }

    #[test]
    fn test_discover_legacy_sorted() {
        let ids = [
            "sensor.kaco_entry9f2_power",
            "sensor.kaco_12345_power",
            "sensor.kaco_12345_energy_today",
            "sensor.other_thing",
        ];
        let found = discover_legacy(&entry(), ids, &[]);
        assert_eq!(
            found,
            vec![
                LegacySeries {
                    statistic_id: "sensor.kaco_12345_energy_today".into(),
                    channel: Channel::EnergyToday
                },
                LegacySeries {
                    statistic_id: "sensor.kaco_12345_power".into(),
                    channel: Channel::Power
                },
            ]
        );
    }

    #[test]
    fn test_merge_fills_gaps_only() {
        let legacy: Vec<_> = (1..=5).map(|d| live(d, f64::from(d) * 100.0)).collect();
        let current: Vec<_> = (3..=7).map(|d| live(d, f64::from(d))).collect();

        let merged = merge(&current, &legacy);

        assert_eq!(merged.len(), 7);
        for point in &merged[..2] {
            assert_eq!(point.origin, PointOrigin::Imported);
        }
        assert_eq!(merged[0].value, 100.0);
        assert_eq!(&merged[2..], &current[..]);
    }

    #[test]
    fn test_merge_missing_dedups_legacy() {
        let legacy = vec![live(1, 1.0), live(1, 2.0)];
        let missing = merge_missing(&[], &legacy);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].value, 1.0);
    }

    #[test]
    fn test_history_points_at_noon_utc() {
        let history = [HistoricalEnergyPoint {
            date: date!(2026 - 02 - 22),
            cumulative_energy: 42.0,
        }];
        let points = history_points(&history);
        assert_eq!(points[0].start, datetime!(2026 - 02 - 22 12:00 UTC));
        assert_eq!(points[0].origin, PointOrigin::Imported);
    }

    #[test]
    fn test_regression_starts_new_segment() {
        let mut points: Vec<_> = [490.0, 500.0, 510.0, 60.0, 70.0]
            .iter()
            .enumerate()
            .map(|(i, &v)| StatisticPoint::imported(day(i as u8 + 1), v))
            .collect();

        let resets = segment_cumulative(&mut points, None, DEFAULT_REGRESSION_TOLERANCE);

        assert_eq!(resets, 1);
        assert!(points[3].segment_start);
        assert_eq!(points[3].value, 60.0);
        assert_eq!(count_segments(&points), 2);
    }

    #[test]
    fn test_small_regression_clamped() {
        let mut points = vec![
            StatisticPoint::imported(day(1), 100.0),
            StatisticPoint::imported(day(2), 99.8),
            StatisticPoint::imported(day(3), 101.0),
        ];
        let resets = segment_cumulative(&mut points, Some(95.0), 0.5);
        assert_eq!(resets, 0);
        assert_eq!(points[1].value, 100.0);
        assert_eq!(count_segments(&points), 1);
    }

    #[test]
    fn test_previous_value_starts_segment() {
        let mut points = vec![StatisticPoint::imported(day(1), 3.0)];
        assert_eq!(segment_cumulative(&mut points, Some(900.0), 0.5), 1);
        assert!(points[0].segment_start);
    }

    fn points_strategy() -> impl Strategy<Value = Vec<StatisticPoint>> {
        proptest::collection::vec((1u8..=28, 0.0f64..1000.0, any::<bool>()), 0..28).prop_map(
            |raw| {
                raw.into_iter()
                    .map(|(d, v, is_live)| {
                        if is_live {
                            StatisticPoint::live(day(d), v)
                        } else {
                            StatisticPoint::imported(day(d), v)
                        }
                    })
                    .collect()
            },
        )
    }

    fn dedup_by_start(mut points: Vec<StatisticPoint>) -> Vec<StatisticPoint> {
        points.sort_by_key(|p| p.start);
        points.dedup_by_key(|p| p.start);
        points
    }

    proptest! {
        #[test]
        fn prop_merge_idempotent(current in points_strategy(), legacy in points_strategy()) {
            let current = dedup_by_start(current);
            let once = merge(&current, &legacy);
            let twice = merge(&once, &legacy);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_merge_never_overwrites_current(current in points_strategy(), legacy in points_strategy()) {
            let current = dedup_by_start(current);
            let merged = merge(&current, &legacy);
            for point in &current {
                let at: Vec<_> = merged.iter().filter(|p| p.start == point.start).collect();
                prop_assert_eq!(at.len(), 1);
                prop_assert_eq!(at[0], point);
            }
        }
    }
}
