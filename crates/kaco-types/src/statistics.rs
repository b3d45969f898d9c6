//! Long-term statistic points and series.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::channel::Unit;

/// Where a statistic point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PointOrigin {
    /// Recorded from live polling.
    Live,
    /// Copied from a legacy series or reconstructed from device history.
    Imported,
}

/// One hourly (or daily, for imported history) statistic value.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatisticPoint {
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub start: OffsetDateTime,
    pub value: f64,
    pub origin: PointOrigin,
    /// Marks a discontinuity in a cumulative series, e.g. after a device
    /// replacement reset its counter.
    #[cfg_attr(feature = "serde", serde(default))]
    pub segment_start: bool,
}

impl StatisticPoint {
    #[must_use]
    pub fn live(start: OffsetDateTime, value: f64) -> Self {
        Self {
            start,
            value,
            origin: PointOrigin::Live,
            segment_start: false,
        }
    }

    #[must_use]
    pub fn imported(start: OffsetDateTime, value: f64) -> Self {
        Self {
            start,
            value,
            origin: PointOrigin::Imported,
            segment_start: false,
        }
    }
}

/// A named statistics series with its points ordered by `start`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatisticsSeries {
    pub statistic_id: String,
    pub unit: Unit,
    pub points: Vec<StatisticPoint>,
}
