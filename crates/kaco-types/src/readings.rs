//! Parsing of the inverter's CSV endpoints and the normalized reading shapes.
//!
//! The inverter serves two documents:
//!
//! - `realtime.csv`: one line of 14 `;`-separated raw integer fields
//! - `YYYYMMDD.csv`: the day log, one `\r`-terminated row per sample, with
//!   columns `model;serial;date;time;energy_kwh;...`
//!
//! Both are ISO-8859-1 encoded.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::channel::Channel;
use crate::error::{ParseError, ParseResult};
use crate::status::InverterStatus;

/// Number of fields in a `realtime.csv` line.
pub const REALTIME_FIELD_COUNT: usize = 14;

/// Responses this short carry no data (the device serves a stub when idle).
pub const MIN_LOG_LENGTH: usize = 10;

const VOLTAGE_SCALE: f64 = 65535.0 / 1600.0;
const CURRENT_SCALE: f64 = 65535.0 / 200.0;
const POWER_SCALE: f64 = 65535.0 / 100_000.0;

/// Value of a single channel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum ChannelValue {
    Number(f64),
    Status(InverterStatus),
}

impl ChannelValue {
    /// Numeric view of the value; status codes map to their code.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            ChannelValue::Number(v) => *v,
            ChannelValue::Status(s) => f64::from(s.code()),
        }
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Number(v) => write!(f, "{}", v),
            ChannelValue::Status(s) => write!(f, "{}", s),
        }
    }
}

/// Whether a cached reading is within its grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Quality {
    Fresh,
    Stale,
}

/// Value of one channel at a point in time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    pub channel: Channel,
    pub value: ChannelValue,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    pub quality: Quality,
}

/// Snapshot parsed from `realtime.csv`, scaled to physical units.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RealtimeReadings {
    /// DC string voltages in V.
    pub generator_voltage: [f64; 2],
    /// DC string currents in A.
    pub generator_current: [f64; 2],
    /// Grid phase voltages in V.
    pub grid_voltage: [f64; 3],
    /// Grid phase currents in A.
    pub grid_current: [f64; 3],
    /// AC output power in whole watts.
    pub power: f64,
    /// Device temperature in °C.
    pub temperature: f64,
    pub status: InverterStatus,
}

impl RealtimeReadings {
    /// Parse the body of `realtime.csv`.
    ///
    /// Field 0 is ignored; fields 1-13 are generator voltages (2), grid
    /// voltages (3), generator currents (2), grid currents (3), power,
    /// temperature, and status code.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::FieldCount`] unless exactly 14 fields are present,
    /// and [`ParseError::InvalidNumber`] if any field is not numeric.
    ///
    /// # Examples
    ///
    /// ```
    /// use kaco_types::RealtimeReadings;
    ///
    /// let body = b"0;32768;32768;32768;32768;32768;16384;16384;16384;16384;16384;32768;2500;4";
    /// let readings = RealtimeReadings::from_csv(body).unwrap();
    /// assert_eq!(readings.power, 50001.0);
    /// assert_eq!(readings.temperature, 25.0);
    /// assert!(readings.status.is_feeding_in());
    /// ```
    pub fn from_csv(body: &[u8]) -> ParseResult<Self> {
        let text = decode_latin1(body);
        let mut reader = csv_reader(&text);
        let record = match reader.records().next() {
            Some(record) => record?,
            None => {
                return Err(ParseError::FieldCount {
                    expected: REALTIME_FIELD_COUNT,
                    actual: 0,
                });
            }
        };

        if record.len() != REALTIME_FIELD_COUNT {
            return Err(ParseError::FieldCount {
                expected: REALTIME_FIELD_COUNT,
                actual: record.len(),
            });
        }

        let raw = |idx: usize, field: &'static str| -> ParseResult<f64> {
            parse_number(record.get(idx).unwrap_or_default(), field)
        };

        let status_raw = record.get(13).unwrap_or_default();
        let status = status_raw
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidNumber {
                field: "status",
                value: status_raw.to_string(),
            })?;

        Ok(Self {
            generator_voltage: [
                round3(raw(1, "generator_voltage1")? / VOLTAGE_SCALE),
                round3(raw(2, "generator_voltage2")? / VOLTAGE_SCALE),
            ],
            grid_voltage: [
                round3(raw(3, "grid_voltage1")? / VOLTAGE_SCALE),
                round3(raw(4, "grid_voltage2")? / VOLTAGE_SCALE),
                round3(raw(5, "grid_voltage3")? / VOLTAGE_SCALE),
            ],
            generator_current: [
                round3(raw(6, "generator_current1")? / CURRENT_SCALE),
                round3(raw(7, "generator_current2")? / CURRENT_SCALE),
            ],
            grid_current: [
                round3(raw(8, "grid_current1")? / CURRENT_SCALE),
                round3(raw(9, "grid_current2")? / CURRENT_SCALE),
                round3(raw(10, "grid_current3")? / CURRENT_SCALE),
            ],
            power: (raw(11, "power")? / POWER_SCALE).round(),
            temperature: raw(12, "temperature")? / 100.0,
            status: InverterStatus(status),
        })
    }

    /// Value for a fast-cadence channel; `None` for slow channels.
    #[must_use]
    pub fn value(&self, channel: Channel) -> Option<ChannelValue> {
        let number = match channel {
            Channel::Power => self.power,
            Channel::GeneratorVoltage1 => self.generator_voltage[0],
            Channel::GeneratorVoltage2 => self.generator_voltage[1],
            Channel::GeneratorCurrent1 => self.generator_current[0],
            Channel::GeneratorCurrent2 => self.generator_current[1],
            Channel::GridVoltage1 => self.grid_voltage[0],
            Channel::GridVoltage2 => self.grid_voltage[1],
            Channel::GridVoltage3 => self.grid_voltage[2],
            Channel::GridCurrent1 => self.grid_current[0],
            Channel::GridCurrent2 => self.grid_current[1],
            Channel::GridCurrent3 => self.grid_current[2],
            Channel::Temperature => self.temperature,
            Channel::Status => return Some(ChannelValue::Status(self.status)),
            Channel::EnergyToday => return None,
        };
        Some(ChannelValue::Number(number))
    }

    /// All channel values carried by this snapshot.
    pub fn channel_values(&self) -> impl Iterator<Item = (Channel, ChannelValue)> + '_ {
        Channel::ALL
            .into_iter()
            .filter_map(move |c| self.value(c).map(|v| (c, v)))
    }
}

/// Summary of a `YYYYMMDD.csv` day log.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DailyLog {
    /// Inverter model, e.g. `blueplanet 10.0 TL3`.
    pub model: String,
    pub serial_number: String,
    /// Date column of the log, when it parses.
    pub date: Option<Date>,
    /// Energy produced so far that day in kWh (last data row).
    pub energy_today: f64,
    /// Number of data rows in the log.
    pub samples: usize,
}

impl DailyLog {
    /// Parse a day log.
    ///
    /// Rows with fewer than five columns or a non-numeric or non-finite
    /// energy column are skipped, which drops any header line.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::EmptyLog`] if the body is a stub or holds no
    /// usable data rows.
    ///
    /// # Examples
    ///
    /// ```
    /// use kaco_types::DailyLog;
    ///
    /// let body = b"blueplanet 10.0 TL3;BPI123456789;20260222;120000;5.432;0;0\r\
    ///              blueplanet 10.0 TL3;BPI123456789;20260222;121000;5.567;0;0";
    /// let log = DailyLog::from_csv(body).unwrap();
    /// assert_eq!(log.serial_number, "BPI123456789");
    /// assert_eq!(log.energy_today, 5.567);
    /// ```
    pub fn from_csv(body: &[u8]) -> ParseResult<Self> {
        if body.len() <= MIN_LOG_LENGTH {
            return Err(ParseError::EmptyLog);
        }

        let text = decode_latin1(body);
        let mut reader = csv_reader(&text);
        let mut log: Option<DailyLog> = None;

        for record in reader.records() {
            let record = record?;
            if record.len() < 5 {
                continue;
            }
            let Some(energy) = record
                .get(4)
                .unwrap_or_default()
                .parse::<f64>()
                .ok()
                .filter(|e| e.is_finite())
            else {
                continue;
            };

            match log.as_mut() {
                Some(log) => {
                    log.energy_today = energy;
                    log.samples += 1;
                }
                None => {
                    log = Some(DailyLog {
                        model: record.get(0).unwrap_or_default().to_string(),
                        serial_number: record.get(1).unwrap_or_default().to_string(),
                        date: parse_log_date(record.get(2).unwrap_or_default()),
                        energy_today: energy,
                        samples: 1,
                    });
                }
            }
        }

        log.ok_or(ParseError::EmptyLog)
    }
}

/// Energy produced on one day, as read from that day's log.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DayEnergy {
    pub date: Date,
    /// kWh produced that day.
    pub energy: f64,
}

/// Cumulative energy at the end of a day, from the device's own log.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistoricalEnergyPoint {
    pub date: Date,
    /// Cumulative kWh up to and including `date`.
    pub cumulative_energy: f64,
}

impl HistoricalEnergyPoint {
    /// Turn per-day energies into a running total starting at `base`.
    ///
    /// ```
    /// use kaco_types::{DayEnergy, HistoricalEnergyPoint};
    /// use time::macros::date;
    ///
    /// let days = [
    ///     DayEnergy { date: date!(2026 - 01 - 01), energy: 2.0 },
    ///     DayEnergy { date: date!(2026 - 01 - 02), energy: 3.5 },
    /// ];
    /// let points = HistoricalEnergyPoint::accumulate(&days, 10.0);
    /// assert_eq!(points[1].cumulative_energy, 15.5);
    /// ```
    #[must_use]
    pub fn accumulate(days: &[DayEnergy], base: f64) -> Vec<Self> {
        let mut total = base;
        days.iter()
            .map(|day| {
                total += day.energy;
                Self {
                    date: day.date,
                    cumulative_energy: total,
                }
            })
            .collect()
    }
}

/// File name of the day log for `date`, e.g. `20260222.csv`.
#[must_use]
pub fn day_log_name(date: Date) -> String {
    format!(
        "{:04}{:02}{:02}.csv",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

fn parse_log_date(text: &str) -> Option<Date> {
    let format = time::macros::format_description!("[year][month][day]");
    Date::parse(text, &format).ok()
}

fn decode_latin1(body: &[u8]) -> String {
    body.iter().map(|&b| char::from(b)).collect()
}

fn csv_reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

// `f64::from_str` accepts `NaN` and `inf`, which the device never means.
fn parse_number(text: &str, field: &'static str) -> ParseResult<f64> {
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber {
            field,
            value: text.to_string(),
        })
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    const SAMPLE_REALTIME: &[u8] =
        b"0;32768;32768;32768;32768;32768;16384;16384;16384;16384;16384;32768;2500;4";

    const SAMPLE_DAILY: &[u8] = b"blueplanet 10.0 TL3;BPI123456789;20260222;120000;5.432;0;0\r\
blueplanet 10.0 TL3;BPI123456789;20260222;121000;5.567;0;0";

    #[test]
    fn test_parse_realtime_sample() {
        let r = RealtimeReadings::from_csv(SAMPLE_REALTIME).unwrap();

        assert!((r.generator_voltage[0] - 800.012).abs() < 0.001);
        assert!((r.grid_voltage[2] - 800.012).abs() < 0.001);
        assert!((r.generator_current[1] - 50.001).abs() < 0.001);
        assert!((r.grid_current[0] - 50.001).abs() < 0.001);
        assert_eq!(r.power, 50001.0);
        assert_eq!(r.temperature, 25.0);
        assert_eq!(r.status, InverterStatus(4));
    }

    #[test]
    fn test_parse_realtime_trailing_newline() {
        let mut body = SAMPLE_REALTIME.to_vec();
        body.extend_from_slice(b"\r\n");
        assert!(RealtimeReadings::from_csv(&body).is_ok());
    }

    #[test]
    fn test_parse_realtime_wrong_field_count() {
        let err = RealtimeReadings::from_csv(b"0;1;2;3").unwrap_err();
        assert!(matches!(
            err,
            ParseError::FieldCount {
                expected: 14,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_parse_realtime_empty() {
        let err = RealtimeReadings::from_csv(b"").unwrap_err();
        assert!(matches!(err, ParseError::FieldCount { actual: 0, .. }));
    }

    #[test]
    fn test_parse_realtime_non_numeric() {
        let body = b"0;x;32768;32768;32768;32768;16384;16384;16384;16384;16384;32768;2500;4";
        let err = RealtimeReadings::from_csv(body).unwrap_err();
        assert!(err.to_string().contains("generator_voltage1"));
    }

    #[test]
    fn test_parse_realtime_rejects_non_finite() {
        let body = b"0;NaN;32768;32768;32768;32768;16384;16384;16384;16384;16384;32768;2500;4";
        let err = RealtimeReadings::from_csv(body).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber {
                field: "generator_voltage1",
                ..
            }
        ));

        let body = b"0;32768;32768;32768;32768;32768;16384;16384;16384;16384;16384;inf;2500;4";
        let err = RealtimeReadings::from_csv(body).unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { field: "power", .. }));
    }

    #[test]
    fn test_realtime_channel_values() {
        let r = RealtimeReadings::from_csv(SAMPLE_REALTIME).unwrap();
        let values: Vec<_> = r.channel_values().collect();

        assert_eq!(values.len(), Channel::ALL.len() - 1);
        assert!(values.iter().all(|(c, _)| *c != Channel::EnergyToday));
        assert_eq!(
            r.value(Channel::Status),
            Some(ChannelValue::Status(InverterStatus(4)))
        );
        assert_eq!(r.value(Channel::EnergyToday), None);
    }

    #[test]
    fn test_parse_daily_sample() {
        let log = DailyLog::from_csv(SAMPLE_DAILY).unwrap();
        assert_eq!(log.model, "blueplanet 10.0 TL3");
        assert_eq!(log.serial_number, "BPI123456789");
        assert_eq!(log.date, Some(date!(2026 - 02 - 22)));
        assert_eq!(log.energy_today, 5.567);
        assert_eq!(log.samples, 2);
    }

    #[test]
    fn test_parse_daily_skips_header() {
        let body = b"Model;Serial;Date;Time;E_kWh\r\nblueplanet 5.0;BPI1;20260101;080000;0.125\r\n";
        let log = DailyLog::from_csv(body).unwrap();
        assert_eq!(log.samples, 1);
        assert_eq!(log.energy_today, 0.125);
    }

    #[test]
    fn test_parse_daily_skips_non_finite_rows() {
        let body = b"blueplanet 5.0;BPI1;20260101;080000;1.25\r\
blueplanet 5.0;BPI1;20260101;081000;NaN\r\
blueplanet 5.0;BPI1;20260101;082000;inf\r\
blueplanet 5.0;BPI1;20260101;083000;infinity";
        let log = DailyLog::from_csv(body).unwrap();
        assert_eq!(log.samples, 1);
        assert_eq!(log.energy_today, 1.25);

        let only_bad = b"blueplanet 5.0;BPI1;20260101;080000;NaN\r\
blueplanet 5.0;BPI1;20260101;081000;-inf";
        assert!(matches!(DailyLog::from_csv(only_bad), Err(ParseError::EmptyLog)));
    }

    #[test]
    fn test_parse_daily_stub() {
        assert!(matches!(
            DailyLog::from_csv(b"\r\n"),
            Err(ParseError::EmptyLog)
        ));
        assert!(matches!(
            DailyLog::from_csv(b"no;data;rows;here;at;all"),
            Err(ParseError::EmptyLog)
        ));
    }

    #[test]
    fn test_parse_daily_latin1() {
        let mut body = b"Wechselrichter S\xfcd;BPI9;20260301;120000;1.5".to_vec();
        body.extend_from_slice(b"\r");
        let log = DailyLog::from_csv(&body).unwrap();
        assert_eq!(log.model, "Wechselrichter Süd");
    }

    #[test]
    fn test_day_log_name() {
        assert_eq!(day_log_name(date!(2026 - 02 - 05)), "20260205.csv");
    }

    #[test]
    fn test_accumulate_empty() {
        assert!(HistoricalEnergyPoint::accumulate(&[], 5.0).is_empty());
    }

    #[test]
    fn test_channel_value_display() {
        assert_eq!(ChannelValue::Number(12.5).to_string(), "12.5");
        assert_eq!(
            ChannelValue::Status(InverterStatus(1)).to_string(),
            "Waiting for feed-in"
        );
        assert_eq!(ChannelValue::Status(InverterStatus(4)).as_f64(), 4.0);
    }
}
