//! Platform-agnostic types for KACO solar inverters.
//!
//! This crate provides the shared vocabulary used by the poller
//! (kaco-core), the persistence layer (kaco-store), and the service.
//!
//! # Features
//!
//! - Channel catalogue with units, cadence, and identifier spellings
//! - Parsers for `realtime.csv` and the `YYYYMMDD.csv` day log
//! - Inverter status code descriptions
//! - Statistic point and series types
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use kaco_types::{Channel, ChannelValue, RealtimeReadings};
//!
//! let body = b"0;32768;32768;32768;32768;32768;16384;16384;16384;16384;16384;32768;2500;4";
//! let readings = RealtimeReadings::from_csv(body).unwrap();
//! assert_eq!(readings.value(Channel::Temperature), Some(ChannelValue::Number(25.0)));
//! ```

pub mod channel;
pub mod error;
pub mod identity;
pub mod readings;
pub mod statistics;
pub mod status;

pub use channel::{
    CadenceClass, Channel, ChannelGroup, StateClass, Unit, ValueKind, camel_to_snake,
};
pub use error::{ParseError, ParseResult};
pub use identity::{DeviceIdentity, EntryId};
pub use readings::{
    ChannelValue, DailyLog, DayEnergy, HistoricalEnergyPoint, MIN_LOG_LENGTH, Quality,
    REALTIME_FIELD_COUNT, RealtimeReadings, Reading, day_log_name,
};
pub use statistics::{PointOrigin, StatisticPoint, StatisticsSeries};
pub use status::InverterStatus;
