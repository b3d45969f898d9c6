//! Device event system for poll outcome notifications.
//!
//! Pollers publish events on a broadcast channel; the service subscribes to
//! record statistics, persist learned identity, and trigger reconciliation.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use kaco_types::{CadenceClass, DailyLog, EntryId, RealtimeReadings};

use crate::connectivity::Transition;
use crate::error::FetchErrorKind;

/// Events emitted by a device's pollers.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// New realtime readings were stored in the cache.
    Realtime {
        entry_id: EntryId,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        readings: RealtimeReadings,
    },
    /// A new day log summary was stored in the cache.
    Daily {
        entry_id: EntryId,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
        log: DailyLog,
    },
    /// A poll failed; cached values stay in place.
    PollFailed {
        entry_id: EntryId,
        class: CadenceClass,
        kind: FetchErrorKind,
        consecutive_failures: u32,
    },
    /// Online/Offline changed.
    ConnectivityChanged {
        entry_id: EntryId,
        transition: Transition,
    },
    /// The day log reported a serial number or model not seen before.
    IdentityLearned {
        entry_id: EntryId,
        serial_number: String,
        model: String,
        previous_serial: Option<String>,
    },
}

impl DeviceEvent {
    /// Entry the event belongs to.
    pub fn entry_id(&self) -> &EntryId {
        match self {
            DeviceEvent::Realtime { entry_id, .. }
            | DeviceEvent::Daily { entry_id, .. }
            | DeviceEvent::PollFailed { entry_id, .. }
            | DeviceEvent::ConnectivityChanged { entry_id, .. }
            | DeviceEvent::IdentityLearned { entry_id, .. } => entry_id,
        }
    }
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Create a default event channel with capacity 100.
pub fn default_event_channel() -> (EventSender, EventReceiver) {
    event_channel(100)
}
