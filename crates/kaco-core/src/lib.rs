//! Core polling library for KACO solar inverters.
//!
//! This crate talks to the inverter's embedded web server and keeps a
//! stable view of its telemetry although the device disappears every night.
//!
//! # Features
//!
//! - **Fetching**: [`ReadingFetcher`] trait with an HTTP implementation and a mock
//! - **Polling**: two independent cadences with exponential backoff
//! - **Last-known cache**: values survive outages, marked stale after a grace period
//! - **Connectivity**: debounced Online/Offline state
//! - **History**: bulk download of the daily energy log
//! - **Reconciliation**: legacy series discovery, timestamp merge, segmentation
//!
//! # Cadences
//!
//! | Class | Source | Default interval | Timeout |
//! |-------|--------|------------------|---------|
//! | Fast | `realtime.csv` | 20 s (floor 5 s) | 10 s |
//! | Slow | `YYYYMMDD.csv` | 120 s (floor 30 s) | 15 s |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kaco_core::{HttpFetcher, Poller, PollerConfig};
//! use kaco_types::{Channel, EntryId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = Arc::new(HttpFetcher::new("192.168.1.50")?);
//!     let poller = Arc::new(Poller::new(EntryId::generate(), fetcher, PollerConfig::default()));
//!     let handle = poller.spawn();
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     for reading in poller.readings(Channel::ALL).await {
//!         println!("{}: {}", reading.reading.channel, reading.reading.value);
//!     }
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod history;
pub mod http;
pub mod mock;
pub mod poller;
pub mod retry;
pub mod statistics;

// Re-export kaco-types for convenience
pub use kaco_types as types;

// Core exports
pub use backoff::{BackoffPolicy, BackoffState};
pub use cache::{CachedReading, LastKnownCache};
pub use connectivity::{ConnectivityMachine, ConnectivityState, Transition};
pub use error::{Error, FetchErrorKind, Result};
pub use events::{DeviceEvent, EventReceiver, EventSender, default_event_channel, event_channel};
pub use fetcher::ReadingFetcher;
pub use history::{HistoryOptions, HistoryPhase, HistoryProgress, device_today};
pub use http::HttpFetcher;
pub use mock::MockFetcher;
pub use poller::{PollOutcome, PollResult, PollStats, Poller, PollerConfig, PollerHandle};
pub use retry::{RetryConfig, with_retry};
