//! Application state shared across handlers and collector tasks.
//!
//! # Device Events
//!
//! Each device has its own broadcast channel (`DeviceRuntime::events`) and
//! its own subscriber task that records statistics and persists learned
//! identity. A busy device never delays another device's events. If a
//! subscriber falls behind and the buffer fills, old events are dropped and
//! a warning is logged.
//!
//! ```toml
//! [server]
//! event_buffer = 512  # Per-device buffer
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kaco_core::{EventSender, Poller, PollerHandle};
use kaco_store::Store;
use kaco_types::{Channel, EntryId};

use crate::config::{Config, DeviceConfig};
use crate::repair::{Reconciler, RepairError, RepairTracker};

/// Shared application state.
pub struct AppState {
    /// The data store, shared with reconciliation tasks.
    pub store: Arc<Mutex<Store>>,
    /// Configuration as loaded at startup.
    pub config: RwLock<Config>,
    /// Running devices by entry id.
    pub devices: RwLock<HashMap<EntryId, Arc<DeviceRuntime>>>,
    /// Parent of every device's cancellation token.
    pub cancel: CancellationToken,
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create new application state.
    pub fn new(store: Store, config: Config) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(Mutex::new(store)),
            config: RwLock::new(config),
            devices: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            started_at: OffsetDateTime::now_utc(),
        })
    }

    /// The running device with `entry_id`.
    pub async fn device(&self, entry_id: &EntryId) -> Option<Arc<DeviceRuntime>> {
        self.devices.read().await.get(entry_id).cloned()
    }
}

/// A polled device and its background tasks.
pub struct DeviceRuntime {
    pub config: DeviceConfig,
    pub poller: Arc<Poller>,
    /// Events published by this device's poller.
    pub events: EventSender,
    /// Channels exposed for this device.
    pub channels: Vec<Channel>,
    pub repair: RepairTracker,
    /// Last identity conflict reported by the store.
    pub identity_error: Mutex<Option<String>>,
    cancel: CancellationToken,
    poller_handle: Mutex<Option<PollerHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRuntime {
    /// `events` must be the sender the poller was built with.
    pub fn new(config: DeviceConfig, poller: Arc<Poller>, events: EventSender) -> Self {
        let channels = config.channels();
        let cancel = poller.cancel_token().clone();
        Self {
            config,
            poller,
            events,
            channels,
            repair: RepairTracker::new(),
            identity_error: Mutex::new(None),
            cancel,
            poller_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn entry_id(&self) -> &EntryId {
        self.poller.entry_id()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start both cadences.
    pub async fn start_polling(&self) {
        let mut handle = self.poller_handle.lock().await;
        if handle.is_none() {
            *handle = Some(self.poller.spawn());
        }
    }

    /// Keep `task` until shutdown.
    pub async fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    /// Reconciler for this device, cancelled with it.
    pub fn reconciler(&self, store: Arc<Mutex<Store>>) -> Reconciler<Store> {
        Reconciler::new(store, self.entry_id().clone())
            .with_fetcher(Arc::clone(self.poller.fetcher()))
            .with_history_options(self.config.history_options())
            .with_tolerance(self.config.regression_tolerance)
            .with_cancel(self.cancel.child_token())
    }

    /// Start a background reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`RepairError::AlreadyRunning`] if one is in progress.
    pub async fn start_repair(&self, store: Arc<Mutex<Store>>) -> Result<(), RepairError> {
        info!("Starting reconciliation of {}", self.entry_id());
        self.repair.start(self.reconciler(store)).await
    }

    /// Cancel polling, event handling, and reconciliation, and wait for
    /// them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.poller_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Task of {} failed: {}", self.entry_id(), e);
            }
        }

        self.repair.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaco_core::{MockFetcher, PollerConfig, event_channel};

    #[tokio::test]
    async fn test_app_state_new() {
        let store = Store::open_in_memory().unwrap();
        let state = AppState::new(store, Config::default());

        assert!(state.devices.read().await.is_empty());
        assert!(!state.cancel.is_cancelled());
        assert!(state.device(&EntryId::new("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_runtime_shutdown_cancels_poller() {
        let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
        let (events, _) = event_channel(8);
        let poller = Arc::new(
            Poller::new(EntryId::new("entry9f2"), fetcher, PollerConfig::default())
                .with_events(events.clone())
                .with_cancel(CancellationToken::new()),
        );
        let runtime = DeviceRuntime::new(DeviceConfig::new("192.0.2.10"), poller, events);
        assert_eq!(runtime.channels.len(), 4);

        runtime.start_polling().await;
        runtime.shutdown().await;
        assert!(runtime.cancel_token().is_cancelled());
        assert!(runtime.poller.cancel_token().is_cancelled());
    }
}
