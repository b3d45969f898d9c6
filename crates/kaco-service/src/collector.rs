//! Starts a poller per configured device and turns its events into
//! statistics and registry updates.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use kaco_core::{DeviceEvent, EventReceiver, HttpFetcher, Poller, ReadingFetcher, event_channel};
use kaco_store::IdentityChange;
use kaco_types::{DeviceIdentity, EntryId};

use crate::config::DeviceConfig;
use crate::recorder::StatisticsRecorder;
use crate::state::{AppState, DeviceRuntime};

/// Errors that abort the setup of one device.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SetupError {
    #[error("Device {0} has no entry id")]
    MissingEntryId(String),
    #[error("Invalid device configuration: {0}")]
    InvalidConfig(#[from] kaco_core::Error),
    #[error(transparent)]
    Store(#[from] kaco_store::Error),
}

/// Background data collector.
pub struct Collector {
    state: Arc<AppState>,
}

impl Collector {
    /// Create a new collector.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Start polling every configured device over HTTP.
    ///
    /// A device whose setup fails is logged and skipped. Returns the number
    /// of devices started.
    pub async fn start(&self) -> usize {
        let devices = self.state.config.read().await.devices.clone();
        if devices.is_empty() {
            info!("No devices configured for collection");
            return 0;
        }

        info!("Starting collector for {} device(s)", devices.len());
        let mut started = 0;
        for device in devices {
            let fetcher = match HttpFetcher::new(device.host()) {
                Ok(fetcher) => fetcher,
                Err(e) => {
                    error!("Cannot poll {}: {}", device.display_name(), e);
                    continue;
                }
            };
            match self.add_device(device.clone(), Arc::new(fetcher)).await {
                Ok(_) => started += 1,
                Err(e) => error!("Setup of {} aborted: {}", device.display_name(), e),
            }
        }
        started
    }

    /// Register `config` and start polling it through `fetcher`.
    ///
    /// A device that is already running is shut down and replaced.
    ///
    /// # Errors
    ///
    /// Fails without starting anything if the device has no entry id, its
    /// intervals are invalid, or its configured serial number belongs to
    /// another device.
    pub async fn add_device(
        &self,
        config: DeviceConfig,
        fetcher: Arc<dyn ReadingFetcher>,
    ) -> Result<Arc<DeviceRuntime>, SetupError> {
        let entry_id = config
            .entry_id
            .clone()
            .ok_or_else(|| SetupError::MissingEntryId(config.address.clone()))?;
        let poller_config = config.poller_config();
        poller_config.validate()?;

        let (identity, repair_state) = {
            let store = self.state.store.lock().await;
            let configured = config.identity();
            // Reject before registering so a refused device leaves no row
            if let Some(serial) = configured.serial_number.as_deref() {
                store.ensure_serial_available(&entry_id, serial)?;
            }
            store.register_device(&entry_id, config.name.as_deref(), config.host())?;
            if store
                .record_identity(&entry_id, &configured)?
                .is_serial_change()
            {
                store.reset_migrated(&entry_id)?;
            }
            let device = store
                .get_device(&entry_id)?
                .ok_or_else(|| kaco_store::Error::DeviceNotFound(entry_id.to_string()))?;
            (device.identity(), store.get_repair_state(&entry_id)?)
        };

        self.remove_device(&entry_id).await;

        // Created before the first poll so no event is missed
        let buffer = self.state.config.read().await.server.event_buffer.max(1);
        let (sender, events) = event_channel(buffer);
        let poller = Arc::new(
            Poller::new(entry_id.clone(), fetcher, poller_config)
                .with_identity(identity)
                .with_events(sender.clone())
                .with_cancel(self.state.cancel.child_token()),
        );
        let runtime = Arc::new(DeviceRuntime::new(config, poller, sender));

        let task = tokio::spawn(handle_events(
            Arc::clone(&self.state),
            Arc::clone(&runtime),
            events,
        ));
        runtime.track(task).await;

        self.state
            .devices
            .write()
            .await
            .insert(entry_id.clone(), Arc::clone(&runtime));
        runtime.start_polling().await;
        info!(
            "Polling {} ({}) every {}s/{}s",
            runtime.config.display_name(),
            entry_id,
            runtime.config.fast_interval,
            runtime.config.slow_interval
        );

        if repair_state.migrated_at.is_none()
            && let Err(e) = runtime.start_repair(Arc::clone(&self.state.store)).await
        {
            warn!("Automatic reconciliation of {} not started: {}", entry_id, e);
        }

        Ok(runtime)
    }

    /// Stop polling a device. Returns `false` if it was not running.
    pub async fn remove_device(&self, entry_id: &EntryId) -> bool {
        let runtime = self.state.devices.write().await.remove(entry_id);
        match runtime {
            Some(runtime) => {
                runtime.shutdown().await;
                info!("Stopped polling {}", entry_id);
                true
            }
            None => false,
        }
    }

    /// Stop every device and wait for its tasks.
    pub async fn stop(&self) {
        self.state.cancel.cancel();
        let runtimes: Vec<_> = self.state.devices.write().await.drain().collect();
        for (_, runtime) in runtimes {
            runtime.shutdown().await;
        }
        info!("Collector stopped");
    }
}

/// Per-device subscriber: statistics, identity, and repair triggers.
async fn handle_events(state: Arc<AppState>, runtime: Arc<DeviceRuntime>, mut events: EventReceiver) {
    let entry_id = runtime.entry_id().clone();
    let cancel = runtime.cancel_token().clone();
    let mut recorder = StatisticsRecorder::new(
        entry_id.clone(),
        &runtime.channels,
        runtime.config.utc_offset(),
    );

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("{} event handler lagged, {} events dropped", entry_id, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            DeviceEvent::Realtime {
                timestamp, readings, ..
            } => {
                let store = state.store.lock().await;
                if let Err(e) = recorder.record_realtime(&*store, &readings, timestamp) {
                    warn!("Failed to record realtime statistics of {}: {}", entry_id, e);
                }
            }
            DeviceEvent::Daily { timestamp, log, .. } => {
                let store = state.store.lock().await;
                if let Err(e) = recorder.record_daily(&*store, &log, timestamp) {
                    warn!("Failed to record energy of {}: {}", entry_id, e);
                }
            }
            DeviceEvent::IdentityLearned {
                serial_number,
                model,
                ..
            } => {
                let identity = DeviceIdentity {
                    serial_number: Some(serial_number),
                    mac_address: None,
                    model: Some(model),
                };
                record_identity(&state, &runtime, &identity).await;
            }
            DeviceEvent::PollFailed {
                class,
                kind,
                consecutive_failures,
                ..
            } => {
                debug!(
                    "{} {} poll failed ({}), {} in a row",
                    entry_id, class, kind, consecutive_failures
                );
            }
            _ => {}
        }
    }
    debug!("{} event handler stopped", entry_id);
}

async fn record_identity(state: &AppState, runtime: &DeviceRuntime, identity: &DeviceIdentity) {
    let entry_id = runtime.entry_id();
    let change = {
        let store = state.store.lock().await;
        let change = store.record_identity(entry_id, identity);
        if let Ok(IdentityChange::SerialChanged { .. }) = &change
            && let Err(e) = store.reset_migrated(entry_id)
        {
            warn!("Failed to reset reconciliation state of {}: {}", entry_id, e);
        }
        change
    };

    match change {
        Ok(IdentityChange::SerialChanged { previous }) => {
            warn!(
                "{} now reports serial {:?} (was {}), reconciling statistics",
                entry_id, identity.serial_number, previous
            );
            if let Err(e) = runtime.start_repair(Arc::clone(&state.store)).await {
                warn!("Reconciliation of {} not started: {}", entry_id, e);
            }
        }
        Ok(IdentityChange::Learned) => {
            info!("Stored identity of {}: {:?}", entry_id, identity.serial_number);
            *runtime.identity_error.lock().await = None;
        }
        Ok(IdentityChange::Unchanged) => {}
        Err(e @ kaco_store::Error::IdentityConflict { .. }) => {
            error!("Identity of {} not stored: {}", entry_id, e);
            *runtime.identity_error.lock().await = Some(e.to_string());
        }
        Err(e) => warn!("Failed to store identity of {}: {}", entry_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use kaco_core::MockFetcher;
    use kaco_store::{DeviceRegistry, Store};
    use tokio::sync::broadcast::error::TryRecvError;

    fn state() -> Arc<AppState> {
        AppState::new(Store::open_in_memory().unwrap(), Config::default())
    }

    fn device(entry: &str) -> DeviceConfig {
        let mut config = DeviceConfig::new("192.0.2.10");
        config.entry_id = Some(EntryId::new(entry));
        config
    }

    #[tokio::test]
    async fn test_add_device_requires_entry_id() {
        let collector = Collector::new(state());
        let fetcher = Arc::new(MockFetcher::new("192.0.2.10"));
        let result = collector
            .add_device(DeviceConfig::new("192.0.2.10"), fetcher)
            .await;
        assert!(matches!(result, Err(SetupError::MissingEntryId(_))));
    }

    #[tokio::test]
    async fn test_add_device_rejects_short_interval() {
        let collector = Collector::new(state());
        let mut config = device("entry9f2");
        config.fast_interval = 1;
        let result = collector
            .add_device(config, Arc::new(MockFetcher::new("192.0.2.10")))
            .await;
        assert!(matches!(result, Err(SetupError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_configured_serial_conflict_aborts_setup() {
        let state = state();
        let collector = Collector::new(Arc::clone(&state));

        let mut first = device("entry9f2");
        first.serial_number = Some("BPI1".into());
        collector
            .add_device(first, Arc::new(MockFetcher::new("192.0.2.10")))
            .await
            .unwrap();

        let mut second = device("entry77a");
        second.address = "192.0.2.11".into();
        second.serial_number = Some("BPI1".into());
        let result = collector
            .add_device(second, Arc::new(MockFetcher::new("192.0.2.11")))
            .await;

        assert!(matches!(
            result,
            Err(SetupError::Store(kaco_store::Error::IdentityConflict { .. }))
        ));
        assert!(state.device(&EntryId::new("entry77a")).await.is_none());
        let store = state.store.lock().await;
        assert!(store.get_device(&EntryId::new("entry77a")).unwrap().is_none());
        assert_eq!(store.entry_ids().unwrap(), vec![EntryId::new("entry9f2")]);
        drop(store);
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_devices_have_separate_event_channels() {
        let state = state();
        let collector = Collector::new(Arc::clone(&state));
        let first = collector
            .add_device(device("entry9f2"), Arc::new(MockFetcher::new("192.0.2.10")))
            .await
            .unwrap();
        let mut config = device("entry77a");
        config.address = "192.0.2.11".into();
        let second = collector
            .add_device(config, Arc::new(MockFetcher::new("192.0.2.11")))
            .await
            .unwrap();

        assert!(!first.events.same_channel(&second.events));

        // Flooding one device's channel leaves the other untouched
        let mut first_rx = first.events.subscribe();
        let mut second_rx = second.events.subscribe();
        for _ in 0..(state.config.read().await.server.event_buffer * 2) {
            let _ = first.events.send(DeviceEvent::IdentityLearned {
                entry_id: first.entry_id().clone(),
                serial_number: "BPI1".into(),
                model: "blueplanet".into(),
                previous_serial: None,
            });
        }
        assert!(matches!(first_rx.try_recv(), Err(TryRecvError::Lagged(_))));
        assert!(!matches!(second_rx.try_recv(), Err(TryRecvError::Lagged(_))));
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_remove_device() {
        let state = state();
        let collector = Collector::new(Arc::clone(&state));
        collector
            .add_device(device("entry9f2"), Arc::new(MockFetcher::new("192.0.2.10")))
            .await
            .unwrap();

        assert!(collector.remove_device(&EntryId::new("entry9f2")).await);
        assert!(!collector.remove_device(&EntryId::new("entry9f2")).await);
        assert!(state.devices.read().await.is_empty());
    }
}
