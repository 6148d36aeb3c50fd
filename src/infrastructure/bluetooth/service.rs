//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, sessions, telemetry and time
//! sync for the IMU sensors.

use crate::domain::errors::SyncError;
use crate::domain::models::{AppEvent, BluetoothCommand, MessageSeverity, Side, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::{
    scanner::BleScanner,
    session::{SessionConfig, SessionManager},
    sync::SyncDispatcher,
    telemetry::{SubscriptionHandle, TelemetryStats, TelemetrySubscriber},
    transport::{BleTransport, ScanFilter},
};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<T: BleTransport> {
    scanner: Arc<BleScanner<T>>,
    manager: Arc<SessionManager<T>>,
    subscriber: TelemetrySubscriber<T>,
    dispatcher: Arc<SyncDispatcher<T>>,
    subscriptions: HashMap<String, SubscriptionHandle>,
    periodic_sync: Option<JoinHandle<()>>,
    sync_interval: Option<Duration>,
    sync_side: Option<Side>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: BleTransport> BluetoothService<T> {
    /// Create a new Bluetooth service
    pub fn new(
        transport: Arc<T>,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(DeviceRegistry::new(&settings.device_name_marker)));
        let scanner = Arc::new(
            BleScanner::new(
                transport.clone(),
                registry,
                Some(ScanFilter::service(&settings.ble_service_uuid)),
            )
            .with_events(event_sender.clone()),
        );

        let config = SessionConfig {
            service_id: settings.ble_service_uuid.clone(),
            characteristic_id: settings.ble_data_char_uuid.clone(),
        };
        let manager = Arc::new(
            SessionManager::new(transport, config)
                .with_scanner(scanner.clone())
                .with_events(event_sender.clone()),
        );

        let subscriber = TelemetrySubscriber::new(manager.clone())
            .with_raw_data_logging(settings.debug_raw_data_logging);
        let dispatcher =
            Arc::new(SyncDispatcher::new(manager.clone()).with_events(event_sender.clone()));

        Self {
            scanner,
            manager,
            subscriber,
            dispatcher,
            subscriptions: HashMap::new(),
            periodic_sync: None,
            sync_interval: settings
                .sync_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            sync_side: settings.sync_side,
            event_sender,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager<T>> {
        &self.manager
    }

    pub fn scanner(&self) -> &Arc<BleScanner<T>> {
        &self.scanner
    }

    pub fn subscription_stats(&self, peripheral_id: &str) -> Option<TelemetryStats> {
        self.subscriptions.get(peripheral_id).map(|s| s.stats())
    }

    /// Start scanning for devices
    pub fn start_scan(&mut self) -> Result<()> {
        self.scanner.start()
    }

    /// Stop scanning
    pub fn stop_scan(&mut self) {
        self.scanner.stop();
    }

    /// Connect to a scanned device and start streaming its readings
    pub async fn connect(&mut self, peripheral_id: &str, side: Side) -> Result<()> {
        let handle = self
            .scanner
            .registry()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| anyhow!("Device {} not found in scan results", peripheral_id))?;

        let session = self.manager.connect(&handle, side).await?;

        let sender = self.event_sender.clone();
        let id = session.peripheral_id.clone();
        let subscription = match self
            .subscriber
            .subscribe(&session, move |reading| {
                let _ = sender.send(AppEvent::Reading {
                    peripheral_id: id.clone(),
                    side,
                    reading,
                });
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                // A session without telemetry is of no use to the caller
                self.manager.disconnect(Some(peripheral_id));
                return Err(e.into());
            }
        };

        self.subscriptions
            .insert(session.peripheral_id.clone(), subscription);
        self.send_log(
            format!("Connected to {} ({})", handle.display_name(), side),
            MessageSeverity::Success,
        );

        if self.periodic_sync.is_none() {
            if let Some(interval) = self.sync_interval {
                info!("Starting periodic sync every {:?}", interval);
                self.periodic_sync = Some(self.dispatcher.clone().spawn_periodic(self.sync_side, interval));
            }
        }

        Ok(())
    }

    /// Disconnect one device, or all when `peripheral_id` is None
    pub fn disconnect(&mut self, peripheral_id: Option<&str>) {
        match peripheral_id {
            Some(id) => {
                self.subscriptions.remove(id);
            }
            None => self.subscriptions.clear(),
        }
        self.manager.disconnect(peripheral_id);

        if self.manager.sessions().is_empty() {
            self.stop_periodic_sync();
        }
    }

    /// Send a one-shot sync to `side`, or to the first ready session
    pub async fn send_sync(&self, side: Option<Side>) -> Result<(), SyncError> {
        match side {
            Some(side) => self.dispatcher.send_sync_to_side(side).await,
            None => self.dispatcher.send_sync_to_first().await,
        }
    }

    /// Cancel subscriptions, close every session and halt scanning
    pub fn shutdown(&mut self) {
        self.stop_periodic_sync();
        self.subscriptions.clear();
        self.manager.shutdown();
        info!("Bluetooth service shut down");
    }

    /// Process commands until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BluetoothCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                BluetoothCommand::StartScan => {
                    if let Err(e) = self.start_scan() {
                        error!("Failed to start scan: {}", e);
                        self.send_log(format!("Failed to start scan: {}", e), MessageSeverity::Error);
                    }
                }
                BluetoothCommand::StopScan => self.stop_scan(),
                BluetoothCommand::Connect {
                    peripheral_id,
                    side,
                } => {
                    if let Err(e) = self.connect(&peripheral_id, side).await {
                        error!("Connection failed: {}", e);
                        self.send_log(format!("Connection failed: {}", e), MessageSeverity::Error);
                    }
                }
                BluetoothCommand::Disconnect(peripheral_id) => {
                    self.disconnect(peripheral_id.as_deref());
                }
                BluetoothCommand::SendSync(side) => {
                    if let Err(e) = self.send_sync(side).await {
                        error!("Sync failed: {}", e);
                        self.send_log(format!("Sync failed: {}", e), MessageSeverity::Error);
                    }
                }
                BluetoothCommand::Shutdown => break,
            }
        }

        self.shutdown();
    }

    fn stop_periodic_sync(&mut self) {
        if let Some(task) = self.periodic_sync.take() {
            task.abort();
        }
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl<T: BleTransport> Drop for BluetoothService<T> {
    fn drop(&mut self) {
        self.stop_periodic_sync();
    }
}
