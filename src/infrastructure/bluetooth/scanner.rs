//! BLE Scanner Module
//!
//! Owns the single scan capability of a transport and feeds results into
//! the device registry.

use crate::domain::models::{AppEvent, MessageSeverity, PeripheralHandle, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::transport::{BleTransport, ScanCallback, ScanFilter};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// BLE Scanner for discovering sensor peripherals
pub struct BleScanner<T: BleTransport> {
    transport: Arc<T>,
    registry: Arc<Mutex<DeviceRegistry>>,
    filter: Option<ScanFilter>,
    scanning: AtomicBool,
    event_sender: Option<mpsc::UnboundedSender<AppEvent>>,
}

impl<T: BleTransport> BleScanner<T> {
    /// Create a new scanner
    ///
    /// # Arguments
    /// * `filter` - Service filter handed to the transport (None to see every advertiser)
    pub fn new(
        transport: Arc<T>,
        registry: Arc<Mutex<DeviceRegistry>>,
        filter: Option<ScanFilter>,
    ) -> Self {
        Self {
            transport,
            registry,
            filter,
            scanning: AtomicBool::new(false),
            event_sender: None,
        }
    }

    pub fn with_events(mut self, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn registry(&self) -> &Arc<Mutex<DeviceRegistry>> {
        &self.registry
    }

    /// Snapshot of the devices found so far
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .devices()
            .to_vec()
    }

    /// Start a fresh scan cycle
    pub fn start(&self) -> Result<()> {
        // Stop any existing scan
        self.stop();

        let marker = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.clear();
            registry.marker().to_string()
        };
        self.send(AppEvent::DevicesCleared);

        info!(
            "Starting BLE scan (filter: {:?}, name marker: {:?})",
            self.filter, marker
        );
        self.send_log("Scanning for sensors...", MessageSeverity::Info);

        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let on_result: ScanCallback = Arc::new(move |result| match result {
            Ok(handle) => {
                let added = registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_discovered(handle.clone());
                if added {
                    if let Some(sender) = &sender {
                        let _ = sender.send(AppEvent::DeviceFound(handle));
                    }
                }
            }
            Err(e) => warn!("Scan error: {}", e),
        });

        // Mark before starting: transports may report results synchronously
        self.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.start_scan(self.filter.as_ref(), on_result) {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.send(AppEvent::ScanStateChanged(true));

        Ok(())
    }

    /// Stop scanning. No-op when no scan is active.
    pub fn stop(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            info!("Stopping BLE scan...");
            self.transport.stop_scan();
            self.send(AppEvent::ScanStateChanged(false));
        }
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn send(&self, event: AppEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        self.send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

impl<T: BleTransport> Drop for BleScanner<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::TransportError;
    use crate::infrastructure::bluetooth::mock::{MockCall, MockTransport};

    fn scanner(transport: &Arc<MockTransport>) -> BleScanner<MockTransport> {
        let registry = Arc::new(Mutex::new(DeviceRegistry::new("esp32")));
        BleScanner::new(
            transport.clone(),
            registry,
            Some(ScanFilter::service("svc")),
        )
    }

    #[test]
    fn test_scan_feeds_registry() {
        let transport = Arc::new(MockTransport::with_simulated_devices());
        let scanner = scanner(&transport);

        scanner.start().unwrap();
        assert!(scanner.is_scanning());
        let ids: Vec<_> = scanner.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["SIM-ESP32-L", "SIM-ESP32-R"]);

        // Repeated advertisements don't duplicate entries
        transport.advertise(PeripheralHandle::new("SIM-ESP32-L", Some("ESP32 IMU Left")));
        transport.advertise(PeripheralHandle::new("late", Some("esp32 spare")));
        transport.scan_error(TransportError::ScanFailed("radio busy".to_string()));
        assert_eq!(scanner.devices().len(), 3);
    }

    #[test]
    fn test_restart_clears_and_stops_previous_scan() {
        let transport = Arc::new(MockTransport::with_simulated_devices());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scanner = scanner(&transport).with_events(tx);

        scanner.start().unwrap();
        scanner.start().unwrap();
        assert_eq!(scanner.devices().len(), 2);

        let calls = transport.calls();
        let starts = calls
            .iter()
            .filter(|c| matches!(c, MockCall::StartScan(_)))
            .count();
        let stops = calls.iter().filter(|c| **c == MockCall::StopScan).count();
        assert_eq!((starts, stops), (2, 1));

        let mut found = 0;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::DeviceFound(_) = event {
                found += 1;
            }
        }
        assert_eq!(found, 4);
    }

    #[test]
    fn test_drop_stops_scan() {
        let transport = Arc::new(MockTransport::with_simulated_devices());
        {
            let scanner = scanner(&transport);
            scanner.start().unwrap();
            assert!(transport.is_scanning());
        }
        assert!(!transport.is_scanning());
    }
}
