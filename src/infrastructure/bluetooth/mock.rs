//! In-process transport with scripted peripherals.
//!
//! Drives the session layer in tests and in `--simulate` mode: devices are
//! "advertised" on scan, failures can be injected per peripheral, connects
//! can be held open, and notifications are pushed by hand.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, NotifyCallback, ScanCallback, ScanFilter, TransportSubscription,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Every transport call, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartScan(Option<ScanFilter>),
    StopScan,
    Connect(String),
    Discover(String),
    Monitor {
        peripheral_id: String,
        service_id: String,
        characteristic_id: String,
    },
    Write {
        peripheral_id: String,
        service_id: String,
        characteristic_id: String,
        payload: Vec<u8>,
    },
    CancelConnection(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPeer {
    pub peripheral_id: String,
}

struct Monitor {
    id: u64,
    peripheral_id: String,
    callback: NotifyCallback,
}

#[derive(Default)]
struct MockState {
    devices: Vec<PeripheralHandle>,
    scan_callback: Option<ScanCallback>,
    connect_failures: HashMap<String, TransportError>,
    discover_failures: HashMap<String, TransportError>,
    monitor_failure: Option<TransportError>,
    write_failure: Option<TransportError>,
    connect_gates: HashMap<String, Arc<Notify>>,
    connected: Vec<String>,
    monitors: Vec<Monitor>,
    next_monitor_id: u64,
    calls: Vec<MockCall>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<PeripheralHandle>) -> Self {
        let transport = Self::new();
        transport.lock().devices = devices;
        transport
    }

    /// Two sensors plus an unrelated peripheral that the name filter drops
    pub fn with_simulated_devices() -> Self {
        Self::with_devices(vec![
            PeripheralHandle::new("SIM-ESP32-L", Some("ESP32 IMU Left")).with_rssi(-52),
            PeripheralHandle::new("SIM-ESP32-R", Some("ESP32 IMU Right")).with_rssi(-58),
            PeripheralHandle::new("SIM-HR-01", Some("Heart Rate Strap")).with_rssi(-71),
        ])
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a device to the active scan, if any
    pub fn advertise(&self, handle: PeripheralHandle) {
        let callback = {
            let mut state = self.lock();
            state.devices.push(handle.clone());
            state.scan_callback.clone()
        };
        if let Some(callback) = callback {
            callback(Ok(handle));
        }
    }

    /// Report a scan error to the active scan, if any
    pub fn scan_error(&self, error: TransportError) {
        let callback = self.lock().scan_callback.clone();
        if let Some(callback) = callback {
            callback(Err(error));
        }
    }

    pub fn fail_connect(&self, peripheral_id: &str, error: TransportError) {
        self.lock()
            .connect_failures
            .insert(peripheral_id.to_string(), error);
    }

    pub fn fail_discover(&self, peripheral_id: &str, error: TransportError) {
        self.lock()
            .discover_failures
            .insert(peripheral_id.to_string(), error);
    }

    pub fn fail_monitor(&self, error: Option<TransportError>) {
        self.lock().monitor_failure = error;
    }

    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.lock().write_failure = error;
    }

    /// Hold `connect(peripheral_id)` until the returned gate is notified
    pub fn gate_connect(&self, peripheral_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock()
            .connect_gates
            .insert(peripheral_id.to_string(), gate.clone());
        gate
    }

    /// Push a notification to every monitor on this peripheral.
    /// Returns how many monitors received it.
    pub fn notify(&self, peripheral_id: &str, value: Result<Option<Vec<u8>>, TransportError>) -> usize {
        let callbacks: Vec<NotifyCallback> = self
            .lock()
            .monitors
            .iter()
            .filter(|m| m.peripheral_id == peripheral_id)
            .map(|m| m.callback.clone())
            .collect();

        for callback in &callbacks {
            callback(value.clone());
        }
        callbacks.len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.lock().connected.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_callback.is_some()
    }

    pub fn monitor_count(&self, peripheral_id: &str) -> usize {
        self.lock()
            .monitors
            .iter()
            .filter(|m| m.peripheral_id == peripheral_id)
            .count()
    }

    /// Payloads written to a peripheral (including failed attempts), oldest first
    pub fn writes(&self, peripheral_id: &str) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Write {
                    peripheral_id: id,
                    payload,
                    ..
                } if id == peripheral_id => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

struct MockSubscription {
    id: u64,
    state: Arc<Mutex<MockState>>,
}

impl TransportSubscription for MockSubscription {
    fn cancel(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.monitors.retain(|m| m.id != self.id);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    type Peer = MockPeer;

    fn start_scan(
        &self,
        filter: Option<&ScanFilter>,
        on_result: ScanCallback,
    ) -> Result<(), TransportError> {
        let devices = {
            let mut state = self.lock();
            state.calls.push(MockCall::StartScan(filter.cloned()));
            state.scan_callback = Some(on_result.clone());
            state.devices.clone()
        };

        for device in devices {
            on_result(Ok(device));
        }
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = self.lock();
        state.calls.push(MockCall::StopScan);
        state.scan_callback = None;
    }

    async fn connect(&self, peripheral_id: &str) -> Result<MockPeer, TransportError> {
        let gate = {
            let mut state = self.lock();
            state.calls.push(MockCall::Connect(peripheral_id.to_string()));
            if !state.devices.iter().any(|d| d.id == peripheral_id) {
                return Err(TransportError::DeviceNotFound(peripheral_id.to_string()));
            }
            state.connect_gates.remove(peripheral_id)
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.lock();
        if let Some(error) = state.connect_failures.get(peripheral_id) {
            return Err(error.clone());
        }
        if !state.connected.iter().any(|id| id == peripheral_id) {
            state.connected.push(peripheral_id.to_string());
        }
        Ok(MockPeer {
            peripheral_id: peripheral_id.to_string(),
        })
    }

    async fn discover_services_and_characteristics(
        &self,
        peer: &MockPeer,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        state
            .calls
            .push(MockCall::Discover(peer.peripheral_id.clone()));
        match state.discover_failures.get(&peer.peripheral_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn monitor(
        &self,
        peer: &MockPeer,
        service_id: &str,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Monitor {
            peripheral_id: peer.peripheral_id.clone(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        if let Some(error) = state.monitor_failure.clone() {
            return Err(error);
        }

        state.next_monitor_id += 1;
        let id = state.next_monitor_id;
        state.monitors.push(Monitor {
            id,
            peripheral_id: peer.peripheral_id.clone(),
            callback: on_notify,
        });

        Ok(Box::new(MockSubscription {
            id,
            state: self.state.clone(),
        }))
    }

    async fn write_with_response(
        &self,
        peer: &MockPeer,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        // Failed attempts are logged too
        state.calls.push(MockCall::Write {
            peripheral_id: peer.peripheral_id.clone(),
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
            payload: payload.to_vec(),
        });
        match state.write_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn cancel_connection(&self, peripheral_id: &str) {
        let mut state = self.lock();
        state
            .calls
            .push(MockCall::CancelConnection(peripheral_id.to_string()));
        state.connected.retain(|id| id != peripheral_id);
        state.monitors.retain(|m| m.peripheral_id != peripheral_id);
    }
}
