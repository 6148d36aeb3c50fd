//! Radio Transport Capability
//!
//! The seam between the session layer and a concrete BLE stack. Everything
//! above this trait is platform independent.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives each scan result (or scan error) as it arrives
pub type ScanCallback = Arc<dyn Fn(Result<PeripheralHandle, TransportError>) + Send + Sync>;

/// Receives each characteristic notification. `Ok(None)` is a notification
/// without a value.
pub type NotifyCallback = Arc<dyn Fn(Result<Option<Vec<u8>>, TransportError>) + Send + Sync>;

/// Restricts a scan to peripherals advertising any of these services
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuids: Vec<String>,
}

impl ScanFilter {
    pub fn service(uuid: &str) -> Self {
        Self {
            service_uuids: vec![uuid.to_string()],
        }
    }
}

/// A live characteristic monitor registered with the transport
pub trait TransportSubscription: Send + Sync {
    /// Stop delivering notifications. Called at most once.
    fn cancel(&mut self);
}

#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Connected peer as handed back by `connect`
    type Peer: Clone + Send + Sync + 'static;

    fn start_scan(
        &self,
        filter: Option<&ScanFilter>,
        on_result: ScanCallback,
    ) -> Result<(), TransportError>;

    fn stop_scan(&self);

    async fn connect(&self, peripheral_id: &str) -> Result<Self::Peer, TransportError>;

    async fn discover_services_and_characteristics(
        &self,
        peer: &Self::Peer,
    ) -> Result<(), TransportError>;

    async fn monitor(
        &self,
        peer: &Self::Peer,
        service_id: &str,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError>;

    async fn write_with_response(
        &self,
        peer: &Self::Peer,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    fn cancel_connection(&self, peripheral_id: &str);
}
