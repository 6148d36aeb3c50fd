//! WinRT Transport
//!
//! `BleTransport` on top of the Windows.Devices.Bluetooth APIs. Peripheral
//! ids are the 48-bit Bluetooth address as 12 uppercase hex digits.

use crate::domain::errors::TransportError;
use crate::domain::models::PeripheralHandle;
use crate::infrastructure::bluetooth::transport::{
    BleTransport, NotifyCallback, ScanCallback, ScanFilter, TransportSubscription,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothError, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Connected device plus the services found by discovery
#[derive(Clone)]
pub struct WinRtPeer {
    peripheral_id: String,
    device: BluetoothLEDevice,
    services: Arc<Mutex<Vec<GattDeviceService>>>,
}

#[derive(Default)]
pub struct WinRtTransport {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    devices: Mutex<HashMap<String, BluetoothLEDevice>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn find_characteristic(
        peer: &WinRtPeer,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<GattCharacteristic, TransportError> {
        let service_uuid = parse_uuid(service_id)?;
        let char_uuid = parse_uuid(characteristic_id)?;

        let service = {
            let services = peer.services.lock().unwrap_or_else(PoisonError::into_inner);
            services
                .iter()
                .find(|s| s.Uuid().map(|u| u == service_uuid).unwrap_or(false))
                .cloned()
        };
        let service = service.ok_or_else(|| {
            TransportError::DiscoveryFailed(format!("service {} not found", service_id))
        })?;

        let chars_result = service
            .GetCharacteristicsForUuidAsync(char_uuid)
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;

        let status = chars_result.Status().map_err(gatt_err)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get characteristics. Status: {:?}", status);
            return Err(TransportError::DiscoveryFailed(format!(
                "characteristic query returned {:?}",
                status
            )));
        }

        let characteristics = chars_result.Characteristics().map_err(gatt_err)?;
        if characteristics.Size().map_err(gatt_err)? == 0 {
            return Err(TransportError::CharacteristicNotFound {
                characteristic: characteristic_id.to_string(),
            });
        }
        characteristics.GetAt(0).map_err(gatt_err)
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    type Peer = WinRtPeer;

    fn start_scan(
        &self,
        filter: Option<&ScanFilter>,
        on_result: ScanCallback,
    ) -> Result<(), TransportError> {
        self.stop_scan();

        let targets = match filter {
            Some(filter) => filter
                .service_uuids
                .iter()
                .map(|u| parse_uuid(u))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(scan_err)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(scan_err)?;

        let callback = on_result.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;

                    if !targets.is_empty() {
                        let service_uuids = adv.ServiceUuids()?;
                        let mut found = false;
                        for i in 0..service_uuids.Size()? {
                            if targets.contains(&service_uuids.GetAt(i)?) {
                                found = true;
                                break;
                            }
                        }
                        if !found {
                            return Ok(());
                        }
                    }

                    let name = adv.LocalName()?.to_string();
                    let address = args.BluetoothAddress()?;
                    let rssi = args.RawSignalStrengthInDBm()?;

                    let handle = PeripheralHandle {
                        id: format!("{:012X}", address),
                        advertised_name: if name.is_empty() { None } else { Some(name) },
                        rssi: Some(rssi),
                    };
                    callback(Ok(handle));
                }
                Ok(())
            },
        );

        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let status = args.Error()?;
                    if status != BluetoothError::Success {
                        on_result(Err(TransportError::ScanFailed(format!("{:?}", status))));
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(scan_err)?;
        watcher.Stopped(&stopped).map_err(scan_err)?;
        watcher.Start().map_err(scan_err)?;

        info!("BLE advertisement watcher started");
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    fn stop_scan(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }

    async fn connect(&self, peripheral_id: &str) -> Result<WinRtPeer, TransportError> {
        let address = u64::from_str_radix(peripheral_id, 16)
            .map_err(|_| TransportError::DeviceNotFound(peripheral_id.to_string()))?;

        let adapter = BluetoothAdapter::GetDefaultAsync()
            .map_err(|_| TransportError::AdapterNotAvailable)?
            .await
            .map_err(|_| TransportError::AdapterNotAvailable)?;
        if !adapter.IsLowEnergySupported().unwrap_or(false) {
            return Err(TransportError::AdapterNotAvailable);
        }

        info!("Connecting to Bluetooth device: {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(connect_err)?
            .await
            .map_err(connect_err)?;

        info!("Device connected: {:?}", device.Name().ok());
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peripheral_id.to_string(), device.clone());

        Ok(WinRtPeer {
            peripheral_id: peripheral_id.to_string(),
            device,
            services: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn discover_services_and_characteristics(
        &self,
        peer: &WinRtPeer,
    ) -> Result<(), TransportError> {
        let services_result = peer
            .device
            .GetGattServicesAsync()
            .map_err(gatt_err)?
            .await
            .map_err(gatt_err)?;

        let status = services_result.Status().map_err(gatt_err)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services. Status: {:?}", status);
            return Err(TransportError::DiscoveryFailed(format!(
                "service query returned {:?}",
                status
            )));
        }

        let services = services_result.Services().map_err(gatt_err)?;
        let mut found = Vec::new();
        for i in 0..services.Size().map_err(gatt_err)? {
            found.push(services.GetAt(i).map_err(gatt_err)?);
        }
        info!("Found {} services on {}", found.len(), peer.peripheral_id);

        *peer.services.lock().unwrap_or_else(PoisonError::into_inner) = found;
        Ok(())
    }

    async fn monitor(
        &self,
        peer: &WinRtPeer,
        service_id: &str,
        characteristic_id: &str,
        on_notify: NotifyCallback,
    ) -> Result<Box<dyn TransportSubscription>, TransportError> {
        let characteristic = Self::find_characteristic(peer, service_id, characteristic_id).await?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(subscribe_err)?
            .await
            .map_err(subscribe_err)?;
        if status != GattCommunicationStatus::Success {
            warn!("Notification subscription returned status: {:?}", status);
            return Err(TransportError::SubscriptionFailed(format!("{:?}", status)));
        }

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match args.CharacteristicValue().and_then(|v| read_buffer(&v)) {
                        Ok(bytes) => on_notify(Ok(Some(bytes))),
                        Err(e) => on_notify(Err(TransportError::Other(e.to_string()))),
                    }
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&handler).map_err(subscribe_err)?;
        debug!("Notifications enabled on {}", peer.peripheral_id);

        Ok(Box::new(WinRtSubscription {
            characteristic,
            token,
        }))
    }

    async fn write_with_response(
        &self,
        peer: &WinRtPeer,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = Self::find_characteristic(peer, service_id, characteristic_id).await?;

        let buffer = {
            let writer = DataWriter::new().map_err(write_err)?;
            writer.WriteBytes(payload).map_err(write_err)?;
            writer.DetachBuffer().map_err(write_err)?
        };

        let status = characteristic
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)
            .map_err(write_err)?
            .await
            .map_err(write_err)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::WriteFailed(format!("{:?}", status)));
        }
        Ok(())
    }

    fn cancel_connection(&self, peripheral_id: &str) {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peripheral_id);
        if let Some(device) = device {
            if let Err(e) = device.Close() {
                warn!("Failed to close device {}: {}", peripheral_id, e);
            }
            info!("Closed connection to {}", peripheral_id);
        }
    }
}

struct WinRtSubscription {
    characteristic: GattCharacteristic,
    token: i64,
}

impl TransportSubscription for WinRtSubscription {
    fn cancel(&mut self) {
        if let Err(e) = self.characteristic.RemoveValueChanged(self.token) {
            warn!("Failed to remove notification handler: {}", e);
        }
        // Best effort; the device may already be gone
        let _ = self
            .characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            );
    }
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn scan_err(e: windows::core::Error) -> TransportError {
    TransportError::ScanFailed(e.to_string())
}

fn connect_err(e: windows::core::Error) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn gatt_err(e: windows::core::Error) -> TransportError {
    TransportError::DiscoveryFailed(e.to_string())
}

fn subscribe_err(e: windows::core::Error) -> TransportError {
    TransportError::SubscriptionFailed(e.to_string())
}

fn write_err(e: windows::core::Error) -> TransportError {
    TransportError::WriteFailed(e.to_string())
}

/// Parse a UUID string into a Windows GUID
pub fn parse_uuid(uuid_str: &str) -> Result<GUID, TransportError> {
    let invalid = || TransportError::Other(format!("invalid UUID: {}", uuid_str));
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 {
        return Err(invalid());
    }

    let d1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;

    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}
