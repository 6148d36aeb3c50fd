//! Host-side link to a pair of ESP32 IMU sensors over Bluetooth Low Energy.

pub mod domain;
pub mod infrastructure;

pub use domain::errors::{ConnectError, DecodeError, SyncError, TelemetryError, TransportError};
pub use domain::models::{AppEvent, BluetoothCommand, ImuReading, PeripheralHandle, Session, SessionState, Side};
pub use infrastructure::bluetooth::BluetoothService;
