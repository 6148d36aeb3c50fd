//! Bluetooth Module
//!
//! Provides BLE communication with the ESP32 IMU sensors.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                     │
//! │  (Main coordinator - command loop for the application)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!    ┌──────────────┬───┴──────────┬──────────────┐
//!    ▼              ▼              ▼              ▼
//! ┌─────────┐ ┌────────────┐ ┌───────────┐ ┌──────────┐
//! │ Scanner │ │  Session   │ │ Telemetry │ │   Sync   │
//! │         │ │  Manager   │ │           │ │          │
//! │ - scan  │ │ - connect  │ │ - notify  │ │ - time   │
//! │ - filter│ │ - discover │ │ - decode  │ │   writes │
//! └────┬────┘ └─────┬──────┘ └─────┬─────┘ └────┬─────┘
//!      └────────────┴──────┬───────┴────────────┘
//!                          ▼
//!                 ┌─────────────────┐     ┌──────────┐
//!                 │  BleTransport   │     │ Protocol │
//!                 │ (WinRT / mock)  │     │ - UUIDs  │
//!                 └─────────────────┘     │ - codec  │
//!                                         └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and the telemetry / sync wire formats
//! - [`transport`] - The radio abstraction every other module talks to
//! - [`mock`] - Scriptable in-memory transport
//! - [`scanner`] - BLE device discovery
//! - [`session`] - Connection lifecycle for up to two sensors
//! - [`telemetry`] - Notification subscription and frame decoding
//! - [`sync`] - Clock sync writes
//! - [`service`] - Main service coordinator

pub mod mock;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod sync;
pub mod telemetry;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main types for convenience
pub use service::BluetoothService;
pub use session::{SessionConfig, SessionManager, MAX_SESSIONS};
pub use transport::BleTransport;
