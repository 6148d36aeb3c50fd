use serde::{Deserialize, Serialize};
use std::fmt;

/// A radio peer reported by the transport during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: String,
    pub advertised_name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>, advertised_name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            advertised_name: advertised_name.map(str::to_string),
            rssi: None,
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn display_name(&self) -> &str {
        match self.advertised_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "Unknown",
        }
    }
}

/// Physical placement of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Discovering,
    Ready,
    Disconnecting,
    Closed,
}

impl SessionState {
    /// States that count against session capacity.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }
}

/// Snapshot of one logical connection to a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peripheral_id: String,
    pub side: Side,
    pub service_id: String,
    pub characteristic_id: String,
    pub state: SessionState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// One decoded IMU sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuReading {
    /// Sensor-local milliseconds
    pub timestamp_ms: u32,
    /// Acceleration in g
    pub accel: Vec3,
    /// Angular rate in deg/s
    pub gyro: Vec3,
    pub mag: Vec3,
    pub temperature_c: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

/// Events published to the UI collaborator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(PeripheralHandle),
    DevicesCleared,
    ScanStateChanged(bool),
    SessionStateChanged {
        peripheral_id: String,
        side: Side,
        state: SessionState,
    },
    Reading {
        peripheral_id: String,
        side: Side,
        reading: ImuReading,
    },
    SyncSent {
        peripheral_id: String,
        timestamp_ms: u32,
    },
    LogMessage(StatusMessage),
}

/// Commands accepted by the Bluetooth service loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    Connect { peripheral_id: String, side: Side },
    Disconnect(Option<String>),
    SendSync(Option<Side>),
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&Side::Left).unwrap(), "\"left\"");
        let side: Side = serde_json::from_str("\"right\"").unwrap();
        assert_eq!(side, Side::Right);
        assert_eq!(Side::Left.to_string(), "left");
    }

    #[test]
    fn test_live_states() {
        assert!(SessionState::Connecting.is_live());
        assert!(SessionState::Ready.is_live());
        assert!(!SessionState::Closed.is_live());
        assert!(!SessionState::Idle.is_live());
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(PeripheralHandle::new("a", None).display_name(), "Unknown");
        assert_eq!(PeripheralHandle::new("a", Some("  ")).display_name(), "Unknown");
        assert_eq!(
            PeripheralHandle::new("a", Some("ESP32-L")).display_name(),
            "ESP32-L"
        );
    }
}
