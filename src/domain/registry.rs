//! Discovered Peripheral Registry
//!
//! Keeps the peripherals seen during a scan cycle, in first-discovery order,
//! filtered down to the target device family.

use crate::domain::models::PeripheralHandle;
use tracing::debug;

pub struct DeviceRegistry {
    devices: Vec<PeripheralHandle>,
    marker: String,
}

impl DeviceRegistry {
    /// `marker` is matched case-insensitively against the advertised name
    pub fn new(marker: &str) -> Self {
        Self {
            devices: Vec::new(),
            marker: marker.trim().to_lowercase(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Record a discovery event. Returns true if the handle was appended.
    pub fn on_discovered(&mut self, handle: PeripheralHandle) -> bool {
        if !self.matches(&handle) {
            return false;
        }

        if self.devices.iter().any(|d| d.id == handle.id) {
            return false;
        }

        debug!("Found device: {} ({})", handle.display_name(), handle.id);
        self.devices.push(handle);
        true
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn devices(&self) -> &[PeripheralHandle] {
        &self.devices
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralHandle> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn matches(&self, handle: &PeripheralHandle) -> bool {
        match handle.advertised_name.as_deref() {
            Some(name) => name.trim().to_lowercase().contains(&self.marker),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, name: Option<&str>) -> PeripheralHandle {
        PeripheralHandle::new(id, name)
    }

    #[test]
    fn test_filters_by_marker() {
        let mut registry = DeviceRegistry::new("esp32");
        assert!(registry.on_discovered(handle("a", Some("MyESP32Sensor"))));
        assert!(!registry.on_discovered(handle("b", Some("RandomGadget"))));
        assert!(!registry.on_discovered(handle("c", None)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.devices()[0].id, "a");
    }

    #[test]
    fn test_marker_is_normalized() {
        let mut registry = DeviceRegistry::new("  ESP32 ");
        assert_eq!(registry.marker(), "esp32");
        assert!(registry.on_discovered(handle("a", Some("  esp32-left  "))));
    }

    #[test]
    fn test_deduplicates_by_id() {
        let mut registry = DeviceRegistry::new("ESP32");
        assert!(registry.on_discovered(handle("a", Some("esp32-left"))));
        assert!(!registry.on_discovered(handle("a", Some("esp32-left"))));
        // Same id with a different name is still the same peripheral
        assert!(!registry.on_discovered(handle("a", Some("esp32-renamed"))));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("a").and_then(|d| d.advertised_name.as_deref()),
            Some("esp32-left")
        );
    }

    #[test]
    fn test_preserves_discovery_order_and_clear() {
        let mut registry = DeviceRegistry::new("esp32");
        registry.on_discovered(handle("z", Some("ESP32 right")));
        registry.on_discovered(handle("a", Some("  esp32 left  ")));
        let ids: Vec<_> = registry.devices().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.on_discovered(handle("z", Some("ESP32 right"))));
    }
}
