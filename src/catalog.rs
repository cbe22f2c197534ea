//! Static metadata of every sensor the hub exposes

use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Sensor list as reported by the connected backends
///
/// Also remembers the reporting mode of each sensor, which the fan-out
/// path consults on every sample.
#[derive(Default)]
pub struct SensorCatalog {
    sensors: Mutex<BTreeMap<SensorDescriptor, SensorInfo>>,
}

impl SensorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list
    pub fn replace_all(&self, list: Vec<SensorInfo>) {
        let mut sensors = self.sensors.lock();
        sensors.clear();
        sensors.extend(list.into_iter().map(|info| (info.desc, info)));
    }

    /// Add or update one sensor (hot-plug)
    pub fn insert(&self, info: SensorInfo) {
        self.sensors.lock().insert(info.desc, info);
    }

    pub fn remove(&self, desc: &SensorDescriptor) -> Option<SensorInfo> {
        self.sensors.lock().remove(desc)
    }

    pub fn get(&self, desc: &SensorDescriptor) -> Option<SensorInfo> {
        self.sensors.lock().get(desc).cloned()
    }

    pub fn contains(&self, desc: &SensorDescriptor) -> bool {
        self.sensors.lock().contains_key(desc)
    }

    pub fn mode(&self, desc: &SensorDescriptor) -> Option<SensorMode> {
        self.sensors.lock().get(desc).map(|info| info.mode)
    }

    /// Record the mode a sample reported for its sensor; returns false if unknown
    pub fn set_mode(&self, desc: &SensorDescriptor, mode: SensorMode) -> bool {
        match self.sensors.lock().get_mut(desc) {
            Some(info) => {
                info.mode = mode;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<SensorInfo> {
        self.sensors.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sensors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_operations() {
        let catalog = SensorCatalog::new();
        let a = SensorDescriptor::new(1, 1, 0, 1);
        let b = SensorDescriptor::new(1, 2, 0, 1);
        catalog.replace_all(vec![SensorInfo::new(b, "gyro"), SensorInfo::new(a, "accel")]);

        assert_eq!(catalog.len(), 2);
        // Ordered by descriptor
        assert_eq!(catalog.list()[0].name, "accel");
        assert!(catalog.set_mode(&a, SensorMode::OnChange));
        assert_eq!(catalog.mode(&a), Some(SensorMode::OnChange));
        assert!(!catalog.set_mode(&SensorDescriptor::new(9, 9, 9, 9), SensorMode::Realtime));

        catalog.remove(&a);
        assert!(!catalog.contains(&a));
        assert!(catalog.get(&b).is_some());
    }
}
