//! Merges the primary and compatible backends behind one connection
//!
//! Sensor types in the compatible backend's list are routed there; every
//! other descriptor goes to the primary. If the primary driver can't be
//! reached and the compatible backend is allowed, the compatible backend
//! takes over as primary with the full synthetic sensor set.

use super::{COMPATIBLE_SENSOR_TYPES, SensorConnection};
use crate::core::driver::{EventListener, PlugListener};
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode};
use crate::error::{Error, Result};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Device id assumed when no local sensor identifies the device
const DEFAULT_DEVICE_ID: i32 = 1;
const LOCAL_LOCATION: i32 = 1;

pub struct ConnectionFacade {
    primary: Box<dyn SensorConnection>,
    compatible: Option<Box<dyn SensorConnection>>,
    /// Sensor types owned by the compatible backend
    compatible_types: Mutex<BTreeSet<i32>>,
    sensors: Mutex<Vec<SensorInfo>>,
}

impl ConnectionFacade {
    /// Connect the primary and, when `compatible_enabled`, a compatible backend
    ///
    /// `make_compatible(device_id, types)` builds the compatible backend for
    /// the synthetic sensor types that should be exposed on `device_id`.
    pub fn connect<F>(
        primary: Box<dyn SensorConnection>,
        make_compatible: F,
        compatible_enabled: bool,
    ) -> Result<Self>
    where
        F: FnOnce(i32, &[i32]) -> Box<dyn SensorConnection>,
    {
        let primary_result = primary
            .connect()
            .and_then(|()| primary.get_sensor_list());

        let (primary, compatible, mut sensors) = match primary_result {
            Ok(sensors) => {
                let compatible = if compatible_enabled {
                    let device_id = local_device_id(&sensors);
                    let missing: Vec<i32> = COMPATIBLE_SENSOR_TYPES
                        .iter()
                        .copied()
                        .filter(|t| !sensors.iter().any(|s| s.desc.sensor_type == *t))
                        .collect();
                    if missing.is_empty() {
                        None
                    } else {
                        let backend = make_compatible(device_id, &missing);
                        match backend.connect() {
                            Ok(()) => Some(backend),
                            Err(e) => {
                                error!("Facade: Compatible backend connect failed: {}", e);
                                None
                            }
                        }
                    }
                } else {
                    None
                };
                (primary, compatible, sensors)
            }
            Err(e) if compatible_enabled => {
                warn!(
                    "Facade: Primary driver unavailable ({}), using compatible backend",
                    e
                );
                let fallback = make_compatible(DEFAULT_DEVICE_ID, &COMPATIBLE_SENSOR_TYPES);
                fallback.connect()?;
                let sensors = fallback.get_sensor_list()?;
                (fallback, None, sensors)
            }
            Err(e) => return Err(e),
        };

        let mut compatible_types = BTreeSet::new();
        if let Some(backend) = &compatible {
            for info in backend.get_sensor_list()? {
                if !sensors.iter().any(|s| s.desc == info.desc) {
                    compatible_types.insert(info.desc.sensor_type);
                    sensors.push(info);
                }
            }
        }

        info!(
            "Facade: {} sensors ({} synthetic)",
            sensors.len(),
            compatible_types.len()
        );
        Ok(Self {
            primary,
            compatible,
            compatible_types: Mutex::new(compatible_types),
            sensors: Mutex::new(sensors),
        })
    }

    fn backend_for(&self, desc: &SensorDescriptor) -> &dyn SensorConnection {
        if let Some(compatible) = &self.compatible {
            if self.compatible_types.lock().contains(&desc.sensor_type) {
                return compatible.as_ref();
            }
        }
        self.primary.as_ref()
    }

    pub fn has_compatible_backend(&self) -> bool {
        self.compatible.is_some()
    }

    pub fn is_compatible_sensor(&self, desc: &SensorDescriptor) -> bool {
        self.compatible.is_some() && self.compatible_types.lock().contains(&desc.sensor_type)
    }

    /// Merged sensor list
    pub fn get_sensor_list(&self) -> Vec<SensorInfo> {
        self.sensors.lock().clone()
    }

    /// Re-query the primary for one device and merge sensors not yet known
    ///
    /// Returns the device's sensors as reported by the driver.
    pub fn get_sensor_list_by_device(&self, device_id: i32) -> Result<Vec<SensorInfo>> {
        let device_sensors: Vec<SensorInfo> = self
            .primary
            .get_sensor_list()?
            .into_iter()
            .filter(|s| s.desc.device_id == device_id)
            .collect();
        let mut sensors = self.sensors.lock();
        for info in &device_sensors {
            if !sensors.iter().any(|s| s.desc == info.desc) {
                sensors.push(info.clone());
            }
        }
        Ok(device_sensors)
    }

    /// Forget a sensor that was unplugged
    ///
    /// Returns false if the sensor wasn't in the merged list.
    pub fn plug_erase_sensor(&self, desc: &SensorDescriptor) -> bool {
        let removed = {
            let mut sensors = self.sensors.lock();
            let before = sensors.len();
            sensors.retain(|s| s.desc != *desc);
            sensors.len() != before
        };
        self.compatible_types.lock().remove(&desc.sensor_type);
        removed
    }

    pub fn enable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        self.backend_for(desc).enable_sensor(desc)
    }

    /// A timed-out disable counts as done
    pub fn disable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        match self.backend_for(desc).disable_sensor(desc) {
            Err(Error::Timeout) => {
                warn!("Facade: Disable of {} timed out, treating as disabled", desc);
                Ok(())
            }
            other => other,
        }
    }

    pub fn set_batch(&self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()> {
        self.backend_for(desc).set_batch(desc, sampling_ns, delay_ns)
    }

    pub fn set_mode(&self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()> {
        self.backend_for(desc).set_mode(desc, mode)
    }

    pub fn flush(&self, desc: &SensorDescriptor) -> Result<()> {
        self.backend_for(desc).flush(desc)
    }

    /// Register on both backends; the primary's result is returned
    pub fn register_data_report(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        let result = self.primary.register_data_report(Arc::clone(&listener));
        if let Err(e) = &result {
            error!("Facade: Register data report failed: {}", e);
        }
        if let Some(compatible) = &self.compatible {
            if let Err(e) = compatible.register_data_report(listener) {
                error!("Facade: Register data report failed in compatible: {}", e);
            }
        }
        result
    }

    pub fn register_plug_callback(&self, listener: Arc<dyn PlugListener>) -> Result<()> {
        let result = self.primary.register_plug_callback(Arc::clone(&listener));
        if let Err(e) = &result {
            error!("Facade: Register plug callback failed: {}", e);
        }
        if let Some(compatible) = &self.compatible {
            if let Err(e) = compatible.register_plug_callback(listener) {
                error!("Facade: Register plug callback failed in compatible: {}", e);
            }
        }
        result
    }

    pub fn destroy(&self) -> Result<()> {
        let result = self.primary.destroy();
        if let Some(compatible) = &self.compatible {
            if let Err(e) = compatible.destroy() {
                error!("Facade: Destroy failed in compatible: {}", e);
            }
        }
        result
    }
}

/// Device id of the first local sensor
fn local_device_id(sensors: &[SensorInfo]) -> i32 {
    sensors
        .iter()
        .find(|s| s.desc.location == LOCAL_LOCATION)
        .map(|s| s.desc.device_id)
        .unwrap_or(DEFAULT_DEVICE_ID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::connection::{CompatibleConnection, HdiConnection, synthetic_sensors};
    use crate::core::types::sensor_type;
    use crate::devices::mock::{DriverCall, DriverOp, MockSensorDriver};

    const ACCEL: SensorDescriptor = SensorDescriptor::new(3, sensor_type::ACCELEROMETER, 0, 1);
    const SAR_PRIMARY: SensorDescriptor = SensorDescriptor::new(3, sensor_type::SAR, 0, 1);

    fn config() -> DriverConfig {
        DriverConfig {
            connect_retries: 2,
            retry_interval_ms: 1,
            ..DriverConfig::default()
        }
    }

    fn primary(sensors: Vec<SensorInfo>) -> (MockSensorDriver, Box<dyn SensorConnection>) {
        let mock = MockSensorDriver::new(sensors);
        let conn = HdiConnection::new(Box::new(mock.clone()), &config());
        (mock, Box::new(conn))
    }

    fn make_compatible(
        slot: Arc<Mutex<Option<MockSensorDriver>>>,
    ) -> impl FnOnce(i32, &[i32]) -> Box<dyn SensorConnection> {
        move |device_id: i32, types: &[i32]| {
            let conn = CompatibleConnection::new(synthetic_sensors(device_id, types));
            *slot.lock() = Some(conn.driver());
            Box::new(conn)
        }
    }

    #[test]
    fn test_merges_missing_synthetic_sensors() {
        let (_mock, primary) = primary(vec![
            SensorInfo::new(ACCEL, "accel"),
            SensorInfo::new(SAR_PRIMARY, "sar"),
        ]);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot.clone()), true).unwrap();

        let sensors = facade.get_sensor_list();
        // accel + primary SAR + COLOR, HEADPOSTURE, PROXIMITY1
        assert_eq!(sensors.len(), 5);
        assert_eq!(
            sensors
                .iter()
                .filter(|s| s.desc.sensor_type == sensor_type::SAR)
                .count(),
            1
        );
        // Synthetic sensors live on the local device
        let color = sensors
            .iter()
            .find(|s| s.desc.sensor_type == sensor_type::COLOR)
            .unwrap();
        assert_eq!(color.desc.device_id, 3);
        assert!(facade.is_compatible_sensor(&color.desc));
        assert!(!facade.is_compatible_sensor(&SAR_PRIMARY));
    }

    #[test]
    fn test_routes_by_sensor_type() {
        let (mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot.clone()), true).unwrap();
        let compat = slot.lock().clone().unwrap();

        let color = SensorDescriptor::new(3, sensor_type::COLOR, 0, 1);
        facade.set_batch(&color, 100_000_000, 0).unwrap();
        facade.enable_sensor(&color).unwrap();
        facade.set_batch(&ACCEL, 10, 0).unwrap();
        facade.enable_sensor(&ACCEL).unwrap();

        assert!(compat.is_hw_enabled(&color));
        assert!(!compat.calls().contains(&DriverCall::Enable(ACCEL)));
        assert!(mock.is_hw_enabled(&ACCEL));
        assert!(!mock.calls().contains(&DriverCall::Enable(color)));
    }

    #[test]
    fn test_compatible_disabled() {
        let (_mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot.clone()), false).unwrap();
        assert!(!facade.has_compatible_backend());
        assert_eq!(facade.get_sensor_list().len(), 1);
        assert!(slot.lock().is_none());
    }

    #[test]
    fn test_fallback_when_primary_unreachable() {
        let (mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        mock.fail_next_connects(10);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot.clone()), true).unwrap();
        assert!(!facade.has_compatible_backend());
        assert_eq!(facade.get_sensor_list().len(), COMPATIBLE_SENSOR_TYPES.len());
    }

    #[test]
    fn test_connect_fails_without_fallback() {
        let (mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        mock.fail_next_connects(10);
        let slot = Arc::new(Mutex::new(None));
        let result = ConnectionFacade::connect(primary, make_compatible(slot), false);
        assert!(matches!(result, Err(Error::ConnectFailed { .. })));
    }

    #[test]
    fn test_disable_timeout_is_success() {
        let (mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot), false).unwrap();
        mock.timeout_op(DriverOp::Disable, Some(ACCEL));
        assert!(facade.disable_sensor(&ACCEL).is_ok());
        mock.clear_failures();
        mock.fail_op(DriverOp::Disable, Some(ACCEL));
        assert!(matches!(
            facade.disable_sensor(&ACCEL),
            Err(Error::DriverCallFailed(_))
        ));
    }

    #[test]
    fn test_plug_erase_and_requery() {
        let (mock, primary) = primary(vec![SensorInfo::new(ACCEL, "accel")]);
        let slot = Arc::new(Mutex::new(None));
        let facade = ConnectionFacade::connect(primary, make_compatible(slot), false).unwrap();
        assert!(facade.plug_erase_sensor(&ACCEL));
        assert!(!facade.plug_erase_sensor(&ACCEL));
        assert!(facade.get_sensor_list().is_empty());

        let extra = SensorDescriptor::new(9, sensor_type::GYROSCOPE, 0, 2);
        mock.plug(SensorInfo::new(extra, "remote gyro"), true);
        let device = facade.get_sensor_list_by_device(9).unwrap();
        assert_eq!(device.len(), 1);
        assert_eq!(facade.get_sensor_list().len(), 1);
    }
}
