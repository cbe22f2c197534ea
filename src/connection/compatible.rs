//! Synthetic backend for sensor types the primary driver lacks
//!
//! Backed by a [`MockSensorDriver`] holding fixed-metadata sensors. When a
//! simulator config is supplied, enabled synthetic sensors produce samples
//! once a data report callback is registered.

use super::SensorConnection;
use crate::config::MockConfig;
use crate::core::driver::{EventListener, PlugListener, SensorDriver};
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode, sensor_type};
use crate::devices::mock::{MockSensorDriver, SensorSimulator};
use crate::error::Result;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sensor types the synthetic backend can stand in for
pub const COMPATIBLE_SENSOR_TYPES: [i32; 4] = [
    sensor_type::COLOR,
    sensor_type::SAR,
    sensor_type::HEADPOSTURE,
    sensor_type::PROXIMITY1,
];

const LOCAL_LOCATION: i32 = 1;

/// Fixed metadata for the synthetic sensors of `types` on `device_id`
///
/// Types outside [`COMPATIBLE_SENSOR_TYPES`] are ignored.
pub fn synthetic_sensors(device_id: i32, types: &[i32]) -> Vec<SensorInfo> {
    types
        .iter()
        .filter_map(|&t| {
            let (name, vendor) = match t {
                sensor_type::COLOR => ("sensor_color", "default_color"),
                sensor_type::SAR => ("sensor_sar", "default_sar"),
                sensor_type::HEADPOSTURE => ("sensor_headposture", "default_headposture"),
                sensor_type::PROXIMITY1 => ("sensor_proximity1", "default_proximity1"),
                _ => return None,
            };
            let desc = SensorDescriptor::new(device_id, t, 0, LOCAL_LOCATION);
            let mut info = SensorInfo::new(desc, name);
            info.vendor = vendor.to_string();
            info.version = "1.0.1".to_string();
            info.max_range = 9999.0;
            info.power = 20.0;
            info.resolution = 0.000001;
            info.min_sample_period_ns = 100_000_000;
            info.max_sample_period_ns = 1_000_000_000;
            if t == sensor_type::HEADPOSTURE {
                info.fifo_max_event_count = 5;
                info.mode = SensorMode::Realtime;
            } else {
                info.mode = SensorMode::OnChange;
            }
            Some(info)
        })
        .collect()
}

pub struct CompatibleConnection {
    driver: Mutex<MockSensorDriver>,
    simulation: Option<MockConfig>,
    simulator: Mutex<Option<SensorSimulator>>,
}

impl CompatibleConnection {
    pub fn new(sensors: Vec<SensorInfo>) -> Self {
        Self {
            driver: Mutex::new(MockSensorDriver::new(sensors)),
            simulation: None,
            simulator: Mutex::new(None),
        }
    }

    /// Generate samples for enabled sensors once a data report is registered
    pub fn with_simulation(mut self, config: MockConfig) -> Self {
        self.simulation = Some(config);
        self
    }

    /// Shared handle on the backing driver
    pub fn driver(&self) -> MockSensorDriver {
        self.driver.lock().clone()
    }
}

impl SensorConnection for CompatibleConnection {
    fn connect(&self) -> Result<()> {
        self.driver.lock().connect()?;
        info!("Compatible: Connected");
        Ok(())
    }

    fn get_sensor_list(&self) -> Result<Vec<SensorInfo>> {
        self.driver.lock().get_sensor_list()
    }

    fn enable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        self.driver.lock().enable(desc)
    }

    fn disable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        self.driver.lock().disable(desc)
    }

    fn set_batch(&self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()> {
        self.driver.lock().set_batch(desc, sampling_ns, delay_ns)
    }

    fn set_mode(&self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()> {
        self.driver.lock().set_mode(desc, mode)
    }

    fn flush(&self, desc: &SensorDescriptor) -> Result<()> {
        self.driver.lock().flush(desc)
    }

    fn register_data_report(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        let driver = {
            let mut driver = self.driver.lock();
            driver.register_event_callback(listener)?;
            driver.clone()
        };
        if let Some(config) = &self.simulation {
            let mut simulator = self.simulator.lock();
            if simulator.is_none() {
                *simulator = Some(SensorSimulator::spawn(driver, config)?);
            }
        }
        Ok(())
    }

    fn register_plug_callback(&self, listener: Arc<dyn PlugListener>) -> Result<()> {
        self.driver.lock().register_plug_callback(listener)
    }

    fn destroy(&self) -> Result<()> {
        if let Some(mut simulator) = self.simulator.lock().take() {
            simulator.shutdown()?;
        }
        self.driver.lock().unregister()
    }
}
