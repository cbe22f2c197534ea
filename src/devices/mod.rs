//! Driver backends

pub mod mock;

use crate::config::HubConfig;
use crate::core::driver::SensorDriver;
use crate::error::{Error, Result};
use mock::MockSensorDriver;

/// A driver ready to hand to the hub, plus the simulated handle when it is one
pub struct CreatedDriver {
    pub driver: Box<dyn SensorDriver>,
    /// Drives [`mock::SensorSimulator`]; `None` for real hardware
    pub simulated: Option<MockSensorDriver>,
}

/// Create a sensor driver based on configuration
pub fn create_driver(config: &HubConfig) -> Result<CreatedDriver> {
    match config.driver.backend.as_str() {
        "mock" => {
            let sensors = config
                .mock
                .sensors
                .iter()
                .map(|spec| spec.to_sensor_info(config.mock.device_id))
                .collect();
            let driver = MockSensorDriver::new(sensors);
            Ok(CreatedDriver {
                driver: Box::new(driver.clone()),
                simulated: Some(driver),
            })
        }
        other => Err(Error::InvalidParameter(format!(
            "unknown driver backend: {}",
            other
        ))),
    }
}
