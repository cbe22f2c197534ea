//! Configuration for the Indriya sensor hub
//!
//! Loads configuration from a TOML file. Every section and field has a
//! default, so an empty file (or no file at all) yields a working hub
//! backed by the simulated driver.
//!
//! ```toml
//! [driver]
//! connect_retries = 25
//! retry_interval_ms = 200
//!
//! [transport]
//! send_retry_limit = 32
//! send_retry_sleep_us = 10000
//!
//! [[mock.sensors]]
//! sensor_type = 1
//! name = "accelerometer"
//! ```

use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode, sensor_type};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level hub configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    pub driver: DriverConfig,
    pub delivery: DeliveryConfig,
    pub transport: TransportConfig,
    pub mock: MockConfig,
    pub logging: LoggingConfig,
}

/// Driver connection policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Driver backend ("mock" is the only built-in one)
    pub backend: String,
    /// Connect attempts before giving up
    pub connect_retries: u32,
    /// Sleep between connect attempts (milliseconds)
    pub retry_interval_ms: u64,
    /// Upper bound on the sensor list accepted from the driver
    pub max_sensor_count: usize,
    /// Bring up the synthetic backend for sensor types the driver lacks
    pub compatible_backend: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: "mock".to_string(),
            connect_retries: 25,
            retry_interval_ms: 200,
            max_sensor_count: 256,
            compatible_backend: true,
        }
    }
}

/// Delivery thread and fan-out tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Capacity of the circular buffer between driver callback and delivery thread
    pub event_buffer_len: usize,
    /// Largest accepted `max_report_delay / sampling_period` ratio
    pub max_event_count: i64,
    /// Samples kept per sensor for diagnostic dumps
    pub dump_queue_len: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            event_buffer_len: 1024,
            max_event_count: 1000,
            dump_queue_len: 10,
        }
    }
}

/// Socket transport tuning for data channels and active-info sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Active-info send attempts on EAGAIN/EINTR/EWOULDBLOCK
    pub send_retry_limit: u32,
    /// Sleep between active-info send attempts (microseconds)
    pub send_retry_sleep_us: u64,
    /// SO_SNDBUF/SO_RCVBUF for active-info socket pairs
    pub socket_buf_size: usize,
    /// Socket buffer size granted to native (system) clients
    pub native_socket_buf_size: usize,
    /// Data-channel send attempts
    pub channel_send_retry_limit: u32,
    /// Sleep between data-channel send attempts (microseconds)
    pub channel_send_retry_sleep_us: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_retry_limit: 32,
            send_retry_sleep_us: 10_000,
            socket_buf_size: 32 * 1024,
            native_socket_buf_size: 64 * 1024,
            channel_send_retry_limit: 5,
            channel_send_retry_sleep_us: 500,
        }
    }
}

/// Simulated driver used when no hardware backend is wired in
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MockConfig {
    /// Device id reported for every simulated sensor
    pub device_id: i32,
    /// Simulation tick (milliseconds)
    pub tick_ms: u64,
    /// Noise seed for simulated samples (0 = random)
    pub random_seed: u64,
    /// Gaussian noise stddev added to every simulated axis
    pub noise_stddev: f32,
    pub sensors: Vec<MockSensorSpec>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            tick_ms: 5,
            random_seed: 0,
            noise_stddev: 0.02,
            sensors: vec![
                MockSensorSpec::continuous(sensor_type::ACCELEROMETER, "accelerometer"),
                MockSensorSpec::continuous(sensor_type::GYROSCOPE, "gyroscope"),
                MockSensorSpec::continuous(sensor_type::MAGNETIC_FIELD, "magnetic_field"),
                MockSensorSpec::on_change(sensor_type::AMBIENT_LIGHT, "ambient_light"),
                MockSensorSpec::on_change(sensor_type::PROXIMITY, "proximity"),
                MockSensorSpec::on_change(sensor_type::PEDOMETER, "pedometer"),
            ],
        }
    }
}

/// One simulated sensor
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MockSensorSpec {
    pub sensor_type: i32,
    #[serde(default)]
    pub sensor_id: i32,
    #[serde(default = "default_location")]
    pub location: i32,
    pub name: String,
    #[serde(default = "default_min_period_ns")]
    pub min_sample_period_ns: i64,
    #[serde(default = "default_max_period_ns")]
    pub max_sample_period_ns: i64,
    #[serde(default)]
    pub fifo_max_event_count: i32,
    #[serde(default)]
    pub mode: SensorMode,
}

fn default_location() -> i32 {
    1
}

fn default_min_period_ns() -> i64 {
    5_000_000
}

fn default_max_period_ns() -> i64 {
    1_000_000_000
}

impl MockSensorSpec {
    fn continuous(sensor_type: i32, name: &str) -> Self {
        Self {
            sensor_type,
            sensor_id: 0,
            location: default_location(),
            name: name.to_string(),
            min_sample_period_ns: default_min_period_ns(),
            max_sample_period_ns: default_max_period_ns(),
            fifo_max_event_count: 100,
            mode: SensorMode::Realtime,
        }
    }

    fn on_change(sensor_type: i32, name: &str) -> Self {
        Self {
            mode: SensorMode::OnChange,
            fifo_max_event_count: 0,
            ..Self::continuous(sensor_type, name)
        }
    }

    /// Metadata the simulated driver reports for this sensor
    pub fn to_sensor_info(&self, device_id: i32) -> SensorInfo {
        let desc = SensorDescriptor::new(device_id, self.sensor_type, self.sensor_id, self.location);
        SensorInfo {
            min_sample_period_ns: self.min_sample_period_ns,
            max_sample_period_ns: self.max_sample_period_ns,
            fifo_max_event_count: self.fifo_max_event_count,
            mode: self.mode,
            vendor: "indriya-sim".to_string(),
            ..SensorInfo::new(desc, &self.name)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Interval between stats log lines (seconds, 0 disables)
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval_secs: 30,
        }
    }
}

impl HubConfig {
    /// Load configuration from TOML file
    ///
    /// # Arguments
    /// - `path`: Path to TOML configuration file
    ///
    /// # Returns
    /// Parsed configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
