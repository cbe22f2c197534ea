//! Driver connections
//!
//! - [`HdiConnection`]: the primary driver, with connect retries, a liveness
//!   watcher and per-sensor state replay after reconnect
//! - [`CompatibleConnection`]: synthetic backend for sensor types the primary
//!   driver does not expose
//! - [`ConnectionFacade`]: merges both and routes per-sensor calls

mod compatible;
mod facade;
mod hdi;

pub use compatible::{COMPATIBLE_SENSOR_TYPES, CompatibleConnection, synthetic_sensors};
pub use facade::ConnectionFacade;
pub use hdi::HdiConnection;

use crate::core::driver::{EventListener, PlugListener};
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode};
use crate::error::Result;
use std::sync::Arc;

/// One backend behind the facade
///
/// Methods take `&self`; implementations serialize driver access internally
/// so RPC threads and the liveness watcher can share a connection.
pub trait SensorConnection: Send + Sync {
    fn connect(&self) -> Result<()>;

    fn get_sensor_list(&self) -> Result<Vec<SensorInfo>>;

    fn enable_sensor(&self, desc: &SensorDescriptor) -> Result<()>;

    fn disable_sensor(&self, desc: &SensorDescriptor) -> Result<()>;

    fn set_batch(&self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()>;

    fn set_mode(&self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()>;

    fn flush(&self, desc: &SensorDescriptor) -> Result<()>;

    fn register_data_report(&self, listener: Arc<dyn EventListener>) -> Result<()>;

    fn register_plug_callback(&self, listener: Arc<dyn PlugListener>) -> Result<()>;

    /// Unregister callbacks and stop any background threads
    fn destroy(&self) -> Result<()>;
}
