//! SensorDriver trait definition
//!
//! The driver is the hub's view of the hardware interface: one handle that
//! answers static metadata queries, accepts per-sensor configuration, and
//! pushes samples back through a registered [`EventListener`].

use crate::core::event::SensorEvent;
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode};
use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use std::sync::Arc;

/// Receives raw samples from a driver callback thread
pub trait EventListener: Send + Sync {
    /// Deposit one sample; must not block on delivery
    fn on_sample(&self, event: SensorEvent);

    /// The driver connection was re-established and per-channel batching
    /// state should start over
    fn on_connection_reset(&self) {}
}

/// Receives hot-plug notifications
pub trait PlugListener: Send + Sync {
    fn on_plug_event(&self, desc: SensorDescriptor, plugged_in: bool);
}

/// Liveness-loss notice sent by a driver whose remote end went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverDeath;

/// Device driver trait for the sensor hardware interface
pub trait SensorDriver: Send {
    /// Open the driver handle
    fn connect(&mut self) -> Result<()>;

    /// Static metadata for every sensor the driver exposes
    fn get_sensor_list(&mut self) -> Result<Vec<SensorInfo>>;

    fn enable(&mut self, desc: &SensorDescriptor) -> Result<()>;

    fn disable(&mut self, desc: &SensorDescriptor) -> Result<()>;

    fn set_batch(&mut self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()>;

    fn set_mode(&mut self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()>;

    /// Drain buffered samples; completion is signalled by a flush-complete sample
    fn flush(&mut self, desc: &SensorDescriptor) -> Result<()> {
        Err(Error::NotSupported(format!("flush on {}", desc)))
    }

    fn register_event_callback(&mut self, listener: Arc<dyn EventListener>) -> Result<()>;

    fn register_plug_callback(&mut self, listener: Arc<dyn PlugListener>) -> Result<()>;

    /// Arm the liveness watch: a [`DriverDeath`] is sent when the handle dies
    fn register_death_notifier(&mut self, notifier: Sender<DriverDeath>) -> Result<()>;

    /// Drop every registered callback
    fn unregister(&mut self) -> Result<()>;
}
