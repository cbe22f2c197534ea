//! Core abstractions shared by every hub component.
//!
//! - [`driver::SensorDriver`]: Trait to implement for new sensor hardware
//! - [`event`]: Raw samples and their channel record
//! - [`types`]: Descriptors, rates, metadata and notifications

pub mod driver;
pub mod event;
pub mod types;

pub use event::SensorEvent;
pub use types::{SensorDescriptor, SensorInfo, SensorMode, SensorRate};
