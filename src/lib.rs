//! Indriya - sensor hub library
//!
//! Multiplexes many client subscriptions onto one sensor driver connection.
//! Each client asks for its own sampling period and batching delay; the hub
//! programs the hardware at the fastest requested rate, then downsamples and
//! batches the raw stream per client before writing it to the client's
//! socket.
//!
//! ## Layout
//!
//! - [`connection`]: driver connections with reconnect and state replay
//! - [`registry`]: who subscribes to what, and where samples go
//! - [`fanout`]: per-sample rate arbitration and batching on the delivery thread
//! - [`power`]: per-process suspend/resume
//! - [`active_info`]: out-of-band "who samples what" notifications
//! - [`hub`]: the service context tying it all together

pub mod active_info;
pub mod app;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod connection;
pub mod core;
pub mod devices;
pub mod error;
pub mod fanout;
pub mod flush;
pub mod hub;
pub mod power;
pub mod registry;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use config::HubConfig;
pub use core::{SensorDescriptor, SensorEvent, SensorInfo, SensorMode, SensorRate};
pub use error::{Error, Result};
pub use hub::{AccessControl, AllowAll, SensorHub};
