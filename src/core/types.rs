//! Core data types for sensors, subscriptions and notifications.
//!
//! Key types:
//! - [`SensorDescriptor`]: Composite key for one sensor instance on one device
//! - [`SensorRate`]: Requested cadence of one subscriber (or of the hardware)
//! - [`SensorInfo`]: Static metadata reported by the driver
//! - [`ActiveInfo`]: "Who is sampling what" record pushed to observers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sensor type identifiers used by the hub itself
///
/// Only the types with special handling are listed; any other `i32` is a
/// valid sensor type as long as the driver reports it.
pub mod sensor_type {
    pub const INVALID: i32 = -1;
    pub const ACCELEROMETER: i32 = 1;
    pub const GYROSCOPE: i32 = 2;
    pub const AMBIENT_LIGHT: i32 = 5;
    pub const MAGNETIC_FIELD: i32 = 6;
    pub const PROXIMITY: i32 = 12;
    pub const COLOR: i32 = 14;
    pub const SAR: i32 = 15;
    pub const PROXIMITY1: i32 = 16;
    pub const HEADPOSTURE: i32 = 20;
    pub const PEDOMETER_DETECTION: i32 = 265;
    pub const PEDOMETER: i32 = 266;
    pub const HEART_RATE: i32 = 278;
}

/// Identifies one physical sensor instance on one device
///
/// Value-equal, hashable and ordered so it can key both hash maps and the
/// ordered replay table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub device_id: i32,
    pub sensor_type: i32,
    pub sensor_id: i32,
    pub location: i32,
}

impl SensorDescriptor {
    pub const fn new(device_id: i32, sensor_type: i32, sensor_id: i32, location: i32) -> Self {
        Self {
            device_id,
            sensor_type,
            sensor_id,
            location,
        }
    }

    /// A descriptor with the invalid sensor type is never accepted
    pub fn is_valid(&self) -> bool {
        self.sensor_type != sensor_type::INVALID
    }
}

impl fmt::Display for SensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.device_id, self.sensor_type, self.sensor_id, self.location
        )
    }
}

/// One subscriber's (or the hardware's) requested cadence
///
/// `max_report_delay_ns / sampling_period_ns` bounds the batching depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorRate {
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
    pub enabled: bool,
}

impl SensorRate {
    /// Enabled rate
    pub const fn new(sampling_period_ns: i64, max_report_delay_ns: i64) -> Self {
        Self {
            sampling_period_ns,
            max_report_delay_ns,
            enabled: true,
        }
    }

    /// "No subscriber" sentinel returned by best-rate queries on an empty sensor
    pub const fn unbounded() -> Self {
        Self {
            sampling_period_ns: i64::MAX,
            max_report_delay_ns: i64::MAX,
            enabled: false,
        }
    }

    /// True for the sentinel returned by [`SensorRate::unbounded`]
    pub fn is_unbounded(&self) -> bool {
        self.sampling_period_ns == i64::MAX && self.max_report_delay_ns == i64::MAX
    }
}

impl Default for SensorRate {
    fn default() -> Self {
        Self {
            sampling_period_ns: 0,
            max_report_delay_ns: 0,
            enabled: false,
        }
    }
}

/// Data reporting mode declared by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum SensorMode {
    #[default]
    Default = 0,
    Realtime = 1,
    OnChange = 2,
    OneShot = 3,
    Fifo = 4,
}

impl SensorMode {
    /// Decode the on-wire mode value
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(SensorMode::Default),
            1 => Some(SensorMode::Realtime),
            2 => Some(SensorMode::OnChange),
            3 => Some(SensorMode::OneShot),
            4 => Some(SensorMode::Fifo),
            _ => None,
        }
    }

    /// On-change and one-shot sensors bypass rate arbitration and batching
    pub fn is_continuous(&self) -> bool {
        !matches!(self, SensorMode::OnChange | SensorMode::OneShot)
    }
}

/// Static sensor metadata as reported by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub desc: SensorDescriptor,
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub power: f32,
    pub max_range: f32,
    pub resolution: f32,
    pub min_sample_period_ns: i64,
    pub max_sample_period_ns: i64,
    /// Hardware FIFO depth; 0 means the sensor does not batch
    pub fifo_max_event_count: i32,
    pub mode: SensorMode,
}

impl SensorInfo {
    /// Minimal metadata entry, mostly useful in tests and simulated drivers
    pub fn new(desc: SensorDescriptor, name: &str) -> Self {
        Self {
            desc,
            name: name.to_string(),
            vendor: "indriya".to_string(),
            version: "1.0.0".to_string(),
            power: 0.0,
            max_range: 0.0,
            resolution: 0.0,
            min_sample_period_ns: 0,
            max_sample_period_ns: 0,
            fifo_max_event_count: 0,
            mode: SensorMode::Default,
        }
    }
}

/// Per-pid identity recorded when a client registers its data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppThreadInfo {
    pub pid: i32,
    pub uid: i32,
    pub access_token: u32,
}

/// "Pid X samples sensor Y at rate Z" notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInfo {
    pub pid: i32,
    pub device_id: i32,
    pub sensor_type: i32,
    pub sensor_id: i32,
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

impl ActiveInfo {
    /// Encoded payload size: four i32 followed by two i64, little-endian
    pub const ENCODED_LEN: usize = 4 * 4 + 2 * 8;

    pub fn new(pid: i32, desc: &SensorDescriptor, rate: &SensorRate) -> Self {
        Self {
            pid,
            device_id: desc.device_id,
            sensor_type: desc.sensor_type,
            sensor_id: desc.sensor_id,
            sampling_period_ns: rate.sampling_period_ns,
            max_report_delay_ns: rate.max_report_delay_ns,
        }
    }

    /// Append the little-endian payload to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.sensor_type.to_le_bytes());
        out.extend_from_slice(&self.sensor_id.to_le_bytes());
        out.extend_from_slice(&self.sampling_period_ns.to_le_bytes());
        out.extend_from_slice(&self.max_report_delay_ns.to_le_bytes());
    }

    /// Decode a payload produced by [`ActiveInfo::encode_into`]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        let i32_at = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let i64_at = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[i..i + 8]);
            i64::from_le_bytes(raw)
        };
        Some(Self {
            pid: i32_at(0),
            device_id: i32_at(4),
            sensor_type: i32_at(8),
            sensor_id: i32_at(12),
            sampling_period_ns: i64_at(16),
            max_report_delay_ns: i64_at(24),
        })
    }
}
