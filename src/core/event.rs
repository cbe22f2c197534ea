//! Raw sensor samples and their fixed-size channel record
//!
//! Samples travel to client data channels without any framing header: a
//! batch of `n` samples is written as `n * SENSOR_RECORD_SIZE` bytes.
//!
//! ```text
//! offset  size  field
//!      0     4  device_id     (i32 LE)
//!      4     4  sensor_type   (i32 LE)
//!      8     4  sensor_id     (i32 LE)
//!     12     4  location      (i32 LE)
//!     16     4  version       (i32 LE)
//!     20     4  mode          (i32 LE)
//!     24     8  timestamp_ns  (i64 LE)
//!     32     4  option        (u32 LE)
//!     36     4  data_len      (u32 LE, <= 64)
//!     40    64  data          (zero padded)
//! ```

use crate::core::types::{SensorDescriptor, SensorMode};
use crate::error::{Error, Result};

/// Payload bytes carried by one record
pub const SENSOR_DATA_CAPACITY: usize = 64;

/// Size of one encoded sample record
pub const SENSOR_RECORD_SIZE: usize = 40 + SENSOR_DATA_CAPACITY;

/// Option bit marking the "flush complete" sentinel
pub const OPTION_FLUSH_COMPLETE: u32 = 0x8000_0000;

/// One raw sample as delivered by the driver callback
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub desc: SensorDescriptor,
    pub version: i32,
    pub mode: SensorMode,
    pub timestamp_ns: i64,
    pub option: u32,
    pub data: Vec<u8>,
}

impl SensorEvent {
    /// Create a sample; payload beyond [`SENSOR_DATA_CAPACITY`] is truncated
    pub fn new(desc: SensorDescriptor, timestamp_ns: i64, mode: SensorMode, data: &[u8]) -> Self {
        let len = data.len().min(SENSOR_DATA_CAPACITY);
        Self {
            desc,
            version: 0,
            mode,
            timestamp_ns,
            option: 0,
            data: data[..len].to_vec(),
        }
    }

    /// Sample whose payload is a packed array of little-endian `f32`
    pub fn from_values(
        desc: SensorDescriptor,
        timestamp_ns: i64,
        mode: SensorMode,
        values: &[f32],
    ) -> Self {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(desc, timestamp_ns, mode, &data)
    }

    /// The sentinel emitted by a backend once a flush request has drained
    pub fn flush_complete(desc: SensorDescriptor, timestamp_ns: i64) -> Self {
        Self {
            desc,
            version: 0,
            mode: SensorMode::Default,
            timestamp_ns,
            option: OPTION_FLUSH_COMPLETE,
            data: Vec::new(),
        }
    }

    pub fn is_flush_complete(&self) -> bool {
        self.option & OPTION_FLUSH_COMPLETE != 0
    }

    /// Payload interpreted as packed `f32` values
    pub fn values(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Overwrite the `index`-th `f32` of the payload, growing it if needed
    pub fn set_value(&mut self, index: usize, value: f32) {
        let start = index * 4;
        if start + 4 > SENSOR_DATA_CAPACITY {
            return;
        }
        if self.data.len() < start + 4 {
            self.data.resize(start + 4, 0);
        }
        self.data[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Append the fixed-size record for this sample to `out`
    pub fn encode_record(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.desc.device_id.to_le_bytes());
        out.extend_from_slice(&self.desc.sensor_type.to_le_bytes());
        out.extend_from_slice(&self.desc.sensor_id.to_le_bytes());
        out.extend_from_slice(&self.desc.location.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.mode as i32).to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&self.option.to_le_bytes());
        let payload = &self.data[..self.data.len().min(SENSOR_DATA_CAPACITY)];
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut data = [0u8; SENSOR_DATA_CAPACITY];
        data[..payload.len()].copy_from_slice(payload);
        out.extend_from_slice(&data);
    }

    /// Encode a batch into one contiguous buffer
    pub fn encode_batch(events: &[SensorEvent]) -> Vec<u8> {
        let mut out = Vec::with_capacity(events.len() * SENSOR_RECORD_SIZE);
        for event in events {
            event.encode_record(&mut out);
        }
        out
    }

    /// Decode one record; `bytes` must hold at least [`SENSOR_RECORD_SIZE`] bytes
    pub fn decode_record(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SENSOR_RECORD_SIZE {
            return Err(Error::Decode(format!(
                "sample record needs {} bytes, got {}",
                SENSOR_RECORD_SIZE,
                bytes.len()
            )));
        }
        let i32_at = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let mode_raw = i32_at(20);
        let mode = SensorMode::from_i32(mode_raw)
            .ok_or_else(|| Error::Decode(format!("unknown sensor mode {}", mode_raw)))?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[24..32]);
        let data_len = u32_at(36) as usize;
        if data_len > SENSOR_DATA_CAPACITY {
            return Err(Error::Decode(format!("data_len {} exceeds record", data_len)));
        }

        Ok(Self {
            desc: SensorDescriptor::new(i32_at(0), i32_at(4), i32_at(8), i32_at(12)),
            version: i32_at(16),
            mode,
            timestamp_ns: i64::from_le_bytes(ts),
            option: u32_at(32),
            data: bytes[40..40 + data_len].to_vec(),
        })
    }

    /// Decode a buffer holding a whole number of records
    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Self>> {
        if bytes.len() % SENSOR_RECORD_SIZE != 0 {
            return Err(Error::Decode(format!(
                "{} bytes is not a whole number of sample records",
                bytes.len()
            )));
        }
        bytes
            .chunks_exact(SENSOR_RECORD_SIZE)
            .map(Self::decode_record)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::sensor_type;
    use approx::assert_relative_eq;

    fn accel() -> SensorDescriptor {
        SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1)
    }

    #[test]
    fn test_record_layout() {
        let event = SensorEvent::from_values(accel(), 123_456, SensorMode::Realtime, &[1.0, -2.5, 9.8]);
        let mut buf = Vec::new();
        event.encode_record(&mut buf);
        assert_eq!(buf.len(), SENSOR_RECORD_SIZE);
        assert_eq!(&buf[4..8], &sensor_type::ACCELEROMETER.to_le_bytes());
        assert_eq!(&buf[36..40], &12u32.to_le_bytes());

        let decoded = SensorEvent::decode_record(&buf).unwrap();
        assert_eq!(decoded, event);
        let values = decoded.values();
        assert_relative_eq!(values[2], 9.8);
    }

    #[test]
    fn test_payload_truncated_to_capacity() {
        let event = SensorEvent::new(accel(), 0, SensorMode::Default, &[7u8; 100]);
        assert_eq!(event.data.len(), SENSOR_DATA_CAPACITY);
    }

    #[test]
    fn test_oversized_payload_clamped_on_encode() {
        let mut event = SensorEvent::new(accel(), 9, SensorMode::Default, &[]);
        event.data = vec![3u8; SENSOR_DATA_CAPACITY + 16];
        let buf = SensorEvent::encode_batch(std::slice::from_ref(&event));
        assert_eq!(buf.len(), SENSOR_RECORD_SIZE);
        assert_eq!(&buf[36..40], &(SENSOR_DATA_CAPACITY as u32).to_le_bytes());
        let decoded = SensorEvent::decode_record(&buf).unwrap();
        assert_eq!(decoded.data, vec![3u8; SENSOR_DATA_CAPACITY]);
    }

    #[test]
    fn test_decode_rejects_short_and_ragged_buffers() {
        assert!(SensorEvent::decode_record(&[0u8; 10]).is_err());
        assert!(SensorEvent::decode_batch(&[0u8; SENSOR_RECORD_SIZE + 1]).is_err());

        let mut buf = Vec::new();
        SensorEvent::new(accel(), 0, SensorMode::Default, &[]).encode_record(&mut buf);
        buf[36..40].copy_from_slice(&200u32.to_le_bytes());
        assert!(SensorEvent::decode_record(&buf).is_err());
    }

    #[test]
    fn test_flush_sentinel() {
        let sentinel = SensorEvent::flush_complete(accel(), 5);
        assert!(sentinel.is_flush_complete());
        assert!(!SensorEvent::new(accel(), 5, SensorMode::Default, &[]).is_flush_complete());
    }

    #[test]
    fn test_set_value_grows_payload() {
        let mut event = SensorEvent::new(accel(), 0, SensorMode::OnChange, &[]);
        event.set_value(0, 5.0);
        assert_eq!(event.data.len(), 4);
        assert_relative_eq!(event.values()[0], 5.0);
    }
}
