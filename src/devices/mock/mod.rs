//! Scripted in-process sensor driver
//!
//! [`MockSensorDriver`] stands in for the hardware interface. It keeps the
//! hardware-side state (which sensors are enabled, at what rate), records
//! every call it receives, and lets tests inject failures, samples, hot-plug
//! events and driver death. Clones share state, so a test can keep a handle
//! while the hub owns another.
//!
//! [`SensorSimulator`] turns the same driver into a sample source for the
//! daemon when no hardware backend is wired in.

mod noise;
mod simulator;

pub use noise::SensorNoise;
pub use simulator::SensorSimulator;

use crate::core::driver::{DriverDeath, EventListener, PlugListener, SensorDriver};
use crate::core::event::SensorEvent;
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode, SensorRate};
use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    GetSensorList,
    Enable,
    Disable,
    SetBatch,
    SetMode,
    Flush,
    RegisterCallback,
}

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Connect,
    GetSensorList,
    Enable(SensorDescriptor),
    Disable(SensorDescriptor),
    SetBatch(SensorDescriptor, i64, i64),
    SetMode(SensorDescriptor, SensorMode),
    Flush(SensorDescriptor),
    RegisterEventCallback,
    RegisterPlugCallback,
    Unregister,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    op: DriverOp,
    /// `None` fails the op for every sensor
    desc: Option<SensorDescriptor>,
    timeout: bool,
}

struct MockDriverInner {
    sensors: Vec<SensorInfo>,
    connected: bool,
    /// Hardware-side rate per sensor; `enabled` mirrors enable/disable
    hardware: BTreeMap<SensorDescriptor, SensorRate>,
    calls: Vec<DriverCall>,
    failures: Vec<InjectedFailure>,
    failing_connects: u32,
    supports_flush: bool,
    event_listener: Option<Arc<dyn EventListener>>,
    plug_listener: Option<Arc<dyn PlugListener>>,
    death_notifier: Option<Sender<DriverDeath>>,
}

impl MockDriverInner {
    fn check(&self, op: DriverOp, desc: Option<&SensorDescriptor>) -> Result<()> {
        if !self.connected {
            return Err(Error::NotInitialized);
        }
        let hit = self.failures.iter().find(|f| {
            f.op == op && (f.desc.is_none() || f.desc.as_ref() == desc)
        });
        match hit {
            Some(f) if f.timeout => Err(Error::Timeout),
            Some(_) => Err(Error::DriverCallFailed(format!(
                "injected {:?} failure{}",
                op,
                desc.map(|d| format!(" on {}", d)).unwrap_or_default()
            ))),
            None => Ok(()),
        }
    }

    fn known(&self, desc: &SensorDescriptor) -> Result<()> {
        if self.sensors.iter().any(|s| s.desc == *desc) {
            Ok(())
        } else {
            Err(Error::InvalidDescriptor(*desc))
        }
    }
}

#[derive(Clone)]
pub struct MockSensorDriver {
    inner: Arc<Mutex<MockDriverInner>>,
}

impl MockSensorDriver {
    pub fn new(sensors: Vec<SensorInfo>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockDriverInner {
                sensors,
                connected: false,
                hardware: BTreeMap::new(),
                calls: Vec::new(),
                failures: Vec::new(),
                failing_connects: 0,
                supports_flush: false,
                event_listener: None,
                plug_listener: None,
                death_notifier: None,
            })),
        }
    }

    // ----- test controls -----

    /// Make `op` fail (for one sensor, or all when `desc` is `None`) until cleared
    pub fn fail_op(&self, op: DriverOp, desc: Option<SensorDescriptor>) {
        self.inner.lock().failures.push(InjectedFailure {
            op,
            desc,
            timeout: false,
        });
    }

    /// Make `op` time out until cleared
    pub fn timeout_op(&self, op: DriverOp, desc: Option<SensorDescriptor>) {
        self.inner.lock().failures.push(InjectedFailure {
            op,
            desc,
            timeout: true,
        });
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Refuse the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().failing_connects = count;
    }

    pub fn set_supports_flush(&self, supported: bool) {
        self.inner.lock().supports_flush = supported;
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Count recorded calls matching a predicate
    pub fn count_calls<F: Fn(&DriverCall) -> bool>(&self, pred: F) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Hardware-side state of one sensor
    pub fn hardware_rate(&self, desc: &SensorDescriptor) -> Option<SensorRate> {
        self.inner.lock().hardware.get(desc).copied()
    }

    pub fn is_hw_enabled(&self, desc: &SensorDescriptor) -> bool {
        self.hardware_rate(desc).is_some_and(|r| r.enabled)
    }

    /// Enabled sensors with their metadata and hardware rate
    pub fn active_sensors(&self) -> Vec<(SensorInfo, SensorRate)> {
        let inner = self.inner.lock();
        inner
            .sensors
            .iter()
            .filter_map(|info| {
                inner
                    .hardware
                    .get(&info.desc)
                    .filter(|rate| rate.enabled)
                    .map(|rate| (info.clone(), *rate))
            })
            .collect()
    }

    /// Deliver a sample through the registered callback, as the driver thread would
    ///
    /// Returns false if the driver is disconnected or has no callback.
    pub fn inject_event(&self, event: SensorEvent) -> bool {
        let listener = {
            let inner = self.inner.lock();
            if !inner.connected {
                return false;
            }
            inner.event_listener.clone()
        };
        match listener {
            Some(listener) => {
                listener.on_sample(event);
                true
            }
            None => false,
        }
    }

    /// Simulate loss of the driver: drop all hardware state and fire the death notice
    pub fn kill(&self) {
        let notifier = {
            let mut inner = self.inner.lock();
            inner.connected = false;
            inner.hardware.clear();
            inner.event_listener = None;
            inner.plug_listener = None;
            inner.death_notifier.take()
        };
        if let Some(tx) = notifier {
            let _ = tx.send(DriverDeath);
        }
    }

    /// Attach or detach a sensor and notify the plug callback
    pub fn plug(&self, info: SensorInfo, plugged_in: bool) {
        let desc = info.desc;
        let listener = {
            let mut inner = self.inner.lock();
            inner.sensors.retain(|s| s.desc != desc);
            if plugged_in {
                inner.sensors.push(info);
            } else {
                inner.hardware.remove(&desc);
            }
            inner.plug_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_plug_event(desc, plugged_in);
        }
    }
}

impl SensorDriver for MockSensorDriver {
    fn connect(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::Connect);
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        inner.connected = true;
        Ok(())
    }

    fn get_sensor_list(&mut self) -> Result<Vec<SensorInfo>> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::GetSensorList);
        inner.check(DriverOp::GetSensorList, None)?;
        Ok(inner.sensors.clone())
    }

    fn enable(&mut self, desc: &SensorDescriptor) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::Enable(*desc));
        inner.check(DriverOp::Enable, Some(desc))?;
        inner.known(desc)?;
        inner.hardware.entry(*desc).or_default().enabled = true;
        Ok(())
    }

    fn disable(&mut self, desc: &SensorDescriptor) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::Disable(*desc));
        inner.check(DriverOp::Disable, Some(desc))?;
        inner.known(desc)?;
        if let Some(rate) = inner.hardware.get_mut(desc) {
            rate.enabled = false;
        }
        Ok(())
    }

    fn set_batch(&mut self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::SetBatch(*desc, sampling_ns, delay_ns));
        inner.check(DriverOp::SetBatch, Some(desc))?;
        inner.known(desc)?;
        let rate = inner.hardware.entry(*desc).or_default();
        rate.sampling_period_ns = sampling_ns;
        rate.max_report_delay_ns = delay_ns;
        Ok(())
    }

    fn set_mode(&mut self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::SetMode(*desc, mode));
        inner.check(DriverOp::SetMode, Some(desc))?;
        inner.known(desc)?;
        if let Some(info) = inner.sensors.iter_mut().find(|s| s.desc == *desc) {
            info.mode = mode;
        }
        Ok(())
    }

    fn flush(&mut self, desc: &SensorDescriptor) -> Result<()> {
        let listener = {
            let mut inner = self.inner.lock();
            inner.calls.push(DriverCall::Flush(*desc));
            inner.check(DriverOp::Flush, Some(desc))?;
            if !inner.supports_flush {
                return Err(Error::NotSupported(format!("flush on {}", desc)));
            }
            inner.event_listener.clone()
        };
        // No hardware FIFO to drain: completion is immediate
        if let Some(listener) = listener {
            listener.on_sample(SensorEvent::flush_complete(*desc, 0));
        }
        Ok(())
    }

    fn register_event_callback(&mut self, listener: Arc<dyn EventListener>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::RegisterEventCallback);
        inner.check(DriverOp::RegisterCallback, None)?;
        inner.event_listener = Some(listener);
        Ok(())
    }

    fn register_plug_callback(&mut self, listener: Arc<dyn PlugListener>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::RegisterPlugCallback);
        inner.check(DriverOp::RegisterCallback, None)?;
        inner.plug_listener = Some(listener);
        Ok(())
    }

    fn register_death_notifier(&mut self, notifier: Sender<DriverDeath>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::NotInitialized);
        }
        inner.death_notifier = Some(notifier);
        Ok(())
    }

    fn unregister(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(DriverCall::Unregister);
        inner.event_listener = None;
        inner.plug_listener = None;
        inner.death_notifier = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::sensor_type;
    use crossbeam_channel::unbounded;

    fn accel() -> SensorDescriptor {
        SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1)
    }

    fn driver() -> MockSensorDriver {
        MockSensorDriver::new(vec![SensorInfo::new(accel(), "accel")])
    }

    struct Collect(Mutex<Vec<SensorEvent>>);

    impl EventListener for Collect {
        fn on_sample(&self, event: SensorEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_requires_connect() {
        let mut d = driver();
        assert!(matches!(d.enable(&accel()), Err(Error::NotInitialized)));
        d.connect().unwrap();
        d.enable(&accel()).unwrap();
        assert!(d.is_hw_enabled(&accel()));
    }

    #[test]
    fn test_unknown_sensor_rejected() {
        let mut d = driver();
        d.connect().unwrap();
        let bogus = SensorDescriptor::new(1, 99, 0, 1);
        assert!(matches!(d.enable(&bogus), Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_set_batch_preserves_enabled() {
        let mut d = driver();
        d.connect().unwrap();
        d.enable(&accel()).unwrap();
        d.set_batch(&accel(), 10, 20).unwrap();
        let rate = d.hardware_rate(&accel()).unwrap();
        assert!(rate.enabled);
        assert_eq!(rate.sampling_period_ns, 10);
        assert_eq!(d.active_sensors().len(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let mut d = driver();
        d.connect().unwrap();
        d.fail_op(DriverOp::Enable, Some(accel()));
        assert!(matches!(d.enable(&accel()), Err(Error::DriverCallFailed(_))));
        d.timeout_op(DriverOp::Disable, None);
        assert!(matches!(d.disable(&accel()), Err(Error::Timeout)));
        d.clear_failures();
        assert!(d.enable(&accel()).is_ok());
    }

    #[test]
    fn test_fail_next_connects() {
        let mut d = driver();
        d.fail_next_connects(2);
        assert!(d.connect().is_err());
        assert!(d.connect().is_err());
        assert!(d.connect().is_ok());
        assert_eq!(d.count_calls(|c| *c == DriverCall::Connect), 3);
    }

    #[test]
    fn test_inject_and_kill() {
        let mut d = driver();
        d.connect().unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        d.register_event_callback(sink.clone()).unwrap();
        let (tx, rx) = unbounded();
        d.register_death_notifier(tx).unwrap();
        d.enable(&accel()).unwrap();

        assert!(d.inject_event(SensorEvent::new(accel(), 1, SensorMode::Realtime, &[])));
        assert_eq!(sink.0.lock().len(), 1);

        d.kill();
        assert_eq!(rx.try_recv(), Ok(DriverDeath));
        assert!(!d.is_connected());
        assert!(!d.is_hw_enabled(&accel()));
        assert!(!d.inject_event(SensorEvent::new(accel(), 2, SensorMode::Realtime, &[])));
    }

    #[test]
    fn test_flush_completes_immediately_when_supported() {
        let mut d = driver();
        d.connect().unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        d.register_event_callback(sink.clone()).unwrap();
        assert!(matches!(d.flush(&accel()), Err(Error::NotSupported(_))));
        d.set_supports_flush(true);
        d.flush(&accel()).unwrap();
        assert!(sink.0.lock()[0].is_flush_complete());
    }
}
