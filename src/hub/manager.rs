//! Subscriber bookkeeping and hardware rate arbitration
//!
//! Every pid's request is saved (clamped to what the sensor supports) in
//! the registry, and the element-wise minimum across subscribers is what
//! gets pushed to the driver. The last pushed rate per sensor is kept so a
//! request that leaves the minimum unchanged costs no driver call.

use crate::catalog::SensorCatalog;
use crate::connection::ConnectionFacade;
use crate::core::types::{SensorDescriptor, SensorMode, SensorRate, sensor_type};
use crate::error::{Error, Result};
use crate::registry::SubscriptionRegistry;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Stored value written to a proximity sensor once nobody listens to it
pub const PROXIMITY_FAR: f32 = 5.0;

pub struct SensorManager {
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<SensorCatalog>,
    facade: Arc<ConnectionFacade>,
    /// Rate last accepted by the driver, per sensor
    pushed: Mutex<HashMap<SensorDescriptor, SensorRate>>,
}

impl SensorManager {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<SensorCatalog>,
        facade: Arc<ConnectionFacade>,
    ) -> Self {
        Self {
            registry,
            catalog,
            facade,
            pushed: Mutex::new(HashMap::new()),
        }
    }

    /// Clamp a request to the sensor's capabilities
    ///
    /// The period is raised to the sensor's minimum and the delay capped to
    /// `period * fifo_max_event_count`. Sensors missing from the catalog
    /// keep the requested values.
    pub fn get_sensor_info(&self, desc: &SensorDescriptor, period_ns: i64, delay_ns: i64) -> Result<SensorRate> {
        let Some(info) = self.catalog.get(desc) else {
            return Ok(SensorRate::new(period_ns, delay_ns));
        };
        let period = period_ns.max(info.min_sample_period_ns);
        let fifo = i64::from(info.fifo_max_event_count.max(0));
        let support_delay = period_ns
            .checked_mul(fifo)
            .filter(|_| period_ns > 0)
            .ok_or_else(|| Error::InvalidParameter(format!("period {} overflows", period_ns)))?;
        Ok(SensorRate::new(period, delay_ns.min(support_delay)))
    }

    /// Record `pid`'s clamped request for `desc`
    pub fn save_subscriber(&self, desc: &SensorDescriptor, pid: i32, period_ns: i64, delay_ns: i64) -> Result<()> {
        let rate = self.get_sensor_info(desc, period_ns, delay_ns)?;
        self.registry.update_sensor_info(*desc, pid, rate)?;
        debug!("Manager: saved pid {} on {} ({:?})", pid, desc, rate);
        Ok(())
    }

    /// Push the best rate to the driver unless the driver already runs at it
    ///
    /// A re-enable by a pid already subscribed can raise the minimum as well
    /// as lower it, so only the last pushed rate decides the skip.
    pub fn set_best_sensor_params(&self, desc: &SensorDescriptor) -> Result<()> {
        if desc.sensor_type == sensor_type::INVALID {
            return Err(Error::InvalidDescriptor(*desc));
        }
        let best = self.registry.get_best_rate(desc);
        if best.is_unbounded() {
            return Ok(());
        }
        if let Some(pushed) = self.pushed.lock().get(desc).copied() {
            if pushed.sampling_period_ns == best.sampling_period_ns
                && pushed.max_report_delay_ns == best.max_report_delay_ns
            {
                debug!("Manager: {} already at best rate", desc);
                return Ok(());
            }
        }
        self.push_rate(desc, best)
    }

    /// Re-push the best rate after a subscriber left a shared sensor
    pub fn reset_best_sensor_params(&self, desc: &SensorDescriptor) -> Result<()> {
        if desc.sensor_type == sensor_type::INVALID {
            return Err(Error::InvalidDescriptor(*desc));
        }
        let best = self.registry.get_best_rate(desc);
        if best.is_unbounded() {
            return Ok(());
        }
        self.push_rate(desc, best)
    }

    fn push_rate(&self, desc: &SensorDescriptor, best: SensorRate) -> Result<()> {
        self.facade
            .set_batch(desc, best.sampling_period_ns, best.max_report_delay_ns)?;
        self.pushed.lock().insert(*desc, best);
        info!(
            "Manager: {} batch {} ns / {} ns",
            desc, best.sampling_period_ns, best.max_report_delay_ns
        );
        Ok(())
    }

    /// Rate last accepted by the driver for `desc`
    pub fn pushed_rate(&self, desc: &SensorDescriptor) -> Option<SensorRate> {
        self.pushed.lock().get(desc).copied()
    }

    pub fn enable_at_driver(&self, desc: &SensorDescriptor) -> Result<()> {
        self.facade.enable_sensor(desc)
    }

    pub fn disable_at_driver(&self, desc: &SensorDescriptor) -> Result<()> {
        self.facade.disable_sensor(desc)?;
        self.pushed.lock().remove(desc);
        Ok(())
    }

    /// If another pid still has `desc` enabled, drop only `pid` and re-push
    /// the best rate of the remaining subscribers
    ///
    /// Returns false when `pid` is the sole subscriber and the caller must
    /// disable the sensor at the driver.
    pub fn is_other_client_using_sensor(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        if self.registry.only_current_pid_enabled(desc, pid) {
            return false;
        }
        if !self.registry.remove_subscriber(desc, pid) {
            debug!("Manager: pid {} was not subscribed to {}", pid, desc);
        }
        if let Err(e) = self.reset_best_sensor_params(desc) {
            warn!("Manager: reset best params of {} failed: {}", desc, e);
        }
        true
    }

    /// Registry cleanup once the driver stopped a sensor
    pub fn after_disable_sensor(&self, desc: &SensorDescriptor) {
        self.registry.clear_sensor_info(desc);
        if desc.sensor_type == sensor_type::PROXIMITY {
            self.registry.update_store_event_value(desc, 0, PROXIMITY_FAR);
        }
    }

    /// True if `desc` reports on change and has a stored last value
    pub fn has_on_change_value(&self, desc: &SensorDescriptor) -> bool {
        self.catalog.mode(desc) == Some(SensorMode::OnChange)
            && self.registry.get_store_event(desc).is_some()
    }
}
