//! Suspend/resume of a process's sensors
//!
//! Suspending a pid stops every sensor only it uses and remembers the rates
//! it had, so resume can put them back. Sensors another pid still needs keep
//! running untouched; the suspended pid just stops being a subscriber.

use crate::active_info::{StreamServer, active_info_packet};
use crate::core::types::{ActiveInfo, SensorDescriptor, SensorRate, sensor_type};
use crate::error::{Error, Result};
use crate::hub::SensorManager;
use crate::registry::SubscriptionRegistry;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DISABLE_ATTEMPTS: u32 = 3;
const DISABLE_RETRY_SLEEP: Duration = Duration::from_millis(5);

/// Step counters keep running while their owner is frozen
pub fn is_freezing_exempt(sensor_type: i32) -> bool {
    sensor_type == sensor_type::PEDOMETER_DETECTION || sensor_type == sensor_type::PEDOMETER
}

/// Rates captured at suspend time
///
/// `enabled` is true for entries whose driver disable failed and must be
/// retried by the next suspend.
type Snapshot = BTreeMap<SensorDescriptor, SensorRate>;

pub struct PowerPolicy {
    registry: Arc<SubscriptionRegistry>,
    manager: Arc<SensorManager>,
    max_event_count: i64,
    max_sensor_count: usize,
    snapshots: Mutex<HashMap<i32, Snapshot>>,
}

impl PowerPolicy {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        manager: Arc<SensorManager>,
        max_event_count: i64,
        max_sensor_count: usize,
    ) -> Self {
        Self {
            registry,
            manager,
            max_event_count,
            max_sensor_count,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Stop `pid`'s sensors and remember their rates
    ///
    /// A second suspend before resume merges into the existing snapshot and
    /// retries disables that failed the first time.
    pub fn suspend(&self, pid: i32) -> Result<()> {
        let sensors = self.registry.get_sensor_ids_by_pid(pid);
        let mut snapshots = self.snapshots.lock();
        let existing = snapshots.get(&pid).cloned();
        if sensors.is_empty() && existing.is_none() {
            debug!("Power: nothing to suspend for pid {}", pid);
            return Err(Error::NotFound(format!("no sensors for pid {}", pid)));
        }

        let mut snapshot = existing.unwrap_or_default();
        let mut total = 0;
        let mut failed = 0;

        // Disables that failed during an earlier suspend
        let stuck: Vec<SensorDescriptor> = snapshot
            .iter()
            .filter(|(_, rate)| rate.enabled)
            .map(|(desc, _)| *desc)
            .collect();
        for desc in stuck {
            if sensors.contains(&desc) {
                continue;
            }
            total += 1;
            if self.disable_with_retry(&desc) {
                if let Some(rate) = snapshot.get_mut(&desc) {
                    rate.enabled = false;
                }
            } else {
                failed += 1;
            }
        }

        for desc in sensors {
            if is_freezing_exempt(desc.sensor_type) {
                debug!("Power: {} keeps running for pid {}", desc, pid);
                continue;
            }
            let Some(mut rate) = self.registry.get_cur_pid_rate(&desc, pid) else {
                continue;
            };
            total += 1;
            if !self.registry.only_current_pid_enabled(&desc, pid) {
                // Shared: leave the hardware alone
                self.registry.remove_subscriber(&desc, pid);
                rate.enabled = false;
                snapshot.insert(desc, rate);
                continue;
            }
            rate.enabled = !self.disable_with_retry(&desc);
            if rate.enabled {
                failed += 1;
            }
            snapshot.insert(desc, rate);
            self.manager.after_disable_sensor(&desc);
        }

        snapshots.insert(pid, snapshot);
        if failed > 0 {
            error!("Power: suspend pid {}: {}/{} sensors failed", pid, failed, total);
            return Err(Error::PartialFailure { failed, total });
        }
        info!("Power: suspended {} sensors of pid {}", total, pid);
        Ok(())
    }

    fn disable_with_retry(&self, desc: &SensorDescriptor) -> bool {
        for attempt in 1..=DISABLE_ATTEMPTS {
            match self.manager.disable_at_driver(desc) {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        "Power: disable {} failed (attempt {}/{}): {}",
                        desc, attempt, DISABLE_ATTEMPTS, e
                    );
                    if attempt < DISABLE_ATTEMPTS {
                        thread::sleep(DISABLE_RETRY_SLEEP);
                    }
                }
            }
        }
        false
    }

    /// Restore the rates captured by [`PowerPolicy::suspend`]
    ///
    /// Entries that come back are dropped from the snapshot; the rest stay
    /// for the next resume.
    pub fn resume(&self, pid: i32) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let Some(snapshot) = snapshots.get_mut(&pid) else {
            debug!("Power: pid {} is not suspended", pid);
            return Err(Error::NotFound(format!("pid {} not suspended", pid)));
        };

        let total = snapshot.len();
        snapshot.retain(|desc, rate| match self.resume_sensor(pid, desc, rate) {
            Ok(()) => false,
            Err(e) => {
                error!("Power: resume {} for pid {} failed: {}", desc, pid, e);
                true
            }
        });

        let failed = snapshot.len();
        if failed > 0 {
            return Err(Error::PartialFailure { failed, total });
        }
        snapshots.remove(&pid);
        info!("Power: resumed {} sensors of pid {}", total, pid);
        Ok(())
    }

    fn resume_sensor(&self, pid: i32, desc: &SensorDescriptor, rate: &SensorRate) -> Result<()> {
        let period = rate.sampling_period_ns;
        let delay = rate.max_report_delay_ns;
        if desc.sensor_type == sensor_type::INVALID || period <= 0 || delay / period > self.max_event_count {
            return Err(Error::InvalidParameter(format!(
                "cannot restore {} ns / {} ns",
                period, delay
            )));
        }

        let running = self.registry.get_sensor_state(desc);
        self.manager.save_subscriber(desc, pid, period, delay)?;
        if let Err(e) = self.manager.set_best_sensor_params(desc) {
            self.registry.remove_subscriber(desc, pid);
            return Err(e);
        }
        if running {
            return Ok(());
        }
        if let Err(e) = self.manager.enable_at_driver(desc) {
            self.registry.remove_subscriber(desc, pid);
            return Err(e);
        }
        Ok(())
    }

    /// Resume every suspended pid
    pub fn reset_all(&self) -> Result<()> {
        let pids = self.suspended_pids();
        let total = pids.len();
        let mut failed = 0;
        for pid in pids {
            if let Err(e) = self.resume(pid) {
                error!("Power: reset of pid {} failed: {}", pid, e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::PartialFailure { failed, total });
        }
        Ok(())
    }

    pub fn suspended_pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.snapshots.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_suspended(&self, pid: i32) -> bool {
        self.snapshots.lock().contains_key(&pid)
    }

    /// Rates recorded for `pid`, if suspended
    pub fn snapshot_of(&self, pid: i32) -> Option<BTreeMap<SensorDescriptor, SensorRate>> {
        self.snapshots.lock().get(&pid).cloned()
    }

    /// Forget a dead client's snapshot
    pub fn delete_death_pid(&self, pid: i32) {
        if self.snapshots.lock().remove(&pid).is_some() {
            debug!("Power: dropped snapshot of dead pid {}", pid);
        }
    }

    /// What `pid` is currently sampling
    pub fn get_active_info_list(&self, pid: i32) -> Vec<ActiveInfo> {
        let mut list: Vec<ActiveInfo> = self
            .registry
            .get_sensor_ids_by_pid(pid)
            .into_iter()
            .filter_map(|desc| {
                let rate = self.registry.get_cur_pid_rate(&desc, pid)?;
                Some(ActiveInfo::new(pid, &desc, &rate))
            })
            .collect();
        list.truncate(self.max_sensor_count);
        if list.is_empty() {
            debug!("Power: no active info for pid {}", pid);
        }
        list
    }

    /// Push one notification to every listed session
    pub fn report_active_info(&self, info: &ActiveInfo, server: &StreamServer, pids: &[i32]) -> usize {
        if info.pid < 0 || info.sensor_type < 0 {
            warn!("Power: invalid active info {:?}", info);
            return 0;
        }
        match active_info_packet(info) {
            Ok(pkt) => server.multicast(pids, &pkt),
            Err(e) => {
                error!("Power: active info packet failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SensorCatalog;
    use crate::config::DriverConfig;
    use crate::connection::{CompatibleConnection, ConnectionFacade, HdiConnection, SensorConnection};
    use crate::core::types::{SensorInfo, SensorMode};
    use crate::devices::mock::{DriverCall, DriverOp, MockSensorDriver};

    const ACCEL: SensorDescriptor = SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1);
    const GYRO: SensorDescriptor = SensorDescriptor::new(1, sensor_type::GYROSCOPE, 0, 1);
    const STEPS: SensorDescriptor = SensorDescriptor::new(1, sensor_type::PEDOMETER, 0, 1);

    struct Fixture {
        policy: PowerPolicy,
        registry: Arc<SubscriptionRegistry>,
        manager: Arc<SensorManager>,
        driver: MockSensorDriver,
    }

    fn continuous(desc: SensorDescriptor, name: &str) -> SensorInfo {
        SensorInfo {
            fifo_max_event_count: 100,
            mode: SensorMode::Realtime,
            ..SensorInfo::new(desc, name)
        }
    }

    fn fixture() -> Fixture {
        let driver = MockSensorDriver::new(vec![
            continuous(ACCEL, "accel"),
            continuous(GYRO, "gyro"),
            continuous(STEPS, "steps"),
        ]);
        let config = DriverConfig {
            retry_interval_ms: 1,
            compatible_backend: false,
            ..DriverConfig::default()
        };
        let hdi = HdiConnection::new(Box::new(driver.clone()), &config);
        let facade = ConnectionFacade::connect(
            Box::new(hdi),
            |_: i32, _: &[i32]| -> Box<dyn SensorConnection> {
                Box::new(CompatibleConnection::new(Vec::new()))
            },
            false,
        )
        .unwrap();
        let catalog = Arc::new(SensorCatalog::new());
        catalog.replace_all(facade.get_sensor_list());
        let registry = Arc::new(SubscriptionRegistry::new(10));
        let manager = Arc::new(SensorManager::new(
            Arc::clone(&registry),
            catalog,
            Arc::new(facade),
        ));
        let policy = PowerPolicy::new(Arc::clone(&registry), Arc::clone(&manager), 1000, 256);
        Fixture {
            policy,
            registry,
            manager,
            driver,
        }
    }

    impl Fixture {
        fn enable(&self, desc: SensorDescriptor, pid: i32, period: i64, delay: i64) {
            let running = self.registry.get_sensor_state(&desc);
            self.manager.save_subscriber(&desc, pid, period, delay).unwrap();
            self.manager.set_best_sensor_params(&desc).unwrap();
            if !running {
                self.manager.enable_at_driver(&desc).unwrap();
            }
        }
    }

    #[test]
    fn test_suspend_resume_restores_rates() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 20_000_000);
        f.enable(GYRO, 10, 5_000_000, 0);

        f.policy.suspend(10).unwrap();
        assert!(!f.driver.is_hw_enabled(&ACCEL));
        assert!(!f.driver.is_hw_enabled(&GYRO));
        assert!(f.registry.get_sensor_ids_by_pid(10).is_empty());
        assert!(f.policy.is_suspended(10));

        f.policy.resume(10).unwrap();
        assert!(f.driver.is_hw_enabled(&ACCEL));
        assert_eq!(
            f.registry.get_cur_pid_rate(&ACCEL, 10),
            Some(SensorRate::new(10_000_000, 20_000_000))
        );
        assert_eq!(f.registry.get_cur_pid_rate(&GYRO, 10), Some(SensorRate::new(5_000_000, 0)));
        assert!(!f.policy.is_suspended(10));
    }

    #[test]
    fn test_shared_sensor_untouched() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 0);
        f.enable(ACCEL, 11, 20_000_000, 0);
        f.driver.clear_calls();

        f.policy.suspend(10).unwrap();
        f.policy.resume(10).unwrap();

        assert!(f.driver.calls().is_empty(), "{:?}", f.driver.calls());
        assert!(f.driver.is_hw_enabled(&ACCEL));
        assert_eq!(
            f.registry.get_cur_pid_rate(&ACCEL, 10),
            Some(SensorRate::new(10_000_000, 0))
        );
    }

    #[test]
    fn test_pedometer_keeps_running() {
        let f = fixture();
        f.enable(STEPS, 10, 10_000_000, 0);
        f.enable(ACCEL, 10, 10_000_000, 0);

        f.policy.suspend(10).unwrap();
        assert!(f.driver.is_hw_enabled(&STEPS));
        assert!(f.registry.is_subscribed(&STEPS, 10));
        assert!(!f.policy.snapshot_of(10).unwrap().contains_key(&STEPS));
    }

    #[test]
    fn test_suspend_unknown_pid() {
        let f = fixture();
        assert!(matches!(f.policy.suspend(42), Err(Error::NotFound(_))));
        assert!(matches!(f.policy.resume(42), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_failed_disable_retried_on_second_suspend() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 0);
        f.driver.fail_op(DriverOp::Disable, Some(ACCEL));

        let err = f.policy.suspend(10).unwrap_err();
        assert!(matches!(err, Error::PartialFailure { failed: 1, total: 1 }));
        assert!(f.driver.is_hw_enabled(&ACCEL));

        f.driver.clear_failures();
        f.policy.suspend(10).unwrap();
        assert!(!f.driver.is_hw_enabled(&ACCEL));
        assert!(!f.policy.snapshot_of(10).unwrap()[&ACCEL].enabled);
    }

    #[test]
    fn test_failed_resume_kept_for_next_call() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 0);
        f.enable(GYRO, 10, 10_000_000, 0);
        f.policy.suspend(10).unwrap();

        f.driver.fail_op(DriverOp::Enable, Some(GYRO));
        let err = f.policy.resume(10).unwrap_err();
        assert!(matches!(err, Error::PartialFailure { failed: 1, total: 2 }));
        let snapshot = f.policy.snapshot_of(10).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&GYRO));
        assert!(!f.registry.is_subscribed(&GYRO, 10));

        f.driver.clear_failures();
        f.policy.reset_all().unwrap();
        assert!(f.driver.is_hw_enabled(&GYRO));
        assert!(f.policy.suspended_pids().is_empty());
    }

    #[test]
    fn test_active_info_list() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 0);
        f.enable(GYRO, 10, 20_000_000, 0);
        let list = f.policy.get_active_info_list(10);
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|info| info.pid == 10));
        assert!(f.policy.get_active_info_list(11).is_empty());
    }

    #[test]
    fn test_delete_death_pid() {
        let f = fixture();
        f.enable(ACCEL, 10, 10_000_000, 0);
        f.policy.suspend(10).unwrap();
        f.policy.delete_death_pid(10);
        assert!(!f.policy.is_suspended(10));
        assert_eq!(
            f.driver.count_calls(|c| matches!(c, DriverCall::Enable(_))),
            1
        );
    }
}
