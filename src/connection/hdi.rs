//! Primary driver connection
//!
//! Owns the driver handle behind a mutex, a replay table of per-sensor state
//! and a watcher thread that turns a driver death notice into a reconnect.
//! After reconnect every sensor whose replay entry is enabled gets its batch
//! parameters and enable call re-issued, in descriptor order.

use super::SensorConnection;
use crate::config::DriverConfig;
use crate::core::driver::{DriverDeath, EventListener, PlugListener, SensorDriver};
use crate::core::event::SensorEvent;
use crate::core::types::{SensorDescriptor, SensorInfo, SensorMode, SensorRate, sensor_type};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Forces proximity samples to on-change before they reach the event buffer
struct ModeFixup {
    inner: Arc<dyn EventListener>,
}

impl EventListener for ModeFixup {
    fn on_sample(&self, mut event: SensorEvent) {
        if event.desc.sensor_type == sensor_type::PROXIMITY {
            event.mode = SensorMode::OnChange;
        }
        self.inner.on_sample(event);
    }

    fn on_connection_reset(&self) {
        self.inner.on_connection_reset();
    }
}

struct HdiShared {
    driver: Mutex<Box<dyn SensorDriver>>,
    /// Last batch parameters and enable state per sensor
    replay: Mutex<BTreeMap<SensorDescriptor, SensorRate>>,
    listener: Mutex<Option<Arc<dyn EventListener>>>,
    plug_listener: Mutex<Option<Arc<dyn PlugListener>>>,
    death_tx: Mutex<Option<Sender<DriverDeath>>>,
    connected: AtomicBool,
    reconnects: AtomicU64,
    connect_retries: u32,
    retry_interval: Duration,
    max_sensor_count: usize,
}

struct Watcher {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct HdiConnection {
    shared: Arc<HdiShared>,
    watcher: Mutex<Option<Watcher>>,
}

impl HdiConnection {
    pub fn new(driver: Box<dyn SensorDriver>, config: &DriverConfig) -> Self {
        Self {
            shared: Arc::new(HdiShared {
                driver: Mutex::new(driver),
                replay: Mutex::new(BTreeMap::new()),
                listener: Mutex::new(None),
                plug_listener: Mutex::new(None),
                death_tx: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                connect_retries: config.connect_retries.max(1),
                retry_interval: Duration::from_millis(config.retry_interval_ms),
                max_sensor_count: config.max_sensor_count,
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Completed reconnect cycles since construction
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Acquire)
    }

    /// Copy of the replay table
    pub fn replay_table(&self) -> BTreeMap<SensorDescriptor, SensorRate> {
        self.shared.replay.lock().clone()
    }

    /// Run the reconnect flow now, as the watcher does on a death notice
    pub fn reconnect(&self) -> Result<()> {
        self.shared.reconnect()
    }

    fn spawn_watcher(&self, death_rx: Receiver<DriverDeath>) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("hdi-watcher".to_string())
            .spawn(move || watch_loop(shared, death_rx, shutdown_rx))?;
        *watcher = Some(Watcher {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    fn stop_watcher(&self) -> Result<()> {
        let watcher = self.watcher.lock().take();
        if let Some(w) = watcher {
            let _ = w.shutdown_tx.send(());
            w.handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}

impl HdiShared {
    fn connect_with_retry(&self) -> Result<()> {
        for attempt in 1..=self.connect_retries {
            match self.driver.lock().connect() {
                Ok(()) => {
                    if attempt > 1 {
                        info!("HDI: Connected after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "HDI: Connect attempt {}/{} failed: {}",
                        attempt, self.connect_retries, e
                    );
                }
            }
            if attempt < self.connect_retries {
                thread::sleep(self.retry_interval);
            }
        }
        error!("HDI: Driver unreachable after {} attempts", self.connect_retries);
        Err(Error::ConnectFailed {
            attempts: self.connect_retries,
        })
    }

    fn arm_death_notifier(&self) -> Result<()> {
        let tx = self.death_tx.lock().clone();
        if let Some(tx) = tx {
            self.driver.lock().register_death_notifier(tx)?;
        }
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        info!("HDI: Reconnecting to driver");
        self.connected.store(false, Ordering::Release);
        self.connect_with_retry()?;
        self.arm_death_notifier()?;

        let listener = self.listener.lock().clone();
        if let Some(listener) = &listener {
            self.driver
                .lock()
                .register_event_callback(Arc::clone(listener))?;
        }
        let plug_listener = self.plug_listener.lock().clone();
        if let Some(plug_listener) = plug_listener {
            self.driver.lock().register_plug_callback(plug_listener)?;
        }
        self.driver.lock().get_sensor_list()?;
        self.connected.store(true, Ordering::Release);

        // Batching state built against the old connection is stale
        if let Some(listener) = &listener {
            listener.on_connection_reset();
        }

        let entries: Vec<(SensorDescriptor, SensorRate)> = self
            .replay
            .lock()
            .iter()
            .filter(|(_, rate)| rate.enabled)
            .map(|(desc, rate)| (*desc, *rate))
            .collect();
        let mut restored = 0;
        for (desc, rate) in &entries {
            let batch = self.driver.lock().set_batch(
                desc,
                rate.sampling_period_ns,
                rate.max_report_delay_ns,
            );
            if let Err(e) = batch {
                error!("HDI: Replay set_batch failed for {}: {}", desc, e);
                continue;
            }
            if let Err(e) = self.driver.lock().enable(desc) {
                error!("HDI: Replay enable failed for {}: {}", desc, e);
                continue;
            }
            restored += 1;
        }

        self.reconnects.fetch_add(1, Ordering::AcqRel);
        info!(
            "HDI: Reconnected, restored {}/{} sensors",
            restored,
            entries.len()
        );
        Ok(())
    }
}

fn watch_loop(shared: Arc<HdiShared>, death_rx: Receiver<DriverDeath>, shutdown_rx: Receiver<()>) {
    debug!("HDI: Liveness watcher started");
    loop {
        select! {
            recv(death_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
                warn!("HDI: Driver died");
                if let Err(e) = shared.reconnect() {
                    error!("HDI: Reconnect failed: {}", e);
                }
            }
            recv(shutdown_rx) -> _ => break,
        }
    }
    debug!("HDI: Liveness watcher stopped");
}

impl SensorConnection for HdiConnection {
    fn connect(&self) -> Result<()> {
        self.shared.connect_with_retry()?;
        let (death_tx, death_rx) = unbounded();
        *self.shared.death_tx.lock() = Some(death_tx);
        self.shared.arm_death_notifier()?;
        self.spawn_watcher(death_rx)?;
        self.shared.connected.store(true, Ordering::Release);
        info!("HDI: Connected");
        Ok(())
    }

    fn get_sensor_list(&self) -> Result<Vec<SensorInfo>> {
        self.ensure_connected()?;
        let mut sensors = self.shared.driver.lock().get_sensor_list()?;
        if sensors.len() > self.shared.max_sensor_count {
            warn!(
                "HDI: Driver reported {} sensors, keeping the first {}",
                sensors.len(),
                self.shared.max_sensor_count
            );
            sensors.truncate(self.shared.max_sensor_count);
        }
        Ok(sensors)
    }

    fn enable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        self.ensure_connected()?;
        self.shared.driver.lock().enable(desc)?;
        match self.shared.replay.lock().get_mut(desc) {
            Some(rate) => rate.enabled = true,
            None => warn!("HDI: {} enabled before set_batch", desc),
        }
        Ok(())
    }

    fn disable_sensor(&self, desc: &SensorDescriptor) -> Result<()> {
        self.ensure_connected()?;
        self.shared.driver.lock().disable(desc)?;
        self.shared.replay.lock().remove(desc);
        Ok(())
    }

    fn set_batch(&self, desc: &SensorDescriptor, sampling_ns: i64, delay_ns: i64) -> Result<()> {
        self.ensure_connected()?;
        self.shared
            .driver
            .lock()
            .set_batch(desc, sampling_ns, delay_ns)?;
        let mut replay = self.shared.replay.lock();
        let enabled = replay.get(desc).is_some_and(|r| r.enabled);
        replay.insert(
            *desc,
            SensorRate {
                sampling_period_ns: sampling_ns,
                max_report_delay_ns: delay_ns,
                enabled,
            },
        );
        Ok(())
    }

    fn set_mode(&self, desc: &SensorDescriptor, mode: SensorMode) -> Result<()> {
        self.ensure_connected()?;
        self.shared.driver.lock().set_mode(desc, mode)
    }

    fn flush(&self, desc: &SensorDescriptor) -> Result<()> {
        self.ensure_connected()?;
        self.shared.driver.lock().flush(desc)
    }

    fn register_data_report(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        self.ensure_connected()?;
        let wrapped: Arc<dyn EventListener> = Arc::new(ModeFixup { inner: listener });
        self.shared
            .driver
            .lock()
            .register_event_callback(Arc::clone(&wrapped))?;
        *self.shared.listener.lock() = Some(wrapped);
        Ok(())
    }

    fn register_plug_callback(&self, listener: Arc<dyn PlugListener>) -> Result<()> {
        self.ensure_connected()?;
        self.shared
            .driver
            .lock()
            .register_plug_callback(Arc::clone(&listener))?;
        *self.shared.plug_listener.lock() = Some(listener);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        // Stop the watcher first so a late death notice can't reconnect us
        self.stop_watcher()?;
        self.shared.death_tx.lock().take();
        let result = self.shared.driver.lock().unregister();
        self.shared.listener.lock().take();
        self.shared.plug_listener.lock().take();
        self.shared.replay.lock().clear();
        self.shared.connected.store(false, Ordering::Release);
        info!("HDI: Connection destroyed");
        result
    }
}

impl Drop for HdiConnection {
    fn drop(&mut self) {
        let _ = self.stop_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::{DriverCall, DriverOp, MockSensorDriver};
    use std::time::Instant;

    const ACCEL: SensorDescriptor = SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1);
    const GYRO: SensorDescriptor = SensorDescriptor::new(1, sensor_type::GYROSCOPE, 0, 1);
    const PROX: SensorDescriptor = SensorDescriptor::new(1, sensor_type::PROXIMITY, 0, 1);

    struct Collect {
        events: parking_lot::Mutex<Vec<SensorEvent>>,
        resets: AtomicU64,
    }

    impl Collect {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: parking_lot::Mutex::new(Vec::new()),
                resets: AtomicU64::new(0),
            })
        }
    }

    impl EventListener for Collect {
        fn on_sample(&self, event: SensorEvent) {
            self.events.lock().push(event);
        }

        fn on_connection_reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> DriverConfig {
        DriverConfig {
            connect_retries: 3,
            retry_interval_ms: 1,
            ..DriverConfig::default()
        }
    }

    fn setup() -> (MockSensorDriver, HdiConnection) {
        let mock = MockSensorDriver::new(vec![
            SensorInfo::new(ACCEL, "accel"),
            SensorInfo::new(GYRO, "gyro"),
            SensorInfo::new(PROX, "prox"),
        ]);
        let conn = HdiConnection::new(Box::new(mock.clone()), &fast_config());
        (mock, conn)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_connect_retries_then_fails() {
        let (mock, conn) = setup();
        mock.fail_next_connects(5);
        assert!(matches!(
            conn.connect(),
            Err(Error::ConnectFailed { attempts: 3 })
        ));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.enable_sensor(&ACCEL),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_connect_succeeds_within_budget() {
        let (mock, conn) = setup();
        mock.fail_next_connects(2);
        conn.connect().unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.get_sensor_list().unwrap().len(), 3);
    }

    #[test]
    fn test_sensor_list_capped() {
        let mock = MockSensorDriver::new(vec![
            SensorInfo::new(ACCEL, "accel"),
            SensorInfo::new(GYRO, "gyro"),
        ]);
        let config = DriverConfig {
            max_sensor_count: 1,
            ..fast_config()
        };
        let conn = HdiConnection::new(Box::new(mock), &config);
        conn.connect().unwrap();
        assert_eq!(conn.get_sensor_list().unwrap().len(), 1);
    }

    #[test]
    fn test_replay_table_tracks_state() {
        let (_mock, conn) = setup();
        conn.connect().unwrap();
        conn.set_batch(&ACCEL, 10, 20).unwrap();
        assert!(!conn.replay_table()[&ACCEL].enabled);
        conn.enable_sensor(&ACCEL).unwrap();
        assert!(conn.replay_table()[&ACCEL].enabled);

        // Re-batching an enabled sensor keeps it enabled
        conn.set_batch(&ACCEL, 5, 5).unwrap();
        assert_eq!(conn.replay_table()[&ACCEL], SensorRate::new(5, 5));

        conn.disable_sensor(&ACCEL).unwrap();
        assert!(conn.replay_table().is_empty());
    }

    #[test]
    fn test_failed_driver_call_leaves_replay_untouched() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        mock.fail_op(DriverOp::SetBatch, Some(ACCEL));
        assert!(conn.set_batch(&ACCEL, 10, 20).is_err());
        assert!(conn.replay_table().is_empty());
    }

    #[test]
    fn test_death_triggers_replay_of_enabled_sensors() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        let sink = Collect::new();
        conn.register_data_report(sink.clone()).unwrap();

        conn.set_batch(&ACCEL, 10, 20).unwrap();
        conn.enable_sensor(&ACCEL).unwrap();
        // Batched but never enabled: must not be replayed
        conn.set_batch(&GYRO, 10, 0).unwrap();
        mock.clear_calls();

        mock.kill();
        assert!(wait_for(|| conn.reconnect_count() == 1));

        let calls = mock.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, DriverCall::Enable(_)))
                .collect::<Vec<_>>(),
            vec![&DriverCall::Enable(ACCEL)]
        );
        assert!(calls.contains(&DriverCall::SetBatch(ACCEL, 10, 20)));
        assert!(!calls.iter().any(|c| matches!(c, DriverCall::SetBatch(d, _, _) if *d == GYRO)));
        assert!(mock.is_hw_enabled(&ACCEL));
        assert_eq!(sink.resets.load(Ordering::SeqCst), 1);

        // Callback was re-registered with the new connection
        assert!(mock.inject_event(SensorEvent::new(ACCEL, 1, SensorMode::Realtime, &[])));
        assert_eq!(sink.events.lock().len(), 1);
    }

    #[test]
    fn test_replay_skips_failing_sensor() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        conn.set_batch(&ACCEL, 10, 0).unwrap();
        conn.enable_sensor(&ACCEL).unwrap();
        conn.set_batch(&GYRO, 10, 0).unwrap();
        conn.enable_sensor(&GYRO).unwrap();

        mock.fail_op(DriverOp::Enable, Some(ACCEL));
        mock.kill();
        assert!(wait_for(|| conn.reconnect_count() == 1));
        assert!(!mock.is_hw_enabled(&ACCEL));
        assert!(mock.is_hw_enabled(&GYRO));
    }

    #[test]
    fn test_failed_reconnect_stays_down_until_next_one() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        conn.set_batch(&ACCEL, 10, 0).unwrap();
        conn.enable_sensor(&ACCEL).unwrap();
        mock.clear_calls();

        // every attempt of the retry budget is refused
        mock.fail_next_connects(3);
        mock.kill();
        assert!(wait_for(|| mock.count_calls(|c| matches!(c, DriverCall::Connect)) == 3));
        thread::sleep(Duration::from_millis(20));

        assert!(!conn.is_connected());
        assert_eq!(conn.reconnect_count(), 0);
        assert!(!mock.is_hw_enabled(&ACCEL));
        assert!(matches!(
            conn.enable_sensor(&GYRO),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            conn.set_batch(&GYRO, 10, 0),
            Err(Error::NotInitialized)
        ));
        assert!(conn.replay_table()[&ACCEL].enabled);

        // driver is back: the next reconnect replays the table
        conn.reconnect().unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.reconnect_count(), 1);
        assert!(mock.is_hw_enabled(&ACCEL));
        assert!(!mock.is_hw_enabled(&GYRO));
    }

    #[test]
    fn test_proximity_forced_on_change() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        let sink = Collect::new();
        conn.register_data_report(sink.clone()).unwrap();
        mock.inject_event(SensorEvent::new(PROX, 1, SensorMode::Realtime, &[]));
        mock.inject_event(SensorEvent::new(ACCEL, 1, SensorMode::Realtime, &[]));
        let events = sink.events.lock();
        assert_eq!(events[0].mode, SensorMode::OnChange);
        assert_eq!(events[1].mode, SensorMode::Realtime);
    }

    #[test]
    fn test_destroy_stops_reconnect() {
        let (mock, conn) = setup();
        conn.connect().unwrap();
        conn.destroy().unwrap();
        assert!(!conn.is_connected());
        mock.kill();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(conn.reconnect_count(), 0);
        assert!(mock.calls().contains(&DriverCall::Unregister));
    }
}
