//! Sensor hub: the service context and its RPC surface
//!
//! [`SensorHub`] owns every shared component (registry, catalog, flush queue,
//! driver facade, delivery thread, active-info server, power policy) and
//! exposes the operations clients call: enable/disable, data channels,
//! suspend/resume, flush and active-info push.
//!
//! Driver samples enter through the [`EventBuffer`] registered as the data
//! report and are fanned out on the delivery thread. Everything else runs on
//! the caller's thread.

mod manager;

pub use manager::{PROXIMITY_FAR, SensorManager};

use crate::active_info::StreamServer;
use crate::catalog::SensorCatalog;
use crate::channel::{ClientChannel, DataChannel};
use crate::config::HubConfig;
use crate::connection::{
    CompatibleConnection, ConnectionFacade, HdiConnection, SensorConnection, synthetic_sensors,
};
use crate::core::driver::{EventListener, PlugListener, SensorDriver};
use crate::core::event::SensorEvent;
use crate::core::types::{ActiveInfo, AppThreadInfo, SensorDescriptor, SensorInfo, SensorRate};
use crate::error::{Error, Result};
use crate::fanout::{DeliveryItem, DeliveryThread, EventBuffer, FanoutEngine, FanoutStatsSnapshot};
use crate::flush::FlushQueue;
use crate::power::PowerPolicy;
use crate::registry::{ChannelInfo, MIN_PID, SubscriptionRegistry};
use crate::transport::SocketEnd;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::slice;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Permission checks supplied by the platform
pub trait AccessControl: Send + Sync {
    fn check_permission(&self, pid: i32, sensor_type: i32) -> bool;

    /// System processes get larger socket buffers
    fn is_native_caller(&self, pid: i32) -> bool;
}

/// Grants everything; used when no platform policy is wired in
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_permission(&self, _pid: i32, _sensor_type: i32) -> bool {
        true
    }

    fn is_native_caller(&self, _pid: i32) -> bool {
        false
    }
}

/// Keeps the sensor map in step with hot-plug notifications
struct PlugHandler {
    facade: Weak<ConnectionFacade>,
    catalog: Arc<SensorCatalog>,
}

impl PlugListener for PlugHandler {
    fn on_plug_event(&self, desc: SensorDescriptor, plugged_in: bool) {
        let Some(facade) = self.facade.upgrade() else {
            return;
        };
        if plugged_in {
            if self.catalog.contains(&desc) {
                return;
            }
            match facade.get_sensor_list_by_device(desc.device_id) {
                Ok(sensors) => {
                    info!("Hub: {} plugged in, device {} has {} sensors", desc, desc.device_id, sensors.len());
                    for info in sensors {
                        self.catalog.insert(info);
                    }
                }
                Err(e) => error!("Hub: sensor list of device {} failed: {}", desc.device_id, e),
            }
        } else {
            facade.plug_erase_sensor(&desc);
            self.catalog.remove(&desc);
            info!("Hub: {} unplugged", desc);
        }
    }
}

/// Last samples of one sensor, for [`SensorHub::dump`]
#[derive(Debug, Clone, Serialize)]
pub struct SensorHistory {
    pub sensor: SensorDescriptor,
    pub name: String,
    pub samples: Vec<DumpSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpSample {
    pub timestamp_ns: i64,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubDump {
    pub sensors: Vec<SensorInfo>,
    pub subscriptions: Vec<ChannelInfo>,
    pub history: Vec<SensorHistory>,
    pub active_info_pids: Vec<i32>,
    pub suspended_pids: Vec<i32>,
    pub stats: HubStats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HubStats {
    pub delivery: FanoutStatsSnapshot,
    pub buffer_overwritten: u64,
    pub channels: usize,
    pub subscriptions: usize,
    pub sessions: usize,
    pub suspended: usize,
}

pub struct SensorHub {
    config: HubConfig,
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<SensorCatalog>,
    flush_queue: Arc<FlushQueue>,
    facade: Arc<ConnectionFacade>,
    events: Arc<EventBuffer>,
    delivery: Option<DeliveryThread>,
    server: StreamServer,
    manager: Arc<SensorManager>,
    power: PowerPolicy,
    access: Arc<dyn AccessControl>,
    /// Serializes enable/disable so the registry and driver agree
    service_lock: Mutex<()>,
}

impl SensorHub {
    /// Connect the driver backends and start the delivery thread
    ///
    /// `make_compatible(device_id, types)` builds the backend serving the
    /// synthetic sensor types the primary driver lacks.
    pub fn start<F>(
        config: HubConfig,
        primary: Box<dyn SensorConnection>,
        make_compatible: F,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self>
    where
        F: FnOnce(i32, &[i32]) -> Box<dyn SensorConnection>,
    {
        let facade = Arc::new(ConnectionFacade::connect(
            primary,
            make_compatible,
            config.driver.compatible_backend,
        )?);

        let catalog = Arc::new(SensorCatalog::new());
        let mut sensors = facade.get_sensor_list();
        sensors.truncate(config.driver.max_sensor_count);
        catalog.replace_all(sensors);

        let registry = Arc::new(SubscriptionRegistry::new(config.delivery.dump_queue_len));
        let flush_queue = Arc::new(FlushQueue::new());
        let events = Arc::new(EventBuffer::new(config.delivery.event_buffer_len));

        let engine = FanoutEngine::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&flush_queue),
        );
        let delivery = DeliveryThread::spawn(engine, Arc::clone(&events))?;

        let listener: Arc<dyn EventListener> = Arc::clone(&events) as Arc<dyn EventListener>;
        facade.register_data_report(listener)?;
        facade.register_plug_callback(Arc::new(PlugHandler {
            facade: Arc::downgrade(&facade),
            catalog: Arc::clone(&catalog),
        }))?;

        let manager = Arc::new(SensorManager::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&facade),
        ));
        let power = PowerPolicy::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            config.delivery.max_event_count,
            config.driver.max_sensor_count,
        );
        let server = StreamServer::new(&config.transport);

        info!("Hub: started with {} sensors", catalog.len());
        Ok(Self {
            config,
            registry,
            catalog,
            flush_queue,
            facade,
            events,
            delivery: Some(delivery),
            server,
            manager,
            power,
            access,
            service_lock: Mutex::new(()),
        })
    }

    /// Start against a raw driver, with simulated compatible sensors
    pub fn with_driver(config: HubConfig, driver: Box<dyn SensorDriver>) -> Result<Self> {
        let primary = HdiConnection::new(driver, &config.driver);
        let simulation = config.mock.clone();
        Self::start(
            config,
            Box::new(primary),
            move |device_id: i32, types: &[i32]| -> Box<dyn SensorConnection> {
                let sensors = synthetic_sensors(device_id, types);
                Box::new(CompatibleConnection::new(sensors).with_simulation(simulation))
            },
            Arc::new(AllowAll),
        )
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn facade(&self) -> &Arc<ConnectionFacade> {
        &self.facade
    }

    pub fn get_sensor_list(&self) -> Vec<SensorInfo> {
        self.catalog.list()
    }

    fn check_permission(&self, pid: i32, desc: &SensorDescriptor) -> Result<()> {
        if self.access.check_permission(pid, desc.sensor_type) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "pid {} on sensor type {}",
                pid, desc.sensor_type
            )))
        }
    }

    // ----- enable / disable -----

    /// Subscribe `pid` to `desc` at `period_ns`, tolerating `delay_ns` of batching
    pub fn enable_sensor(&self, desc: SensorDescriptor, pid: i32, period_ns: i64, delay_ns: i64) -> Result<()> {
        self.check_permission(pid, &desc)?;
        if !self.catalog.contains(&desc) {
            return Err(Error::InvalidDescriptor(desc));
        }
        if pid < MIN_PID {
            return Err(Error::InvalidParameter(format!("invalid pid {}", pid)));
        }
        if period_ns <= 0 || delay_ns < 0 {
            return Err(Error::InvalidParameter(format!(
                "period {} ns, delay {} ns",
                period_ns, delay_ns
            )));
        }
        if delay_ns / period_ns > self.config.delivery.max_event_count {
            return Err(Error::InvalidParameter(format!(
                "delay/period {} exceeds {}",
                delay_ns / period_ns,
                self.config.delivery.max_event_count
            )));
        }

        let _guard = self.service_lock.lock();
        let prior = self.registry.get_cur_pid_rate(&desc, pid);
        if self.registry.get_sensor_state(&desc) {
            debug!("Hub: {} already running, adding pid {}", desc, pid);
            self.manager.save_subscriber(&desc, pid, period_ns, delay_ns)?;
            if let Err(e) = self.manager.set_best_sensor_params(&desc) {
                self.restore_subscriber(&desc, pid, prior);
                return Err(e);
            }
            self.enable_flush(&desc, pid);
            self.report_on_change_data(&desc, pid);
            self.report_active_info(&desc, pid);
            return Ok(());
        }

        self.manager.save_subscriber(&desc, pid, period_ns, delay_ns)?;
        if let Err(e) = self.manager.set_best_sensor_params(&desc) {
            self.restore_subscriber(&desc, pid, prior);
            return Err(e);
        }
        if let Err(e) = self.manager.enable_at_driver(&desc) {
            error!("Hub: enable {} for pid {} failed: {}", desc, pid, e);
            self.restore_subscriber(&desc, pid, prior);
            return Err(e);
        }
        info!("Hub: {} enabled for pid {}", desc, pid);
        self.report_active_info(&desc, pid);
        Ok(())
    }

    /// Put back the rate `pid` held before a failed enable, or drop the entry
    fn restore_subscriber(&self, desc: &SensorDescriptor, pid: i32, prior: Option<SensorRate>) {
        match prior {
            Some(rate) => {
                if let Err(e) = self.registry.update_sensor_info(*desc, pid, rate) {
                    warn!("Hub: restoring pid {} on {} failed: {}", pid, desc, e);
                    self.registry.remove_subscriber(desc, pid);
                }
            }
            None => {
                self.registry.remove_subscriber(desc, pid);
            }
        }
    }

    /// Flush a batching sensor a new subscriber joined while it was running
    ///
    /// Samples already sitting in the hardware FIFO were batched for the
    /// other subscribers; the new channel sees nothing until the flush
    /// completes. The completion itself is not delivered.
    fn enable_flush(&self, desc: &SensorDescriptor, pid: i32) {
        let batching = self
            .catalog
            .get(desc)
            .is_some_and(|info| info.fifo_max_event_count > 0);
        if !batching {
            return;
        }
        let Some(channel) = self.registry.get_channel_by_pid(pid) else {
            return;
        };
        let channel_id = channel.id();
        self.flush_queue.request_flush(*desc, channel, true);
        match self.facade.flush(desc) {
            Ok(()) => {}
            Err(Error::NotSupported(_)) => {
                self.events
                    .push(DeliveryItem::Event(SensorEvent::flush_complete(*desc, now_ns())));
            }
            Err(e) => {
                warn!("Hub: enable flush of {} for pid {} failed: {}", desc, pid, e);
                self.flush_queue.cancel_last(desc, channel_id);
            }
        }
    }

    /// Unsubscribe `pid`; the driver is only told when nobody else listens
    pub fn disable_sensor(&self, desc: SensorDescriptor, pid: i32) -> Result<()> {
        self.check_permission(pid, &desc)?;
        let _guard = self.service_lock.lock();
        self.disable_locked(desc, pid)
    }

    fn disable_locked(&self, desc: SensorDescriptor, pid: i32) -> Result<()> {
        let known = self.catalog.contains(&desc);
        if !known && !self.registry.get_sensor_state(&desc) {
            return Err(Error::InvalidDescriptor(desc));
        }
        if pid < MIN_PID {
            return Err(Error::InvalidParameter(format!("invalid pid {}", pid)));
        }
        if self.manager.is_other_client_using_sensor(&desc, pid) {
            debug!("Hub: {} still used by other clients", desc);
            return Ok(());
        }
        if let Err(e) = self.manager.disable_at_driver(&desc) {
            if known {
                error!("Hub: disable {} failed: {}", desc, e);
                return Err(e);
            }
            warn!("Hub: disable of unplugged {} failed: {}", desc, e);
        }
        self.registry.clear_dump_queue(&desc);
        self.manager.after_disable_sensor(&desc);
        info!("Hub: {} disabled (last pid {})", desc, pid);
        Ok(())
    }

    /// Send the last stored on-change value to a new subscriber right away
    fn report_on_change_data(&self, desc: &SensorDescriptor, pid: i32) {
        if !self.manager.has_on_change_value(desc) {
            return;
        }
        let (Some(event), Some(channel)) = (
            self.registry.get_store_event(desc),
            self.registry.get_channel_by_pid(pid),
        ) else {
            return;
        };
        if let Err(e) = channel.send_events(slice::from_ref(&event)) {
            warn!("Hub: on-change replay of {} to pid {} failed: {}", desc, pid, e);
        }
    }

    fn report_active_info(&self, desc: &SensorDescriptor, pid: i32) {
        let pids = self.registry.active_info_pids();
        if pids.is_empty() {
            return;
        }
        let Some(rate) = self.registry.get_cur_pid_rate(desc, pid) else {
            return;
        };
        let info = ActiveInfo::new(pid, desc, &rate);
        let sent = self.power.report_active_info(&info, &self.server, &pids);
        debug!("Hub: active info for pid {} sent to {}/{} observers", pid, sent, pids.len());
    }

    // ----- data channels -----

    /// Create `pid`'s sample channel and return the client end
    pub fn create_data_channel(&self, pid: i32, uid: i32, access_token: u32) -> Result<ClientChannel> {
        let buf_size = if self.access.is_native_caller(pid) {
            self.config.transport.native_socket_buf_size
        } else {
            self.config.transport.socket_buf_size
        };
        let (channel, client) = DataChannel::pair(pid, buf_size, &self.config.transport)?;
        self.register_data_channel(pid, uid, access_token, channel)?;
        Ok(client)
    }

    /// Attach an already built channel to `pid`
    pub fn register_data_channel(
        &self,
        pid: i32,
        uid: i32,
        access_token: u32,
        channel: Arc<DataChannel>,
    ) -> Result<()> {
        self.registry.update_app_thread_info(AppThreadInfo {
            pid,
            uid,
            access_token,
        })?;
        self.registry.update_data_channel(pid, channel)?;
        debug!("Hub: data channel for pid {} (uid {})", pid, uid);
        Ok(())
    }

    pub fn destroy_data_channel(&self, pid: i32) -> Result<()> {
        if let Some(channel) = self.registry.get_channel_by_pid(pid) {
            self.flush_queue.remove_channel(channel.id());
        }
        if !self.registry.destroy_data_channel(pid) {
            return Err(Error::NotFound(format!("no data channel for pid {}", pid)));
        }
        self.registry.destroy_app_thread_info(pid);
        Ok(())
    }

    // ----- power -----

    pub fn suspend(&self, pid: i32) -> Result<()> {
        let _guard = self.service_lock.lock();
        self.power.suspend(pid)
    }

    pub fn resume(&self, pid: i32) -> Result<()> {
        let _guard = self.service_lock.lock();
        self.power.resume(pid)
    }

    /// Resume every suspended pid
    pub fn reset_sensors(&self) -> Result<()> {
        let _guard = self.service_lock.lock();
        self.power.reset_all()
    }

    pub fn is_suspended(&self, pid: i32) -> bool {
        self.power.is_suspended(pid)
    }

    // ----- active info -----

    pub fn get_active_info_list(&self, pid: i32) -> Vec<ActiveInfo> {
        self.power.get_active_info_list(pid)
    }

    /// Open the active-info stream for `pid` and return the client end
    pub fn create_socket_channel(&self, pid: i32, uid: i32) -> Result<SocketEnd> {
        let native = self.access.is_native_caller(pid);
        self.server.add_socket_pair(uid, pid, native)
    }

    pub fn destroy_socket_channel(&self, pid: i32) -> Result<()> {
        if self.server.del_session(pid) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("no active-info session for pid {}", pid)))
        }
    }

    pub fn enable_active_info_push(&self, pid: i32) -> Result<()> {
        if !self.registry.add_active_info_pid(pid) {
            return Err(Error::InvalidParameter(format!(
                "active info push already enabled for pid {}",
                pid
            )));
        }
        Ok(())
    }

    pub fn disable_active_info_push(&self, pid: i32) -> Result<()> {
        if !self.registry.del_active_info_pid(pid) {
            return Err(Error::NotFound(format!("active info push not enabled for pid {}", pid)));
        }
        Ok(())
    }

    // ----- flush -----

    /// Ask for buffered samples of `desc` to be delivered now
    ///
    /// Completion arrives on `pid`'s channel as a flush-complete sample. A
    /// backend without hardware FIFO completes immediately.
    pub fn flush(&self, desc: SensorDescriptor, pid: i32) -> Result<()> {
        if !self.catalog.contains(&desc) {
            return Err(Error::InvalidDescriptor(desc));
        }
        let channel = self
            .registry
            .get_channel_by_pid(pid)
            .ok_or_else(|| Error::NotFound(format!("no data channel for pid {}", pid)))?;
        let channel_id = channel.id();
        self.flush_queue.request_flush(desc, channel, false);
        match self.facade.flush(&desc) {
            Ok(()) => Ok(()),
            Err(Error::NotSupported(_)) => {
                debug!("Hub: {} has no FIFO, completing flush", desc);
                self.events
                    .push(DeliveryItem::Event(SensorEvent::flush_complete(desc, now_ns())));
                Ok(())
            }
            Err(e) => {
                self.flush_queue.cancel_last(&desc, channel_id);
                Err(e)
            }
        }
    }

    // ----- client lifecycle -----

    /// Release everything a dead client held
    pub fn on_client_death(&self, pid: i32) {
        info!("Hub: client {} died", pid);
        let _guard = self.service_lock.lock();
        self.power.delete_death_pid(pid);
        for desc in self.registry.get_sensor_ids_by_pid(pid) {
            if let Err(e) = self.disable_locked(desc, pid) {
                error!("Hub: disable {} for dead pid {} failed: {}", desc, pid, e);
            }
        }
        self.server.del_session(pid);
        self.registry.del_active_info_pid(pid);
        if let Some(channel) = self.registry.get_channel_by_pid(pid) {
            self.flush_queue.remove_channel(channel.id());
        }
        self.registry.destroy_data_channel(pid);
        self.registry.destroy_app_thread_info(pid);
    }

    /// Grant or revoke a named permission for the pid owning `access_token`
    pub fn change_sensor_perm(&self, access_token: u32, perm_name: &str, granted: bool) -> Result<()> {
        self.registry.change_sensor_perm(access_token, perm_name, granted)
    }

    // ----- diagnostics -----

    pub fn stats(&self) -> HubStats {
        let delivery = self
            .delivery
            .as_ref()
            .map(|d| d.stats().snapshot())
            .unwrap_or_default();
        HubStats {
            delivery,
            buffer_overwritten: self.events.overwritten(),
            channels: self.registry.all_channels().len(),
            subscriptions: self.registry.subscriptions().len(),
            sessions: self.server.session_count(),
            suspended: self.power.suspended_pids().len(),
        }
    }

    pub fn dump(&self) -> HubDump {
        let history = self
            .registry
            .dump_queue_sensors()
            .into_iter()
            .map(|sensor| SensorHistory {
                sensor,
                name: self
                    .catalog
                    .get(&sensor)
                    .map_or_else(String::new, |info| info.name),
                samples: self
                    .registry
                    .get_dump_queue(&sensor)
                    .iter()
                    .map(|event| DumpSample {
                        timestamp_ns: event.timestamp_ns,
                        values: event.values(),
                    })
                    .collect(),
            })
            .collect();
        HubDump {
            sensors: self.catalog.list(),
            subscriptions: self.registry.get_channel_info(),
            history,
            active_info_pids: self.registry.active_info_pids(),
            suspended_pids: self.power.suspended_pids(),
            stats: self.stats(),
        }
    }

    /// Dump rendered as pretty JSON
    pub fn dump_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.dump()).map_err(|e| Error::Other(e.to_string()))
    }

    /// Rate `pid` currently holds on `desc`
    pub fn subscription(&self, desc: &SensorDescriptor, pid: i32) -> Option<SensorRate> {
        self.registry.get_cur_pid_rate(desc, pid)
    }

    /// Stop driver callbacks, then drain and join the delivery thread
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(mut delivery) = self.delivery.take() else {
            return Ok(());
        };
        info!("Hub: shutting down");
        if let Err(e) = self.facade.destroy() {
            warn!("Hub: driver teardown failed: {}", e);
        }
        delivery.shutdown()?;
        self.server.close_all();
        for channel in self.registry.all_channels() {
            channel.close();
        }
        let stats = delivery.stats().snapshot();
        info!(
            "Hub: delivered {} samples in {} batches ({} send failures)",
            stats.samples_sent, stats.batches_sent, stats.send_failures
        );
        Ok(())
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}
