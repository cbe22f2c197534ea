//! Subscription registry: who subscribes to what, and where samples go
//!
//! Each guarded map is its own newtype holding its own lock. No accessor of
//! one map calls into another while holding its lock; cross-map queries
//! (e.g. "channels of the subscribers of X") copy what they need out of the
//! first map, release it, then consult the second.

use crate::channel::DataChannel;
use crate::core::event::SensorEvent;
use crate::core::types::{AppThreadInfo, SensorDescriptor, SensorRate, sensor_type};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lowest valid pid
pub const MIN_PID: i32 = 0;

/// Permission names and the sensor types each one gates
pub mod permission {
    use crate::core::types::sensor_type;

    pub const ACTIVITY_MOTION: &str = "activity_motion";
    pub const READ_HEALTH_DATA: &str = "read_health_data";

    pub fn sensor_types(name: &str) -> Option<&'static [i32]> {
        match name {
            ACTIVITY_MOTION => Some(&[sensor_type::PEDOMETER_DETECTION, sensor_type::PEDOMETER]),
            READ_HEALTH_DATA => Some(&[sensor_type::HEART_RATE]),
            _ => None,
        }
    }
}

/// One pid's entry for one sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub rate: SensorRate,
    pub perm_granted: bool,
}

/// Channel/subscription pairing reported in dumps
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub pid: i32,
    pub uid: i32,
    pub channel_id: u64,
    pub sensor: SensorDescriptor,
    pub sampling_period_ns: i64,
    pub max_report_delay_ns: i64,
}

#[derive(Default)]
struct ClientMap(Mutex<HashMap<SensorDescriptor, BTreeMap<i32, Subscription>>>);

impl ClientMap {
    fn upsert(&self, desc: SensorDescriptor, pid: i32, rate: SensorRate) {
        let mut map = self.0.lock();
        let subs = map.entry(desc).or_default();
        let perm_granted = subs.get(&pid).is_none_or(|s| s.perm_granted);
        subs.insert(pid, Subscription { rate, perm_granted });
    }

    fn remove(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        let mut map = self.0.lock();
        let Some(subs) = map.get_mut(desc) else {
            return false;
        };
        let removed = subs.remove(&pid).is_some();
        if subs.is_empty() {
            map.remove(desc);
        }
        removed
    }

    fn remove_sensor(&self, desc: &SensorDescriptor) {
        self.0.lock().remove(desc);
    }

    fn any_enabled(&self, desc: &SensorDescriptor) -> bool {
        self.0
            .lock()
            .get(desc)
            .is_some_and(|subs| subs.values().any(|s| s.rate.enabled))
    }

    fn best_rate(&self, desc: &SensorDescriptor) -> SensorRate {
        let map = self.0.lock();
        let mut best = SensorRate::unbounded();
        if let Some(subs) = map.get(desc) {
            for sub in subs.values() {
                best.sampling_period_ns = best.sampling_period_ns.min(sub.rate.sampling_period_ns);
                best.max_report_delay_ns = best.max_report_delay_ns.min(sub.rate.max_report_delay_ns);
                best.enabled |= sub.rate.enabled;
            }
        }
        best
    }

    fn only_pid_enabled(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        let map = self.0.lock();
        let Some(subs) = map.get(desc) else {
            return false;
        };
        let mut found = false;
        for (&other, sub) in subs {
            if !sub.rate.enabled {
                continue;
            }
            if other != pid {
                return false;
            }
            found = true;
        }
        found
    }

    fn rate_of(&self, desc: &SensorDescriptor, pid: i32) -> Option<SensorRate> {
        self.0.lock().get(desc)?.get(&pid).map(|s| s.rate)
    }

    fn granted_pids(&self, desc: &SensorDescriptor) -> Vec<i32> {
        self.0.lock().get(desc).map_or_else(Vec::new, |subs| {
            subs.iter()
                .filter(|(_, s)| s.perm_granted)
                .map(|(&pid, _)| pid)
                .collect()
        })
    }

    fn set_perm(&self, pid: i32, sensor_type: i32, granted: bool) -> usize {
        let mut changed = 0;
        for (desc, subs) in self.0.lock().iter_mut() {
            if desc.sensor_type != sensor_type {
                continue;
            }
            if let Some(sub) = subs.get_mut(&pid) {
                sub.perm_granted = granted;
                changed += 1;
            }
        }
        changed
    }

    fn sensors_of(&self, pid: i32) -> Vec<SensorDescriptor> {
        let mut out: Vec<_> = self
            .0
            .lock()
            .iter()
            .filter(|(_, subs)| subs.contains_key(&pid))
            .map(|(desc, _)| *desc)
            .collect();
        out.sort();
        out
    }

    fn snapshot(&self) -> Vec<(SensorDescriptor, i32, SensorRate)> {
        let map = self.0.lock();
        let mut out: Vec<_> = map
            .iter()
            .flat_map(|(desc, subs)| subs.iter().map(move |(&pid, s)| (*desc, pid, s.rate)))
            .collect();
        out.sort_by_key(|(desc, pid, _)| (*desc, *pid));
        out
    }
}

#[derive(Default)]
struct ChannelMap(Mutex<HashMap<i32, Arc<DataChannel>>>);

impl ChannelMap {
    fn insert(&self, pid: i32, channel: Arc<DataChannel>) -> Option<Arc<DataChannel>> {
        self.0.lock().insert(pid, channel)
    }

    fn remove(&self, pid: i32) -> Option<Arc<DataChannel>> {
        self.0.lock().remove(&pid)
    }

    fn get(&self, pid: i32) -> Option<Arc<DataChannel>> {
        self.0.lock().get(&pid).cloned()
    }

    fn get_many(&self, pids: &[i32]) -> Vec<Arc<DataChannel>> {
        let map = self.0.lock();
        pids.iter().filter_map(|pid| map.get(pid).cloned()).collect()
    }

    fn all(&self) -> Vec<Arc<DataChannel>> {
        self.0.lock().values().cloned().collect()
    }

    fn pid_of(&self, channel_id: u64) -> Option<i32> {
        self.0
            .lock()
            .iter()
            .find(|(_, ch)| ch.id() == channel_id)
            .map(|(&pid, _)| pid)
    }
}

#[derive(Default)]
struct AppInfoMap(Mutex<HashMap<i32, AppThreadInfo>>);

impl AppInfoMap {
    fn insert(&self, info: AppThreadInfo) {
        self.0.lock().insert(info.pid, info);
    }

    fn remove(&self, pid: i32) {
        self.0.lock().remove(&pid);
    }

    fn get(&self, pid: i32) -> Option<AppThreadInfo> {
        self.0.lock().get(&pid).copied()
    }

    fn pid_by_token(&self, token: u32) -> Option<i32> {
        self.0
            .lock()
            .values()
            .find(|info| info.access_token == token)
            .map(|info| info.pid)
    }
}

#[derive(Default)]
struct DumpQueue(Mutex<HashMap<SensorDescriptor, VecDeque<SensorEvent>>>);

#[derive(Default)]
struct StoredEvents(Mutex<HashMap<SensorDescriptor, SensorEvent>>);

/// Subscription, channel and per-pid bookkeeping
pub struct SubscriptionRegistry {
    clients: ClientMap,
    channels: ChannelMap,
    app_info: AppInfoMap,
    active_info_pids: Mutex<BTreeSet<i32>>,
    dump_queue: DumpQueue,
    stored_events: StoredEvents,
    dump_queue_len: usize,
    /// Bumped whenever a channel is destroyed so the delivery thread can
    /// prune per-channel state
    channel_epoch: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(dump_queue_len: usize) -> Self {
        Self {
            clients: ClientMap::default(),
            channels: ChannelMap::default(),
            app_info: AppInfoMap::default(),
            active_info_pids: Mutex::new(BTreeSet::new()),
            dump_queue: DumpQueue::default(),
            stored_events: StoredEvents::default(),
            dump_queue_len: dump_queue_len.max(1),
            channel_epoch: AtomicU64::new(0),
        }
    }

    // ----- subscriptions -----

    /// Insert or replace `(desc, pid) -> rate`
    pub fn update_sensor_info(&self, desc: SensorDescriptor, pid: i32, rate: SensorRate) -> Result<()> {
        if !desc.is_valid() {
            return Err(Error::InvalidDescriptor(desc));
        }
        if pid < MIN_PID {
            return Err(Error::InvalidParameter(format!("invalid pid {}", pid)));
        }
        if !rate.enabled {
            return Err(Error::InvalidParameter(format!("rate for {} not enabled", desc)));
        }
        self.clients.upsert(desc, pid, rate);
        Ok(())
    }

    /// Erase one pid's entry; the sensor key goes with its last entry
    pub fn remove_subscriber(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        self.clients.remove(desc, pid)
    }

    /// Forget every subscriber of a sensor
    pub fn clear_sensor_info(&self, desc: &SensorDescriptor) {
        self.clients.remove_sensor(desc);
    }

    /// True if any pid has the sensor enabled
    pub fn get_sensor_state(&self, desc: &SensorDescriptor) -> bool {
        desc.is_valid() && self.clients.any_enabled(desc)
    }

    /// Element-wise minimum over the sensor's entries
    ///
    /// Returns [`SensorRate::unbounded`] when the sensor has no entries.
    pub fn get_best_rate(&self, desc: &SensorDescriptor) -> SensorRate {
        if !desc.is_valid() {
            return SensorRate::unbounded();
        }
        self.clients.best_rate(desc)
    }

    /// True iff `pid` is the sole enabled subscriber
    pub fn only_current_pid_enabled(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        if !desc.is_valid() || pid < MIN_PID {
            return false;
        }
        self.clients.only_pid_enabled(desc, pid)
    }

    pub fn get_cur_pid_rate(&self, desc: &SensorDescriptor, pid: i32) -> Option<SensorRate> {
        self.clients.rate_of(desc, pid)
    }

    pub fn is_subscribed(&self, desc: &SensorDescriptor, pid: i32) -> bool {
        self.get_cur_pid_rate(desc, pid).is_some()
    }

    /// Sensors `pid` holds an entry for, in descriptor order
    pub fn get_sensor_ids_by_pid(&self, pid: i32) -> Vec<SensorDescriptor> {
        self.clients.sensors_of(pid)
    }

    /// Every `(sensor, pid, rate)` entry, ordered
    pub fn subscriptions(&self) -> Vec<(SensorDescriptor, i32, SensorRate)> {
        self.clients.snapshot()
    }

    /// Channels of the subscribers currently allowed to see this sensor
    pub fn get_channels_for(&self, desc: &SensorDescriptor) -> Vec<Arc<DataChannel>> {
        let pids = self.clients.granted_pids(desc);
        if pids.is_empty() {
            return Vec::new();
        }
        self.channels.get_many(&pids)
    }

    /// Grant or revoke delivery of one sensor type to `pid`
    pub fn set_permission_state(&self, pid: i32, sensor_type: i32, granted: bool) {
        let changed = self.clients.set_perm(pid, sensor_type, granted);
        log::debug!(
            "Permission for pid {} type {} -> {} ({} entries)",
            pid,
            sensor_type,
            granted,
            changed
        );
    }

    /// Apply a permission change identified by access token and permission name
    pub fn change_sensor_perm(&self, access_token: u32, perm_name: &str, granted: bool) -> Result<()> {
        let pid = self
            .app_info
            .pid_by_token(access_token)
            .ok_or_else(|| Error::NotFound(format!("no pid for token {}", access_token)))?;
        let types = permission::sensor_types(perm_name)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown permission {}", perm_name)))?;
        for &sensor_type in types {
            self.set_permission_state(pid, sensor_type, granted);
        }
        Ok(())
    }

    /// Downsampling ratio of the channel's requested period to the hardware period
    ///
    /// Zero means the channel gets nothing from this sensor.
    pub fn compute_best_period_count(&self, desc: &SensorDescriptor, channel: &DataChannel) -> u64 {
        let best = self.get_best_rate(desc).sampling_period_ns;
        if best == 0 || best == i64::MAX {
            return 0;
        }
        let Some(cur) = self.get_cur_pid_rate(desc, channel.pid()) else {
            return 0;
        };
        let ratio = cur.sampling_period_ns / best;
        if ratio <= 0 { 0 } else { ratio as u64 }
    }

    /// Batch depth the channel asked for
    pub fn compute_best_fifo_count(&self, desc: &SensorDescriptor, channel: &DataChannel) -> u64 {
        let Some(cur) = self.get_cur_pid_rate(desc, channel.pid()) else {
            return 0;
        };
        if cur.sampling_period_ns == 0 {
            return 0;
        }
        let ratio = cur.max_report_delay_ns / cur.sampling_period_ns;
        if ratio <= 0 { 0 } else { ratio as u64 }
    }

    // ----- channels -----

    /// Register a pid's channel, closing any channel it replaces
    pub fn update_data_channel(&self, pid: i32, channel: Arc<DataChannel>) -> Result<()> {
        if pid < MIN_PID {
            return Err(Error::InvalidParameter(format!("invalid pid {}", pid)));
        }
        if let Some(old) = self.channels.insert(pid, channel) {
            old.close();
            self.channel_epoch.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Close and drop a pid's channel
    pub fn destroy_data_channel(&self, pid: i32) -> bool {
        match self.channels.remove(pid) {
            Some(channel) => {
                channel.close();
                self.channel_epoch.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    pub fn get_channel_by_pid(&self, pid: i32) -> Option<Arc<DataChannel>> {
        self.channels.get(pid)
    }

    pub fn all_channels(&self) -> Vec<Arc<DataChannel>> {
        self.channels.all()
    }

    pub fn channel_epoch(&self) -> u64 {
        self.channel_epoch.load(Ordering::Acquire)
    }

    /// Channel and subscription pairs for diagnostics
    pub fn get_channel_info(&self) -> Vec<ChannelInfo> {
        let mut out = Vec::new();
        for (sensor, pid, rate) in self.clients.snapshot() {
            let Some(channel) = self.channels.get(pid) else {
                continue;
            };
            let uid = self.app_info.get(pid).map_or(-1, |info| info.uid);
            out.push(ChannelInfo {
                pid,
                uid,
                channel_id: channel.id(),
                sensor,
                sampling_period_ns: rate.sampling_period_ns,
                max_report_delay_ns: rate.max_report_delay_ns,
            });
        }
        out
    }

    pub fn pid_of_channel(&self, channel_id: u64) -> Option<i32> {
        self.channels.pid_of(channel_id)
    }

    // ----- app info -----

    pub fn update_app_thread_info(&self, info: AppThreadInfo) -> Result<()> {
        if info.pid < MIN_PID {
            return Err(Error::InvalidParameter(format!("invalid pid {}", info.pid)));
        }
        self.app_info.insert(info);
        Ok(())
    }

    pub fn destroy_app_thread_info(&self, pid: i32) {
        self.app_info.remove(pid);
    }

    pub fn get_app_thread_info(&self, pid: i32) -> Option<AppThreadInfo> {
        self.app_info.get(pid)
    }

    // ----- active-info observers -----

    pub fn add_active_info_pid(&self, pid: i32) -> bool {
        self.active_info_pids.lock().insert(pid)
    }

    pub fn del_active_info_pid(&self, pid: i32) -> bool {
        self.active_info_pids.lock().remove(&pid)
    }

    pub fn active_info_pids(&self) -> Vec<i32> {
        self.active_info_pids.lock().iter().copied().collect()
    }

    // ----- sample history -----

    /// Append to the sensor's bounded diagnostic ring
    pub fn update_dump_queue(&self, event: &SensorEvent) {
        if event.desc.sensor_type == sensor_type::HEART_RATE {
            return;
        }
        let mut queues = self.dump_queue.0.lock();
        let queue = queues.entry(event.desc).or_default();
        queue.push_back(event.clone());
        while queue.len() > self.dump_queue_len {
            queue.pop_front();
        }
    }

    pub fn get_dump_queue(&self, desc: &SensorDescriptor) -> Vec<SensorEvent> {
        self.dump_queue
            .0
            .lock()
            .get(desc)
            .map_or_else(Vec::new, |q| q.iter().cloned().collect())
    }

    pub fn dump_queue_sensors(&self) -> Vec<SensorDescriptor> {
        let mut out: Vec<_> = self.dump_queue.0.lock().keys().copied().collect();
        out.sort();
        out
    }

    pub fn clear_dump_queue(&self, desc: &SensorDescriptor) {
        self.dump_queue.0.lock().remove(desc);
    }

    /// Remember the latest sample of a sensor
    pub fn store_event(&self, event: &SensorEvent) {
        self.stored_events.0.lock().insert(event.desc, event.clone());
    }

    pub fn get_store_event(&self, desc: &SensorDescriptor) -> Option<SensorEvent> {
        self.stored_events.0.lock().get(desc).cloned()
    }

    /// Overwrite one value of the stored sample, if any
    pub fn update_store_event_value(&self, desc: &SensorDescriptor, index: usize, value: f32) {
        if let Some(event) = self.stored_events.0.lock().get_mut(desc) {
            event.set_value(index, value);
        }
    }

    pub fn clear_events(&self) {
        self.stored_events.0.lock().clear();
    }
}
