//! Per-sample fan-out to subscriber channels
//!
//! For every raw sample the engine looks up the channels allowed to see the
//! sensor and, per channel:
//!
//! 1. On-change and one-shot sensors: send the sample immediately.
//! 2. Otherwise downsample by `period_count = channel period / best period`
//!    (integer division; zero means the channel gets nothing).
//! 3. With `fifo_count = channel delay / channel period <= 1` each kept
//!    sample is sent on its own; otherwise kept samples are batched until
//!    `fifo_count` have accumulated.
//!
//! A failed send parks the last sample of the batch in the channel's
//! single-slot cache. The next sample for that sensor first retries the
//! parked one, then sends itself; if that send fails it replaces the parked
//! sample.
//!
//! The engine is owned by the delivery thread, so its counters need no lock.

mod delivery;
mod event_buffer;

pub use delivery::DeliveryThread;
pub use event_buffer::{DeliveryItem, EventBuffer};

use crate::catalog::SensorCatalog;
use crate::channel::DataChannel;
use crate::core::event::SensorEvent;
use crate::core::types::SensorDescriptor;
use crate::flush::{FlushQueue, is_flush_channel_valid};
use crate::registry::SubscriptionRegistry;
use log::{debug, trace, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Downsampling counter and pending batch of one (sensor, channel) pair
struct FifoCacheEntry {
    channel: Arc<DataChannel>,
    period_count: u64,
    buffered: Vec<SensorEvent>,
}

impl FifoCacheEntry {
    fn new(channel: Arc<DataChannel>) -> Self {
        Self {
            channel,
            period_count: 0,
            buffered: Vec::new(),
        }
    }
}

/// Delivery counters, readable from any thread
#[derive(Default)]
pub struct FanoutStats {
    events: AtomicU64,
    batches_sent: AtomicU64,
    samples_sent: AtomicU64,
    send_failures: AtomicU64,
    flushes_completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutStatsSnapshot {
    pub events: u64,
    pub batches_sent: u64,
    pub samples_sent: u64,
    pub send_failures: u64,
    pub flushes_completed: u64,
}

impl FanoutStats {
    pub fn snapshot(&self) -> FanoutStatsSnapshot {
        FanoutStatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            flushes_completed: self.flushes_completed.load(Ordering::Relaxed),
        }
    }
}

pub struct FanoutEngine {
    registry: Arc<SubscriptionRegistry>,
    catalog: Arc<SensorCatalog>,
    flush_queue: Arc<FlushQueue>,
    fifo_cache: HashMap<(SensorDescriptor, u64), FifoCacheEntry>,
    seen_epoch: u64,
    stats: Arc<FanoutStats>,
}

impl FanoutEngine {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<SensorCatalog>,
        flush_queue: Arc<FlushQueue>,
    ) -> Self {
        let seen_epoch = registry.channel_epoch();
        Self {
            registry,
            catalog,
            flush_queue,
            fifo_cache: HashMap::new(),
            seen_epoch,
            stats: Arc::new(FanoutStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FanoutStats> {
        Arc::clone(&self.stats)
    }

    pub fn handle(&mut self, item: DeliveryItem) {
        match item {
            DeliveryItem::Event(event) => self.process_event(event),
            DeliveryItem::ResetCaches => self.reset(),
        }
    }

    /// Drop every downsampling counter and pending batch
    pub fn reset(&mut self) {
        debug!("Fanout: resetting {} cache entries", self.fifo_cache.len());
        self.fifo_cache.clear();
    }

    /// Number of live (sensor, channel) cache entries
    pub fn cache_len(&self) -> usize {
        self.fifo_cache.len()
    }

    pub fn process_event(&mut self, event: SensorEvent) {
        self.prune_destroyed_channels();
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        if event.is_flush_complete() {
            self.process_flush_complete(&event);
            return;
        }

        let channels = self.registry.get_channels_for(&event.desc);
        if channels.is_empty() {
            trace!("Fanout: no channel for {}", event.desc);
            return;
        }

        self.registry.update_dump_queue(&event);
        for channel in &channels {
            if channel.is_closed() {
                continue;
            }
            // Held back until the flush requested at enable time completes
            if self.flush_queue.has_first_flush(&event.desc, channel.id()) {
                continue;
            }
            self.send_events(channel, &event);
        }
        if self.catalog.contains(&event.desc) {
            self.registry.store_event(&event);
        }
    }

    fn send_events(&mut self, channel: &Arc<DataChannel>, event: &SensorEvent) {
        if channel.has_cached_event(&event.desc) {
            self.retry_cached_event(channel, event);
        } else {
            self.report_data(channel, event);
        }
    }

    fn report_data(&mut self, channel: &Arc<DataChannel>, event: &SensorEvent) {
        if self.report_not_continuous(channel, event) {
            return;
        }
        let period_count = self.registry.compute_best_period_count(&event.desc, channel);
        if period_count == 0 {
            trace!("Fanout: period count 0 for {} on channel {}", event.desc, channel.id());
            return;
        }
        let fifo_count = self.registry.compute_best_fifo_count(&event.desc, channel);
        if fifo_count <= 1 {
            self.send_no_fifo(channel, event, period_count);
        } else {
            self.send_fifo(channel, event, period_count, fifo_count);
        }
    }

    /// On-change and one-shot samples skip rate arbitration
    fn report_not_continuous(&self, channel: &DataChannel, event: &SensorEvent) -> bool {
        if !self.catalog.set_mode(&event.desc, event.mode) {
            return false;
        }
        if event.mode.is_continuous() {
            return false;
        }
        send_raw(&self.stats, channel, slice::from_ref(event));
        true
    }

    fn send_no_fifo(&mut self, channel: &Arc<DataChannel>, event: &SensorEvent, period_count: u64) {
        match self.fifo_cache.entry((event.desc, channel.id())) {
            Entry::Vacant(slot) => {
                slot.insert(FifoCacheEntry::new(Arc::clone(channel)));
                send_raw(&self.stats, channel, slice::from_ref(event));
            }
            Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                entry.period_count += 1;
                if entry.period_count % period_count != 0 {
                    return;
                }
                entry.period_count = 0;
                send_raw(&self.stats, channel, slice::from_ref(event));
            }
        }
    }

    fn send_fifo(
        &mut self,
        channel: &Arc<DataChannel>,
        event: &SensorEvent,
        period_count: u64,
        fifo_count: u64,
    ) {
        match self.fifo_cache.entry((event.desc, channel.id())) {
            Entry::Vacant(slot) => {
                slot.insert(FifoCacheEntry::new(Arc::clone(channel)));
            }
            Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                entry.period_count += 1;
                if entry.period_count % period_count != 0 {
                    return;
                }
                entry.period_count = 0;
                entry.buffered.push(event.clone());
                if (entry.buffered.len() as u64) < fifo_count {
                    return;
                }
                let batch = std::mem::take(&mut entry.buffered);
                send_raw(&self.stats, channel, &batch);
            }
        }
    }

    /// Retry the parked sample, then send the new one
    fn retry_cached_event(&self, channel: &DataChannel, event: &SensorEvent) {
        if let Some(cached) = channel.cached_event(&event.desc) {
            match channel.send_events(slice::from_ref(&cached)) {
                Ok(()) => self.count_sent(1),
                Err(e) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Fanout: retry of cached {} sample failed: {}", event.desc, e);
                }
            }
        }
        match channel.send_events(slice::from_ref(event)) {
            Ok(()) => {
                self.count_sent(1);
                channel.erase_cached_event(&event.desc);
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Fanout: send of {} sample failed, caching: {}", event.desc, e);
                channel.cache_event(event.clone());
            }
        }
    }

    fn count_sent(&self, samples: usize) {
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.samples_sent.fetch_add(samples as u64, Ordering::Relaxed);
    }

    /// Complete the oldest pending flush whose channel is still live
    fn process_flush_complete(&mut self, event: &SensorEvent) {
        let live = self.registry.get_channels_for(&event.desc);
        while let Some(request) = self.flush_queue.pop_front(&event.desc) {
            if is_flush_channel_valid(&live, &request) {
                // Enable-time flushes only release held-back samples
                if !request.first_flush {
                    send_raw(&self.stats, &request.channel, slice::from_ref(event));
                }
                self.stats.flushes_completed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            debug!(
                "Fanout: dropping stale flush for {} on channel {}",
                event.desc,
                request.channel.id()
            );
        }
    }

    /// Forget entries of channels destroyed since the last sample
    fn prune_destroyed_channels(&mut self) {
        let epoch = self.registry.channel_epoch();
        if epoch == self.seen_epoch {
            return;
        }
        self.seen_epoch = epoch;
        let before = self.fifo_cache.len();
        self.fifo_cache.retain(|_, entry| !entry.channel.is_closed());
        debug!(
            "Fanout: pruned {} cache entries of destroyed channels",
            before - self.fifo_cache.len()
        );
    }
}

/// Send a batch; on failure park its last sample in the channel cache
fn send_raw(stats: &FanoutStats, channel: &DataChannel, events: &[SensorEvent]) {
    let Some(last) = events.last() else {
        return;
    };
    match channel.send_events(events) {
        Ok(()) => {
            stats.batches_sent.fetch_add(1, Ordering::Relaxed);
            stats.samples_sent.fetch_add(events.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            stats.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Fanout: send of {} samples to pid {} failed: {}",
                events.len(),
                channel.pid(),
                e
            );
            channel.cache_event(last.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::core::types::{SensorInfo, SensorMode, SensorRate, sensor_type};
    use crate::transport::MockTransport;

    const MS: i64 = 1_000_000;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        catalog: Arc<SensorCatalog>,
        flush_queue: Arc<FlushQueue>,
        engine: FanoutEngine,
    }

    fn accel() -> SensorDescriptor {
        SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1)
    }

    fn light() -> SensorDescriptor {
        SensorDescriptor::new(1, sensor_type::AMBIENT_LIGHT, 0, 1)
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new(10));
        let catalog = Arc::new(SensorCatalog::new());
        catalog.replace_all(vec![
            SensorInfo::new(accel(), "accel"),
            SensorInfo::new(light(), "light"),
        ]);
        let flush_queue = Arc::new(FlushQueue::new());
        let engine = FanoutEngine::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&flush_queue),
        );
        Fixture {
            registry,
            catalog,
            flush_queue,
            engine,
        }
    }

    fn subscribe(
        fx: &Fixture,
        desc: SensorDescriptor,
        pid: i32,
        rate: SensorRate,
    ) -> (Arc<DataChannel>, MockTransport) {
        let mock = MockTransport::new();
        let config = TransportConfig {
            channel_send_retry_limit: 1,
            ..TransportConfig::default()
        };
        let channel = Arc::new(DataChannel::new(pid, Box::new(mock.clone()), &config));
        fx.registry.update_data_channel(pid, Arc::clone(&channel)).unwrap();
        fx.registry.update_sensor_info(desc, pid, rate).unwrap();
        (channel, mock)
    }

    fn sample(desc: SensorDescriptor, ts: i64, mode: SensorMode) -> SensorEvent {
        SensorEvent::from_values(desc, ts, mode, &[ts as f32])
    }

    fn batch_sizes(mock: &MockTransport) -> Vec<usize> {
        mock.get_messages()
            .iter()
            .map(|m| SensorEvent::decode_batch(m).unwrap().len())
            .collect()
    }

    #[test]
    fn test_single_subscriber_every_sample() {
        let mut fx = fixture();
        let (_ch, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        for ts in 0..5 {
            fx.engine.process_event(sample(accel(), ts, SensorMode::Realtime));
        }
        assert_eq!(batch_sizes(&mock), vec![1; 5]);
        assert_eq!(fx.engine.stats().snapshot().samples_sent, 5);
    }

    #[test]
    fn test_downsampling_slow_subscriber() {
        let mut fx = fixture();
        let (_fast, fast_mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        let (_slow, slow_mock) = subscribe(&fx, accel(), 2, SensorRate::new(30 * MS, 0));
        for ts in 0..10 {
            fx.engine.process_event(sample(accel(), ts, SensorMode::Realtime));
        }
        assert_eq!(fast_mock.get_messages().len(), 10);
        // First sample creates the entry and is sent; then every third
        let got: Vec<i64> = slow_mock
            .get_messages()
            .iter()
            .map(|m| SensorEvent::decode_batch(m).unwrap()[0].timestamp_ns)
            .collect();
        assert_eq!(got, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_fifo_batches() {
        let mut fx = fixture();
        // period 10ms, delay 40ms -> batches of 4
        let (_ch, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 40 * MS));
        for ts in 0..13 {
            fx.engine.process_event(sample(accel(), ts, SensorMode::Realtime));
        }
        // First sample only creates the entry; 12 buffered -> 3 batches
        assert_eq!(batch_sizes(&mock), vec![4, 4, 4]);
        let first = SensorEvent::decode_batch(&mock.get_messages()[0]).unwrap();
        assert_eq!(first[0].timestamp_ns, 1);
    }

    #[test]
    fn test_fifo_with_downsampling() {
        let mut fx = fixture();
        let (_fast, _) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        // period 20ms (count 2), delay 60ms (fifo 3)
        let (_slow, mock) = subscribe(&fx, accel(), 2, SensorRate::new(20 * MS, 60 * MS));
        for ts in 0..13 {
            fx.engine.process_event(sample(accel(), ts, SensorMode::Realtime));
        }
        let messages = mock.get_messages();
        assert_eq!(messages.len(), 2);
        let ts: Vec<i64> = SensorEvent::decode_batch(&messages[0])
            .unwrap()
            .iter()
            .map(|e| e.timestamp_ns)
            .collect();
        assert_eq!(ts, vec![2, 4, 6]);
    }

    #[test]
    fn test_zero_best_period_drops() {
        let mut fx = fixture();
        let (_a, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        let (_b, _) = subscribe(&fx, accel(), 2, SensorRate::new(0, 0));
        fx.engine.process_event(sample(accel(), 0, SensorMode::Realtime));
        assert!(mock.get_messages().is_empty());
        assert_eq!(fx.engine.cache_len(), 0);
    }

    #[test]
    fn test_on_change_bypasses_batching() {
        let mut fx = fixture();
        let (_ch, mock) = subscribe(&fx, light(), 1, SensorRate::new(10 * MS, 100 * MS));
        for ts in 0..3 {
            fx.engine.process_event(sample(light(), ts, SensorMode::OnChange));
        }
        assert_eq!(batch_sizes(&mock), vec![1, 1, 1]);
        assert_eq!(fx.catalog.mode(&light()), Some(SensorMode::OnChange));
        assert_eq!(fx.registry.get_store_event(&light()).unwrap().timestamp_ns, 2);
    }

    #[test]
    fn test_failed_send_cached_then_retried_once() {
        let mut fx = fixture();
        let (ch, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));

        mock.block_writes(1);
        fx.engine.process_event(sample(accel(), 1, SensorMode::Realtime));
        assert_eq!(ch.cached_event(&accel()).unwrap().timestamp_ns, 1);

        fx.engine.process_event(sample(accel(), 2, SensorMode::Realtime));
        let got: Vec<i64> = mock
            .get_messages()
            .iter()
            .map(|m| SensorEvent::decode_batch(m).unwrap()[0].timestamp_ns)
            .collect();
        assert_eq!(got, vec![1, 2]);
        assert!(!ch.has_cached_event(&accel()));
    }

    #[test]
    fn test_cached_sample_replaced_not_appended() {
        let mut fx = fixture();
        let (ch, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));

        mock.set_broken(true);
        fx.engine.process_event(sample(accel(), 1, SensorMode::Realtime));
        fx.engine.process_event(sample(accel(), 2, SensorMode::Realtime));
        fx.engine.process_event(sample(accel(), 3, SensorMode::Realtime));
        assert_eq!(ch.cached_event(&accel()).unwrap().timestamp_ns, 3);

        mock.set_broken(false);
        fx.engine.process_event(sample(accel(), 4, SensorMode::Realtime));
        let got: Vec<i64> = mock
            .get_messages()
            .iter()
            .map(|m| SensorEvent::decode_batch(m).unwrap()[0].timestamp_ns)
            .collect();
        assert_eq!(got, vec![3, 4]);
    }

    #[test]
    fn test_permission_revoked_channel_skipped() {
        let mut fx = fixture();
        let (_ch, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        fx.registry.set_permission_state(1, sensor_type::ACCELEROMETER, false);
        fx.engine.process_event(sample(accel(), 1, SensorMode::Realtime));
        assert!(mock.get_messages().is_empty());
    }

    #[test]
    fn test_flush_complete_goes_to_head() {
        let mut fx = fixture();
        let (a, a_mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        let (b, b_mock) = subscribe(&fx, accel(), 2, SensorRate::new(10 * MS, 0));
        fx.flush_queue.request_flush(accel(), Arc::clone(&a), false);
        fx.flush_queue.request_flush(accel(), Arc::clone(&b), false);

        fx.engine.process_event(SensorEvent::flush_complete(accel(), 5));
        assert_eq!(a_mock.get_messages().len(), 1);
        assert!(b_mock.get_messages().is_empty());
        assert_eq!(fx.flush_queue.pending_count(&accel()), 1);

        fx.engine.process_event(SensorEvent::flush_complete(accel(), 6));
        let decoded = SensorEvent::decode_batch(&b_mock.get_messages()[0]).unwrap();
        assert!(decoded[0].is_flush_complete());
        assert_eq!(fx.engine.stats().snapshot().flushes_completed, 2);
    }

    #[test]
    fn test_stale_flush_popped_without_delivery() {
        let mut fx = fixture();
        let (a, a_mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        let (b, b_mock) = subscribe(&fx, accel(), 2, SensorRate::new(10 * MS, 0));
        fx.flush_queue.request_flush(accel(), Arc::clone(&a), false);
        fx.flush_queue.request_flush(accel(), Arc::clone(&b), false);
        fx.registry.destroy_data_channel(1);

        fx.engine.process_event(SensorEvent::flush_complete(accel(), 5));
        assert!(a_mock.get_messages().is_empty());
        assert_eq!(b_mock.get_messages().len(), 1);
        assert_eq!(fx.flush_queue.pending_count(&accel()), 0);
    }

    #[test]
    fn test_first_flush_holds_back_samples() {
        let mut fx = fixture();
        let (a, mock) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        fx.flush_queue.request_flush(accel(), Arc::clone(&a), true);
        fx.engine.process_event(sample(accel(), 1, SensorMode::Realtime));
        assert!(mock.get_messages().is_empty());

        fx.engine.process_event(SensorEvent::flush_complete(accel(), 2));
        assert!(mock.get_messages().is_empty());
        fx.engine.process_event(sample(accel(), 3, SensorMode::Realtime));
        let got = SensorEvent::decode_batch(&mock.get_messages()[0]).unwrap();
        assert_eq!(got[0].timestamp_ns, 3);
        assert_eq!(mock.get_messages().len(), 1);
    }

    #[test]
    fn test_destroyed_channel_entries_pruned() {
        let mut fx = fixture();
        let (_a, _) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        let (_b, _) = subscribe(&fx, accel(), 2, SensorRate::new(10 * MS, 0));
        fx.engine.process_event(sample(accel(), 0, SensorMode::Realtime));
        assert_eq!(fx.engine.cache_len(), 2);

        fx.registry.destroy_data_channel(2);
        fx.engine.process_event(sample(accel(), 1, SensorMode::Realtime));
        assert_eq!(fx.engine.cache_len(), 1);

        fx.engine.handle(DeliveryItem::ResetCaches);
        assert_eq!(fx.engine.cache_len(), 0);
    }

    #[test]
    fn test_dump_queue_records_delivered_samples() {
        let mut fx = fixture();
        let (_a, _) = subscribe(&fx, accel(), 1, SensorRate::new(10 * MS, 0));
        for ts in 0..12 {
            fx.engine.process_event(sample(accel(), ts, SensorMode::Realtime));
        }
        let dump = fx.registry.get_dump_queue(&accel());
        assert_eq!(dump.len(), 10);
        assert_eq!(dump[9].timestamp_ns, 11);
    }
}
