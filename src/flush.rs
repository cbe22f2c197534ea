//! Pending flush requests, completed strictly in arrival order

use crate::channel::DataChannel;
use crate::core::types::SensorDescriptor;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One outstanding flush
#[derive(Clone)]
pub struct FlushRequest {
    pub channel: Arc<DataChannel>,
    pub first_flush: bool,
}

#[derive(Default)]
pub struct FlushQueue {
    pending: Mutex<HashMap<SensorDescriptor, VecDeque<FlushRequest>>>,
}

impl FlushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request behind any already pending for `desc`
    pub fn request_flush(&self, desc: SensorDescriptor, channel: Arc<DataChannel>, first_flush: bool) {
        self.pending
            .lock()
            .entry(desc)
            .or_default()
            .push_back(FlushRequest { channel, first_flush });
    }

    /// Pop the oldest request for `desc`
    pub fn pop_front(&self, desc: &SensorDescriptor) -> Option<FlushRequest> {
        let mut pending = self.pending.lock();
        let queue = pending.get_mut(desc)?;
        let head = queue.pop_front();
        if queue.is_empty() {
            pending.remove(desc);
        }
        head
    }

    /// True if `channel_id` is waiting on a flush it asked for when enabling
    pub fn has_first_flush(&self, desc: &SensorDescriptor, channel_id: u64) -> bool {
        self.pending.lock().get(desc).is_some_and(|queue| {
            queue
                .iter()
                .any(|req| req.first_flush && req.channel.id() == channel_id)
        })
    }

    /// Withdraw the newest request `channel_id` queued for `desc`
    pub fn cancel_last(&self, desc: &SensorDescriptor, channel_id: u64) -> bool {
        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(desc) else {
            return false;
        };
        let Some(pos) = queue.iter().rposition(|req| req.channel.id() == channel_id) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            pending.remove(desc);
        }
        true
    }

    pub fn pending_count(&self, desc: &SensorDescriptor) -> usize {
        self.pending.lock().get(desc).map_or(0, VecDeque::len)
    }

    /// Drop every request targeting a channel
    pub fn remove_channel(&self, channel_id: u64) {
        let mut pending = self.pending.lock();
        for queue in pending.values_mut() {
            queue.retain(|req| req.channel.id() != channel_id);
        }
        pending.retain(|_, queue| !queue.is_empty());
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// True if the request's channel is still among the live channels
pub fn is_flush_channel_valid(live: &[Arc<DataChannel>], request: &FlushRequest) -> bool {
    !request.channel.is_closed() && live.iter().any(|ch| ch.id() == request.channel.id())
}
