//! Hand-off between the driver callback thread and the delivery thread

use crate::core::driver::EventListener;
use crate::core::event::SensorEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Work item for the delivery thread
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryItem {
    Event(SensorEvent),
    /// Driver connection was re-established; per-channel counters are stale
    ResetCaches,
}

struct BufferState {
    items: VecDeque<DeliveryItem>,
    closed: bool,
}

/// Bounded circular buffer; when full the oldest item is overwritten
pub struct EventBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    capacity: usize,
    overwritten: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            overwritten: AtomicU64::new(0),
        }
    }

    /// Deposit one item and wake the delivery thread
    pub fn push(&self, item: DeliveryItem) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    /// Block until items are pending, then take all of them
    ///
    /// Returns `None` once the buffer is closed and fully drained.
    pub fn wait_drain(&self) -> Option<Vec<DeliveryItem>> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closed {
            self.ready.wait(&mut state);
        }
        if state.items.is_empty() {
            return None;
        }
        Some(state.items.drain(..).collect())
    }

    /// Stop accepting items; pending items are still handed out
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items lost to overflow since start
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl EventListener for EventBuffer {
    fn on_sample(&self, event: SensorEvent) {
        self.push(DeliveryItem::Event(event));
    }

    fn on_connection_reset(&self) {
        self.push(DeliveryItem::ResetCaches);
    }
}
