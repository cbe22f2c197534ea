//! Dedicated delivery thread

use super::{EventBuffer, FanoutEngine, FanoutStats};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Runs the fan-out engine until its buffer is closed and drained
pub struct DeliveryThread {
    buffer: Arc<EventBuffer>,
    stats: Arc<FanoutStats>,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryThread {
    pub fn spawn(mut engine: FanoutEngine, buffer: Arc<EventBuffer>) -> Result<Self> {
        let stats = engine.stats();
        let thread_buffer = Arc::clone(&buffer);
        let handle = thread::Builder::new()
            .name("sensor-delivery".to_string())
            .spawn(move || {
                log::info!("Delivery thread started");
                while let Some(items) = thread_buffer.wait_drain() {
                    for item in items {
                        engine.handle(item);
                    }
                }
                log::info!("Delivery thread exiting");
            })?;

        Ok(Self {
            buffer,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> Arc<FanoutStats> {
        Arc::clone(&self.stats)
    }

    /// Close the buffer and wait for remaining items to be delivered
    pub fn shutdown(&mut self) -> Result<()> {
        self.buffer.close();
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
