//! Application orchestration for the Indriya daemon
//!
//! Builds the hub against the configured driver, runs the simulator when the
//! driver is simulated, and waits for SIGINT/SIGTERM before shutting down.

use crate::config::HubConfig;
use crate::devices::create_driver;
use crate::devices::mock::SensorSimulator;
use crate::error::Result;
use crate::hub::SensorHub;
use log::{debug, error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Main application structure that manages all components
pub struct HubApp {
    hub: SensorHub,
    simulator: Option<SensorSimulator>,
    stats_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl HubApp {
    pub fn new(config: HubConfig) -> Result<Self> {
        info!("Initializing Indriya sensor hub");

        let created = create_driver(&config)?;
        let stats_interval = Duration::from_secs(config.logging.stats_interval_secs);
        let mock = config.mock.clone();
        let hub = SensorHub::with_driver(config, created.driver)?;

        // Samples only flow once the hub has registered its callback
        let simulator = match created.simulated {
            Some(driver) => Some(SensorSimulator::spawn(driver, &mock)?),
            None => None,
        };

        for sensor in hub.get_sensor_list() {
            info!("  {} {} ({:?})", sensor.desc, sensor.name, sensor.mode);
        }

        Ok(Self {
            hub,
            simulator,
            stats_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn hub(&self) -> &SensorHub {
        &self.hub
    }

    /// Flag that stops [`HubApp::run`] when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until a shutdown signal arrives
    pub fn run(&mut self) -> Result<()> {
        self.setup_signal_handler()?;
        info!("Indriya running. Press Ctrl-C to stop.");

        let mut last_stats = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));

            if !self.stats_interval.is_zero() && last_stats.elapsed() >= self.stats_interval {
                self.log_statistics();
                last_stats = Instant::now();
            }
        }

        info!("Shutdown signal received, stopping...");
        self.stop()
    }

    fn setup_signal_handler(&self) -> Result<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let mut signals = Signals::new([SIGINT, SIGTERM])?;

        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!("Received signal {:?}, initiating shutdown...", sig);
                    shutdown.store(true, Ordering::Relaxed);
                }
            })?;
        Ok(())
    }

    fn log_statistics(&self) {
        let stats = self.hub.stats();
        info!(
            "Stats: events={} batches={} samples={} failures={} flushes={} overwritten={}",
            stats.delivery.events,
            stats.delivery.batches_sent,
            stats.delivery.samples_sent,
            stats.delivery.send_failures,
            stats.delivery.flushes_completed,
            stats.buffer_overwritten
        );
        info!(
            "Clients: channels={} subscriptions={} sessions={} suspended={}",
            stats.channels, stats.subscriptions, stats.sessions, stats.suspended
        );
    }

    /// Stop the simulator, then drain the hub
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(mut simulator) = self.simulator.take() {
            simulator.shutdown()?;
        }
        self.hub.shutdown()?;
        info!("✓ Indriya stopped");
        Ok(())
    }
}

impl Drop for HubApp {
    fn drop(&mut self) {
        debug!("HubApp cleaning up...");
        if let Err(e) = self.stop() {
            error!("Error during cleanup: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{SensorDescriptor, sensor_type};

    #[test]
    fn test_app_delivers_simulated_samples() {
        let mut config = HubConfig::default();
        config.driver.retry_interval_ms = 1;
        config.mock.tick_ms = 1;
        config.mock.random_seed = 7;
        let mut app = HubApp::new(config).unwrap();

        let accel = SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1);
        let mut client = app.hub().create_data_channel(100, 1000, 1).unwrap();
        app.hub().enable_sensor(accel, 100, 5_000_000, 0).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = 0;
        while received == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
            received += client.recv_all().unwrap().len();
        }
        assert!(received > 0);

        app.stop().unwrap();
        assert!(app.shutdown_flag().load(Ordering::Relaxed));
    }
}
