//! Sample generator for the simulated driver
//!
//! Walks the driver's enabled sensors every tick and injects a sample for
//! each one whose sampling period has elapsed. Continuous sensors always
//! emit; on-change sensors emit only when their simulated value moves.

use super::{MockSensorDriver, SensorNoise};
use crate::config::MockConfig;
use crate::core::event::SensorEvent;
use crate::core::types::{SensorDescriptor, SensorInfo, sensor_type};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const GRAVITY: f32 = 9.80665;

/// Floor applied to requested periods so a zero-period subscriber can't spin the loop
const MIN_EMIT_PERIOD: Duration = Duration::from_millis(1);

/// Per-sensor simulation state
#[derive(Default)]
struct Track {
    last_emit: Option<Instant>,
    last_values: Vec<f32>,
    steps: f32,
    near: bool,
}

pub struct SensorSimulator {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SensorSimulator {
    pub fn spawn(driver: MockSensorDriver, config: &MockConfig) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let tick = Duration::from_millis(config.tick_ms.max(1));
        let noise = SensorNoise::new(config.random_seed, config.noise_stddev);
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("mock-sensors".to_string())
            .spawn(move || simulation_loop(driver, flag, tick, noise))
            .map_err(|e| Error::Other(format!("Failed to spawn simulation thread: {}", e)))?;

        log::info!("Sensor simulator started: tick={:?}", tick);
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for SensorSimulator {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn simulation_loop(
    driver: MockSensorDriver,
    shutdown: Arc<AtomicBool>,
    tick: Duration,
    mut noise: SensorNoise,
) {
    let start = Instant::now();
    let mut tracks: HashMap<SensorDescriptor, Track> = HashMap::new();

    while !shutdown.load(Ordering::Relaxed) {
        let loop_start = Instant::now();
        let active = driver.active_sensors();
        tracks.retain(|desc, _| active.iter().any(|(info, _)| info.desc == *desc));

        for (info, rate) in &active {
            let period = Duration::from_nanos(rate.sampling_period_ns.max(0) as u64)
                .max(MIN_EMIT_PERIOD);
            let track = tracks.entry(info.desc).or_default();
            if track
                .last_emit
                .is_some_and(|t| loop_start.duration_since(t) < period)
            {
                continue;
            }
            let first = track.last_emit.is_none();
            track.last_emit = Some(loop_start);

            let elapsed = loop_start.duration_since(start).as_secs_f32();
            let values = sample_values(info, track, elapsed, &mut noise);
            if !info.mode.is_continuous() && !first && values == track.last_values {
                continue;
            }
            track.last_values = values.clone();

            let ts = loop_start.duration_since(start).as_nanos() as i64;
            let event = SensorEvent::from_values(info.desc, ts, info.mode, &values);
            driver.inject_event(event);
        }

        let elapsed = loop_start.elapsed();
        if elapsed < tick {
            thread::sleep(tick - elapsed);
        }
    }

    log::info!("Sensor simulator terminated");
}

fn sample_values(
    info: &SensorInfo,
    track: &mut Track,
    elapsed: f32,
    noise: &mut SensorNoise,
) -> Vec<f32> {
    match info.desc.sensor_type {
        sensor_type::ACCELEROMETER => {
            let mut v = vec![0.0, 0.0, GRAVITY];
            noise.jitter(&mut v, 1.0);
            v
        }
        sensor_type::GYROSCOPE => {
            let mut v = vec![0.0, 0.0, 0.0];
            noise.jitter(&mut v, 1.0);
            v
        }
        sensor_type::MAGNETIC_FIELD => {
            let mut v = vec![22.0, 5.0, -40.0];
            noise.jitter(&mut v, 10.0);
            v
        }
        // Slow day/night swing, quantized so on-change reporting stays quiet
        sensor_type::AMBIENT_LIGHT => {
            let lux = 300.0 + 200.0 * (elapsed / 20.0).sin();
            vec![(lux / 25.0).round() * 25.0]
        }
        sensor_type::PROXIMITY | sensor_type::PROXIMITY1 => {
            if noise.occurs(0.01) {
                track.near = !track.near;
            }
            vec![if track.near { 0.0 } else { 5.0 }]
        }
        sensor_type::PEDOMETER => {
            if noise.occurs(0.05) {
                track.steps += 1.0;
            }
            vec![track.steps]
        }
        _ => vec![0.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::driver::{EventListener, SensorDriver};
    use crate::core::types::{SensorMode, SensorRate};
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<SensorEvent>>);

    impl EventListener for Collect {
        fn on_sample(&self, event: SensorEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_emits_for_enabled_sensors_only() {
        let accel = SensorDescriptor::new(1, sensor_type::ACCELEROMETER, 0, 1);
        let gyro = SensorDescriptor::new(1, sensor_type::GYROSCOPE, 0, 1);
        let mut info = SensorInfo::new(accel, "accel");
        info.mode = SensorMode::Realtime;
        let mut driver = MockSensorDriver::new(vec![info, SensorInfo::new(gyro, "gyro")]);
        driver.connect().unwrap();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        driver.register_event_callback(sink.clone()).unwrap();
        let rate = SensorRate::new(2_000_000, 0);
        driver.set_batch(&accel, rate.sampling_period_ns, 0).unwrap();
        driver.enable(&accel).unwrap();

        let config = MockConfig {
            tick_ms: 1,
            random_seed: 3,
            ..MockConfig::default()
        };
        let mut sim = SensorSimulator::spawn(driver.clone(), &config).unwrap();
        thread::sleep(Duration::from_millis(50));
        sim.shutdown().unwrap();

        let events = sink.0.lock();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.desc == accel));
        let z = events[0].values()[2];
        assert!((z - GRAVITY).abs() < 0.5);
    }

    #[test]
    fn test_on_change_suppresses_repeats() {
        let mut noise = SensorNoise::new(1, 0.0);
        let info = SensorInfo::new(
            SensorDescriptor::new(1, sensor_type::AMBIENT_LIGHT, 0, 1),
            "light",
        );
        let mut track = Track::default();
        let a = sample_values(&info, &mut track, 0.0, &mut noise);
        let b = sample_values(&info, &mut track, 0.01, &mut noise);
        assert_eq!(a, b);
    }
}
