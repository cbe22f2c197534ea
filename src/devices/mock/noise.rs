//! Seeded measurement noise for simulated sensors

use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Bernoulli, Distribution, Normal, StandardNormal};

/// Per-simulator noise source
///
/// Seed 0 draws from OS entropy; any other seed replays the same stream.
pub struct SensorNoise {
    rng: SmallRng,
    stddev: f32,
}

impl SensorNoise {
    pub fn new(seed: u64, stddev: f32) -> Self {
        let rng = if seed == 0 {
            SmallRng::from_entropy()
        } else {
            SmallRng::seed_from_u64(seed)
        };
        Self {
            rng,
            stddev: stddev.max(0.0),
        }
    }

    /// Add independent white noise to every axis, scaled from the base stddev
    pub fn jitter(&mut self, axes: &mut [f32], scale: f32) {
        let sigma = self.stddev * scale;
        if sigma == 0.0 {
            return;
        }
        match Normal::new(0.0f32, sigma) {
            Ok(dist) => axes.iter_mut().for_each(|v| *v += dist.sample(&mut self.rng)),
            Err(_) => {
                for v in axes.iter_mut() {
                    let n: f32 = self.rng.sample(StandardNormal);
                    *v += n * sigma;
                }
            }
        }
    }

    /// Discrete event (step, proximity flip) firing with `probability` per tick
    pub fn occurs(&mut self, probability: f64) -> bool {
        Bernoulli::new(probability.clamp(0.0, 1.0))
            .map(|b| b.sample(&mut self.rng))
            .unwrap_or(false)
    }
}
