//! Simulated sensor readings.

use rand::Rng;
use telemetry_types::Reading;

/// Produces one reading per tick.
pub trait ReadingSource: Send {
    fn next_reading(&mut self) -> Reading;
}

/// Uniformly random temperature/humidity stamped with wall-clock time.
pub struct SimulatedSensor {
    device_id: String,
}

impl SimulatedSensor {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

impl ReadingSource for SimulatedSensor {
    fn next_reading(&mut self) -> Reading {
        let mut rng = rand::thread_rng();
        Reading {
            temperature: round2(rng.gen_range(20.0..=40.0)),
            humidity: round2(rng.gen_range(20.0..=60.0)),
            timestamp: now_unix_secs(),
            device_id: self.device_id.clone(),
        }
    }
}

pub fn now_unix_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
