//! [`SimLink`] – deterministic stand-in for the sensor board.
//!
//! Generates a repeating 12 s motion profile so the whole stack (calibration,
//! emotions, bridge) can run in CI or on a laptop without hardware.
//!
//! | Phase | Time in cycle | Motion |
//! |---|---|---|
//! | rest | 0 – 5 s | gyro bias + jitter, 1 g on Z |
//! | nod | 5 – 7 s | ±40 deg/s pitch oscillation |
//! | spin | 7 – 9 s | 150 deg/s yaw |
//! | rest | 9 – 12 s | as above |
//!
//! Commands written to the link are recorded in a shared log.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use axon_types::{LinkError, SampleSource, SensorReading, Vec3};
use parking_lot::Mutex;
use tracing::debug;

use crate::link::SensorLink;

const CYCLE_S: f64 = 12.0;
const JITTER_DEG_S: f64 = 0.03;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Synthetic time between frames.
    pub sample_period: Duration,
    /// Sleep `sample_period` per frame to mimic a real device.
    pub realtime: bool,
    /// Constant gyro offset the calibrator is expected to find.
    pub gyro_bias: Vec3,
    pub seed: u64,
    /// Inject a link drop after this many frames of each session.
    pub disconnect_every: Option<u64>,
    /// Number of initial `open` calls that fail.
    pub failed_opens: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(20),
            realtime: true,
            gyro_bias: Vec3::new(0.9, -0.4, 0.6),
            seed: 0x5EED_A803,
            disconnect_every: None,
            failed_opens: 0,
        }
    }
}

impl SimConfig {
    /// Frames as fast as they are read, for tests.
    pub fn fast() -> Self {
        Self {
            realtime: false,
            ..Self::default()
        }
    }

    pub fn with_disconnect_every(mut self, frames: u64) -> Self {
        self.disconnect_every = Some(frames);
        self
    }

    pub fn with_failed_opens(mut self, count: u32) -> Self {
        self.failed_opens = count;
        self
    }
}

pub struct SimLink {
    config: SimConfig,
    open: bool,
    frame: u64,
    frames_this_session: u64,
    rng: u64,
    failed_opens_left: u32,
    commands: Arc<Mutex<Vec<String>>>,
}

impl SimLink {
    pub fn new(config: SimConfig) -> Self {
        Self {
            rng: config.seed.max(1),
            failed_opens_left: config.failed_opens,
            config,
            open: false,
            frame: 0,
            frames_this_session: 0,
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared log of every command written to this link.
    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.commands)
    }

    fn next_jitter(&mut self) -> f64 {
        // xorshift64
        self.rng ^= self.rng << 13;
        self.rng ^= self.rng >> 7;
        self.rng ^= self.rng << 17;
        let unit = (self.rng >> 11) as f64 / (1u64 << 53) as f64;
        (unit * 2.0 - 1.0) * JITTER_DEG_S
    }

    fn reading_at(&mut self, t: f64) -> SensorReading {
        let phase = t % CYCLE_S;
        let bias = self.config.gyro_bias;
        let mut gyro = Vec3::new(
            bias.x + self.next_jitter(),
            bias.y + self.next_jitter(),
            bias.z + self.next_jitter(),
        );
        let mut accel = Vec3::new(0.0, 0.0, 1.0);

        if (5.0..7.0).contains(&phase) {
            let u = phase - 5.0;
            gyro.x += 40.0 * (TAU * u).sin();
            // Pitch angle is the integral of the rate above, in degrees.
            let pitch_deg = 40.0 / TAU * (1.0 - (TAU * u).cos());
            let pitch = pitch_deg.to_radians();
            accel = Vec3::new(0.0, -pitch.sin(), pitch.cos());
        } else if (7.0..9.0).contains(&phase) {
            gyro.z += 150.0;
        }

        let battery_percent = (100.0 - t / 60.0).max(5.0);
        SensorReading {
            accel,
            gyro,
            battery_voltage: 11.1 + 1.5 * battery_percent / 100.0,
            battery_percent,
            link_quality: 100,
        }
    }
}

impl SensorLink for SimLink {
    fn describe(&self) -> String {
        "sim".to_string()
    }

    fn source(&self) -> SampleSource {
        SampleSource::Simulated
    }

    fn open(&mut self) -> Result<(), LinkError> {
        if self.failed_opens_left > 0 {
            self.failed_opens_left -= 1;
            return Err(LinkError::Disconnected("simulated open failure".to_string()));
        }
        self.open = true;
        self.frames_this_session = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<SensorReading, LinkError> {
        if !self.open {
            return Err(LinkError::Disconnected("simulated link closed".to_string()));
        }
        if let Some(limit) = self.config.disconnect_every {
            if self.frames_this_session >= limit {
                self.open = false;
                return Err(LinkError::Disconnected("simulated link drop".to_string()));
            }
        }
        if self.config.realtime {
            std::thread::sleep(self.config.sample_period);
        }

        let t = self.frame as f64 * self.config.sample_period.as_secs_f64();
        self.frame += 1;
        self.frames_this_session += 1;
        Ok(self.reading_at(t))
    }

    fn write_command(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.open {
            return Err(LinkError::Disconnected("simulated link closed".to_string()));
        }
        let text = String::from_utf8_lossy(bytes).trim_end().to_string();
        debug!(command = %text, "sim link received command");
        self.commands.lock().push(text);
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }
}
