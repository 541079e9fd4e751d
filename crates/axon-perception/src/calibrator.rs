//! Stability-triggered gyro bias removal.
//!
//! The calibrator keeps a sliding window of the most recent samples spanning
//! [`CalibratorConfig::window`].  The window is *stable* when
//!
//! - it spans at least `full_window_fraction` of the configured duration,
//! - every gyro axis has a population variance below `variance_threshold`,
//! - every sample's accelerometer magnitude lies within `1 g ± accel_tolerance_g`.
//!
//! The first stable window sets the offsets to the window's mean gyro
//! reading.  While calibrated, a later stable window whose mean is more than
//! `drift_tolerance` away from the stored offsets on any axis replaces them.
//!
//! A sample that leaves the accelerometer band, a heartbeat, or a timestamp
//! that goes backwards clears the window.
//!
//! `max_window_samples` bounds memory, not duration: when a fast link fills
//! the buffer, every other sample is discarded and only every `stride`-th
//! sample is collected from then on.

use std::collections::VecDeque;
use std::time::Duration;

use axon_types::{CalibratedSample, CalibrationStatus, SensorSample, Vec3};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CalibratorConfig {
    pub window: Duration,
    pub full_window_fraction: f64,
    /// Per-axis variance bound, (deg/s)².
    pub variance_threshold: f64,
    /// Allowed deviation of |accel| from 1 g.
    pub accel_tolerance_g: f64,
    /// Buffer bound; the window is thinned out rather than shortened.
    pub max_window_samples: usize,
    /// deg/s.
    pub drift_tolerance: f64,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            full_window_fraction: 0.95,
            variance_threshold: 0.02,
            accel_tolerance_g: 0.1,
            max_window_samples: 2048,
            drift_tolerance: 0.2,
        }
    }
}

#[derive(Debug)]
pub struct GyroCalibrator {
    config: CalibratorConfig,
    window: VecDeque<(u64, Vec3)>,
    offsets: Option<Vec3>,
    last_timestamp_us: Option<u64>,
    /// Collect one sample out of every `stride`.
    stride: usize,
    skipped: usize,
}

impl GyroCalibrator {
    pub fn new(config: CalibratorConfig) -> Self {
        let capacity = config.max_window_samples.min(512);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            offsets: None,
            last_timestamp_us: None,
            stride: 1,
            skipped: 0,
        }
    }

    pub fn state(&self) -> CalibrationStatus {
        if self.offsets.is_some() {
            CalibrationStatus::Calibrated
        } else {
            CalibrationStatus::Uncalibrated
        }
    }

    pub fn offsets(&self) -> Option<Vec3> {
        self.offsets
    }

    /// Forget the offsets and start collecting a fresh window.
    pub fn reset(&mut self) {
        self.offsets = None;
        self.window.clear();
        self.last_timestamp_us = None;
        self.stride = 1;
        self.skipped = 0;
        info!("gyro calibration reset; collecting a new rest window");
    }

    /// Seconds of continuous rest still needed before the window counts as
    /// full, measured at `now_us`.
    pub fn seconds_to_window_completion(&self, now_us: u64) -> f64 {
        let required = self.config.window.as_secs_f64() * self.config.full_window_fraction;
        match self.window.front() {
            Some(&(start, _)) => {
                let elapsed = now_us.saturating_sub(start) as f64 / 1e6;
                (required - elapsed).max(0.0)
            }
            None => required,
        }
    }

    /// Feed one sample and return it with the current offsets removed.
    pub fn observe(&mut self, sample: &SensorSample) -> CalibratedSample {
        let timestamp = sample.timestamp_us();

        if sample.is_heartbeat() {
            self.window.clear();
            self.last_timestamp_us = None;
        } else {
            if self.last_timestamp_us.is_some_and(|last| timestamp <= last) {
                debug!(timestamp_us = timestamp, "non-increasing timestamp; calibration window cleared");
                self.window.clear();
            }
            self.last_timestamp_us = Some(timestamp);
            self.collect(timestamp, sample);
        }

        let gyro = match self.offsets {
            Some(offsets) if !sample.is_heartbeat() => sample.gyro().sub(&offsets),
            _ => sample.gyro(),
        };
        CalibratedSample {
            raw: sample.clone(),
            gyro,
            status: self.state(),
        }
    }

    fn collect(&mut self, timestamp: u64, sample: &SensorSample) {
        let accel_error = (sample.accel().magnitude() - 1.0).abs();
        if accel_error > self.config.accel_tolerance_g {
            self.window.clear();
            return;
        }

        self.skipped += 1;
        if self.skipped < self.stride {
            return;
        }
        self.skipped = 0;

        self.window.push_back((timestamp, sample.gyro()));
        let window_us = u64::try_from(self.config.window.as_micros()).unwrap_or(u64::MAX);
        while let Some(&(start, _)) = self.window.front() {
            if timestamp.saturating_sub(start) > window_us {
                self.window.pop_front();
            } else {
                break;
            }
        }
        if self.window.len() > self.config.max_window_samples.max(2) {
            self.thin_window();
        }

        if let Some(mean) = self.stable_mean(timestamp) {
            match self.offsets {
                None => {
                    info!(x = mean.x, y = mean.y, z = mean.z, "gyro calibrated");
                    self.offsets = Some(mean);
                }
                Some(current) if current.max_abs_diff(&mean) > self.config.drift_tolerance => {
                    info!(x = mean.x, y = mean.y, z = mean.z, "gyro offsets updated after drift");
                    self.offsets = Some(mean);
                }
                Some(_) => {}
            }
        }
    }

    /// Drop every other sample, keeping the oldest so the span is unchanged.
    fn thin_window(&mut self) {
        let mut index = 0usize;
        self.window.retain(|_| {
            let keep = index % 2 == 0;
            index += 1;
            keep
        });
        self.stride = self.stride.saturating_mul(2);
        debug!(stride = self.stride, kept = self.window.len(), "calibration window thinned");
    }

    /// Mean gyro of the window, when the window is full and quiet.
    fn stable_mean(&self, now_us: u64) -> Option<Vec3> {
        let (start, _) = *self.window.front()?;
        let span_s = now_us.saturating_sub(start) as f64 / 1e6;
        let required = self.config.window.as_secs_f64() * self.config.full_window_fraction;
        if span_s < required {
            return None;
        }

        let n = self.window.len() as f64;
        let sum = self.window.iter().fold(Vec3::ZERO, |acc, (_, g)| {
            Vec3::new(acc.x + g.x, acc.y + g.y, acc.z + g.z)
        });
        let mean = Vec3::new(sum.x / n, sum.y / n, sum.z / n);
        let var = self.window.iter().fold(Vec3::ZERO, |acc, (_, g)| {
            let d = g.sub(&mean);
            Vec3::new(acc.x + d.x * d.x, acc.y + d.y * d.y, acc.z + d.z * d.z)
        });
        let threshold = self.config.variance_threshold;
        let quiet = var.x / n < threshold && var.y / n < threshold && var.z / n < threshold;
        quiet.then_some(mean)
    }
}

impl Default for GyroCalibrator {
    fn default() -> Self {
        Self::new(CalibratorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use axon_types::{SampleSource, SensorReading};

    use super::*;

    const PERIOD_US: u64 = 20_000;

    fn sample(timestamp_us: u64, accel: Vec3, gyro: Vec3) -> SensorSample {
        SensorSample::new(
            timestamp_us,
            SampleSource::Simulated,
            SensorReading {
                accel,
                gyro,
                battery_voltage: 12.0,
                battery_percent: 90.0,
                link_quality: 100,
            },
        )
    }

    fn level() -> Vec3 {
        Vec3::new(0.0, 0.0, 1.0)
    }

    /// Feed `seconds` of 50 Hz samples with `gyro ± noise` (alternating sign)
    /// starting at `start_us`; returns the last output and the next timestamp.
    fn feed_rest(
        calibrator: &mut GyroCalibrator,
        start_us: u64,
        seconds: f64,
        gyro: Vec3,
        noise: f64,
    ) -> (CalibratedSample, u64) {
        let count = (seconds * 1e6 / PERIOD_US as f64) as u64;
        let mut last = None;
        let mut ts = start_us;
        for i in 0..count {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            let g = Vec3::new(gyro.x + sign * noise, gyro.y - sign * noise, gyro.z + sign * noise);
            last = Some(calibrator.observe(&sample(ts, level(), g)));
            ts += PERIOD_US;
        }
        (last.unwrap(), ts)
    }

    #[test]
    fn rest_window_calibrates_to_bias() {
        let mut calibrator = GyroCalibrator::default();
        let bias = Vec3::new(0.9, 0.9, 0.9);
        let (out, _) = feed_rest(&mut calibrator, 0, 3.5, bias, 0.05);

        assert_eq!(out.status, CalibrationStatus::Calibrated);
        let offsets = calibrator.offsets().unwrap();
        assert!(offsets.max_abs_diff(&bias) < 0.05, "offsets {offsets:?}");
    }

    #[test]
    fn not_calibrated_before_window_fills() {
        let mut calibrator = GyroCalibrator::default();
        let (out, next) = feed_rest(&mut calibrator, 0, 2.0, Vec3::new(0.9, 0.9, 0.9), 0.01);
        assert_eq!(out.status, CalibrationStatus::Uncalibrated);
        let remaining = calibrator.seconds_to_window_completion(next);
        assert!(remaining > 0.5 && remaining < 1.0, "remaining {remaining}");
    }

    #[test]
    fn held_still_output_converges_to_zero() {
        let mut calibrator = GyroCalibrator::default();
        let bias = Vec3::new(0.9, -0.4, 0.6);
        let (_, next) = feed_rest(&mut calibrator, 0, 3.5, bias, 0.02);
        let (out, _) = feed_rest(&mut calibrator, next, 1.0, bias, 0.02);
        assert!(out.gyro.max_abs_diff(&Vec3::ZERO) <= 0.05, "gyro {:?}", out.gyro);
    }

    #[test]
    fn reset_rederives_offsets_from_new_window() {
        let mut calibrator = GyroCalibrator::default();
        let (_, next) = feed_rest(&mut calibrator, 0, 3.5, Vec3::new(0.9, 0.9, 0.9), 0.01);
        assert!(calibrator.offsets().is_some());

        calibrator.reset();
        assert_eq!(calibrator.state(), CalibrationStatus::Uncalibrated);
        assert!(calibrator.offsets().is_none());

        let new_bias = Vec3::new(-0.3, 0.1, 0.5);
        feed_rest(&mut calibrator, next, 3.5, new_bias, 0.01);
        let offsets = calibrator.offsets().unwrap();
        assert!(offsets.max_abs_diff(&new_bias) < 0.02, "offsets {offsets:?}");
    }

    #[test]
    fn motion_never_calibrates() {
        let mut calibrator = GyroCalibrator::default();
        let mut ts = 0;
        for i in 0..300u64 {
            let swing = if i % 10 < 5 { 20.0 } else { -20.0 };
            let out = calibrator.observe(&sample(ts, level(), Vec3::new(swing, 0.0, 0.0)));
            assert_eq!(out.status, CalibrationStatus::Uncalibrated);
            assert_eq!(out.gyro, out.raw.gyro());
            ts += PERIOD_US;
        }
    }

    #[test]
    fn tilted_or_shaken_device_never_calibrates() {
        let mut calibrator = GyroCalibrator::default();
        let mut ts = 0;
        for _ in 0..300 {
            let out = calibrator.observe(&sample(ts, Vec3::new(0.0, 0.0, 1.3), Vec3::ZERO));
            assert_eq!(out.status, CalibrationStatus::Uncalibrated);
            ts += PERIOD_US;
        }
    }

    #[test]
    fn heartbeat_breaks_the_window() {
        let mut calibrator = GyroCalibrator::default();
        let (_, next) = feed_rest(&mut calibrator, 0, 2.0, Vec3::new(0.5, 0.5, 0.5), 0.01);
        calibrator.observe(&SensorSample::heartbeat(next, SampleSource::Simulated));
        let (out, _) = feed_rest(&mut calibrator, next + PERIOD_US, 2.0, Vec3::new(0.5, 0.5, 0.5), 0.01);
        assert_eq!(out.status, CalibrationStatus::Uncalibrated);
    }

    #[test]
    fn drift_replaces_offsets() {
        let mut calibrator = GyroCalibrator::default();
        let (_, next) = feed_rest(&mut calibrator, 0, 3.5, Vec3::new(0.9, 0.9, 0.9), 0.01);
        feed_rest(&mut calibrator, next, 3.5, Vec3::new(1.5, 0.9, 0.9), 0.01);
        let offsets = calibrator.offsets().unwrap();
        assert!((offsets.x - 1.5).abs() < 0.05, "offsets {offsets:?}");

        // Small wander inside the tolerance keeps the stored offsets.
        let mut calibrator = GyroCalibrator::default();
        let (_, next) = feed_rest(&mut calibrator, 0, 3.5, Vec3::new(0.9, 0.9, 0.9), 0.01);
        let before = calibrator.offsets().unwrap();
        feed_rest(&mut calibrator, next, 3.5, Vec3::new(1.0, 0.9, 0.9), 0.01);
        assert_eq!(calibrator.offsets().unwrap(), before);
    }

    #[test]
    fn fast_link_still_calibrates_within_the_sample_bound() {
        let mut calibrator = GyroCalibrator::default();
        let bias = Vec3::new(0.9, 0.9, 0.9);
        let mut last = None;
        for i in 0..10_000u64 {
            last = Some(calibrator.observe(&sample(i * 1_000, level(), bias)));
            assert!(calibrator.window.len() <= calibrator.config.max_window_samples);
        }

        assert_eq!(last.unwrap().status, CalibrationStatus::Calibrated);
        let offsets = calibrator.offsets().unwrap();
        assert!(offsets.max_abs_diff(&bias) < 1e-9, "offsets {offsets:?}");
    }
}
