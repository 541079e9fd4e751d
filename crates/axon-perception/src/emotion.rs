//! Rule-based emotion classification with dwell-time hysteresis.
//!
//! Every calibrated sample produces a *candidate* emotion.  Candidates are
//! checked in priority order and the first match wins:
//!
//! | # | Condition | Candidate |
//! |---|---|---|
//! | 1 | link quality below `poor_link_quality` (includes heartbeats) | `sad` |
//! | 2 | mean gyro magnitude over the history ≥ `excited_rate` | `excited` |
//! | 3 | current gyro magnitude ≥ `surprised_rate` | `surprised` |
//! | 4 | pose beyond `curious_tilt` on any axis | `curious` |
//! | 5 | battery known and below `low_battery_percent` | `sad` |
//! | 6 | at rest for at least `sleepy_after` | `sleepy` |
//! | 7 | at rest | `neutral` |
//! | 8 | otherwise (gentle motion) | `happy` |
//!
//! The reported emotion only changes once the same candidate has persisted
//! for `dwell`.  A candidate that flips back before then is forgotten.

use std::collections::VecDeque;
use std::time::Duration;

use axon_types::{CalibratedSample, Emotion, EmotionState, Pose};
use tracing::debug;

use crate::pose::PoseEstimator;

#[derive(Debug, Clone)]
pub struct EmotionPolicyConfig {
    pub dwell: Duration,
    /// Number of recent gyro magnitudes kept for the `excited` rule.
    pub history_len: usize,
    /// deg/s, compared against the history mean.
    pub excited_rate: f64,
    /// deg/s, compared against the current sample.
    pub surprised_rate: f64,
    /// deg/s below which the device counts as resting.
    pub rest_rate: f64,
    pub sleepy_after: Duration,
    pub low_battery_percent: f64,
    pub poor_link_quality: u8,
    /// Per-axis tilt (degrees) that makes the face curious.
    pub curious_tilt: Pose,
    /// Symmetric per-axis pose bound (degrees).
    pub pose_limits: Pose,
    pub complementary_alpha: f64,
    pub max_step: Duration,
    /// deg/s at which yaw drifts back to centre while resting.
    pub yaw_recenter_rate: f64,
}

impl Default for EmotionPolicyConfig {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(400),
            history_len: 16,
            excited_rate: 120.0,
            surprised_rate: 60.0,
            rest_rate: 3.0,
            sleepy_after: Duration::from_secs(8),
            low_battery_percent: 20.0,
            poor_link_quality: 30,
            curious_tilt: Pose {
                yaw: 30.0,
                pitch: 18.0,
                roll: 20.0,
            },
            pose_limits: Pose {
                yaw: 45.0,
                pitch: 30.0,
                roll: 25.0,
            },
            complementary_alpha: 0.98,
            max_step: Duration::from_millis(500),
            yaw_recenter_rate: 10.0,
        }
    }
}

#[derive(Debug)]
pub struct EmotionPolicy {
    config: EmotionPolicyConfig,
    pose: PoseEstimator,
    history: VecDeque<f64>,
    current: Emotion,
    pending: Option<(Emotion, u64)>,
    rest_since_us: Option<u64>,
}

impl EmotionPolicy {
    pub fn new(config: EmotionPolicyConfig) -> Self {
        let pose = PoseEstimator::new(
            config.complementary_alpha,
            config.pose_limits,
            config.max_step.as_secs_f64(),
        );
        Self {
            history: VecDeque::with_capacity(config.history_len.max(1)),
            config,
            pose,
            current: Emotion::Neutral,
            pending: None,
            rest_since_us: None,
        }
    }

    pub fn current(&self) -> EmotionState {
        EmotionState {
            emotion: self.current,
            pose: self.pose.pose(),
        }
    }

    pub fn evaluate(&mut self, sample: &CalibratedSample) -> EmotionState {
        let timestamp = sample.raw.timestamp_us();
        let magnitude = sample.gyro.magnitude();

        if sample.raw.is_heartbeat() {
            self.pose.break_continuity();
            self.history.clear();
            self.rest_since_us = None;
        } else {
            let step = self.pose.update(timestamp, sample.gyro, sample.raw.accel());
            self.history.push_back(magnitude);
            while self.history.len() > self.config.history_len.max(1) {
                self.history.pop_front();
            }
            if magnitude < self.config.rest_rate {
                self.rest_since_us.get_or_insert(timestamp);
                if let Some(dt) = step {
                    self.pose.recenter_yaw(self.config.yaw_recenter_rate * dt);
                }
            } else {
                self.rest_since_us = None;
            }
        }

        let candidate = self.classify(sample, magnitude, timestamp);
        self.apply_hysteresis(candidate, timestamp);
        self.current()
    }

    fn classify(&self, sample: &CalibratedSample, magnitude: f64, timestamp: u64) -> Emotion {
        let config = &self.config;
        if sample.raw.link_quality() < config.poor_link_quality {
            return Emotion::Sad;
        }

        let mean = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        };
        if mean >= config.excited_rate {
            return Emotion::Excited;
        }
        if magnitude >= config.surprised_rate {
            return Emotion::Surprised;
        }

        let pose = self.pose.pose();
        let tilt = config.curious_tilt;
        if pose.yaw.abs() > tilt.yaw || pose.pitch.abs() > tilt.pitch || pose.roll.abs() > tilt.roll
        {
            return Emotion::Curious;
        }

        let battery = sample.raw.battery_percent();
        if battery > 0.0 && battery < config.low_battery_percent {
            return Emotion::Sad;
        }

        match self.rest_since_us {
            Some(since) => {
                let sleepy_us = u64::try_from(config.sleepy_after.as_micros()).unwrap_or(u64::MAX);
                if timestamp.saturating_sub(since) >= sleepy_us {
                    Emotion::Sleepy
                } else {
                    Emotion::Neutral
                }
            }
            None => Emotion::Happy,
        }
    }

    fn apply_hysteresis(&mut self, candidate: Emotion, timestamp: u64) {
        if candidate == self.current {
            self.pending = None;
            return;
        }

        let since = match self.pending {
            Some((pending, since)) if pending == candidate => since,
            _ => {
                self.pending = Some((candidate, timestamp));
                timestamp
            }
        };

        let dwell_us = u64::try_from(self.config.dwell.as_micros()).unwrap_or(u64::MAX);
        if timestamp.saturating_sub(since) >= dwell_us {
            debug!(from = %self.current, to = %candidate, "emotion transition");
            self.current = candidate;
            self.pending = None;
        }
    }
}

impl Default for EmotionPolicy {
    fn default() -> Self {
        Self::new(EmotionPolicyConfig::default())
    }
}
