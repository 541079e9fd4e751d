//! [`FaceController`] – calibrator → emotion policy → observers.
//!
//! For every sample the controller
//!
//! 1. removes the gyro bias with the [`GyroCalibrator`],
//! 2. forwards the calibrated sample to every [`TelemetrySink`],
//! 3. evaluates the [`EmotionPolicy`],
//! 4. notifies observers when the emotion changed or any pose axis moved by
//!    more than the publication epsilon.
//!
//! Observer failures (errors and panics) are logged and counted; they never
//! reach other observers or the caller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use axon_perception::{EmotionPolicy, GyroCalibrator};
use axon_types::{
    AxonError, CalibrationStatus, EmotionState, SensorSample, TelemetrySink, Vec3,
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::observer::EmotionObserver;

/// Default publication epsilon, degrees per pose axis.
pub const DEFAULT_PUBLISH_EPSILON_DEG: f64 = 0.5;

/// Snapshot of the controller for operator surfaces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerStatus {
    pub samples: u64,
    pub heartbeats: u64,
    pub calibration: CalibrationStatus,
    pub offsets: Option<Vec3>,
    pub emotion: Option<EmotionState>,
    pub observer_failures: u64,
    pub last_timestamp_us: u64,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            samples: 0,
            heartbeats: 0,
            calibration: CalibrationStatus::Uncalibrated,
            offsets: None,
            emotion: None,
            observer_failures: 0,
            last_timestamp_us: 0,
        }
    }
}

pub struct FaceController {
    calibrator: GyroCalibrator,
    policy: EmotionPolicy,
    observers: Vec<Box<dyn EmotionObserver>>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    publish_epsilon: f64,
    last_published: Option<EmotionState>,
    status: watch::Sender<ControllerStatus>,
}

impl FaceController {
    pub fn new(calibrator: GyroCalibrator, policy: EmotionPolicy) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        Self {
            calibrator,
            policy,
            observers: Vec::new(),
            sinks: Vec::new(),
            publish_epsilon: DEFAULT_PUBLISH_EPSILON_DEG,
            last_published: None,
            status,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn EmotionObserver>) -> Self {
        self.add_observer(observer);
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_publish_epsilon(mut self, epsilon_deg: f64) -> Self {
        self.publish_epsilon = epsilon_deg.max(0.0);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn EmotionObserver>) {
        debug!(observer = observer.name(), "emotion observer registered");
        self.observers.push(observer);
    }

    /// Subscribe to controller status snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status.subscribe()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibrator.state()
    }

    pub fn last_published(&self) -> Option<EmotionState> {
        self.last_published
    }

    pub fn observer_failures(&self) -> u64 {
        self.status.borrow().observer_failures
    }

    pub fn reset_calibration(&mut self) {
        self.calibrator.reset();
        self.status.send_modify(|s| {
            s.calibration = CalibrationStatus::Uncalibrated;
            s.offsets = None;
        });
    }

    /// Run one sample through the pipeline and return the policy's state.
    pub fn on_sample(&mut self, sample: &SensorSample) -> EmotionState {
        let calibrated = self.calibrator.observe(sample);
        for sink in &self.sinks {
            sink.publish(&calibrated);
        }

        let state = self.policy.evaluate(&calibrated);
        let failures = if self.should_publish(&state) {
            self.last_published = Some(state);
            self.notify(&state)
        } else {
            0
        };

        let offsets = self.calibrator.offsets();
        self.status.send_modify(|s| {
            s.samples += 1;
            if sample.is_heartbeat() {
                s.heartbeats += 1;
            }
            s.calibration = calibrated.status;
            s.offsets = offsets;
            s.emotion = Some(state);
            s.observer_failures += failures;
            s.last_timestamp_us = sample.timestamp_us();
        });
        state
    }

    fn should_publish(&self, state: &EmotionState) -> bool {
        match &self.last_published {
            None => true,
            Some(last) => {
                last.emotion != state.emotion
                    || last.pose.max_axis_delta(&state.pose) > self.publish_epsilon
            }
        }
    }

    /// Deliver `state` to every observer; returns the number that failed.
    fn notify(&mut self, state: &EmotionState) -> u64 {
        let mut failures = 0;
        for observer in &mut self.observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_emotion_update(state)));
            let (details, panicked) = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => (e.to_string(), false),
                Err(payload) => (panic_message(payload.as_ref()), true),
            };
            failures += 1;
            let failure = AxonError::ObserverFailure {
                observer: observer.name().to_string(),
                details,
            };
            if panicked {
                error!(error = %failure, "observer panicked; continuing with the rest");
            } else {
                warn!(error = %failure, "observer failed; continuing with the rest");
            }
        }
        failures
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}
