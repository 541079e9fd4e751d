//! Pose estimation from calibrated gyro rates.
//!
//! Yaw is the integral of the Z rate.  Pitch and roll integrate the X and Y
//! rates and are pulled toward the accelerometer tilt by a complementary
//! filter:
//!
//! ```text
//! pitch = α * (pitch + ωx * dt) + (1 − α) * atan2(−ay, az)
//! roll  = α * (roll  + ωy * dt) + (1 − α) * atan2(ax, az)
//! ```
//!
//! The accelerometer term is only used while |accel| is close to 1 g.  Every
//! axis is clamped to the face's physical range so integration error cannot
//! accumulate into an unreachable orientation.

use axon_types::{Pose, Vec3};

/// Accelerometer readings further than this from 1 g are not trusted for tilt.
const TILT_TRUST_BAND_G: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct PoseEstimator {
    pose: Pose,
    /// Complementary filter coefficient (0–1).
    alpha: f64,
    /// Symmetric per-axis bound, degrees.
    limits: Pose,
    /// Longer gaps are treated as discontinuities.
    max_step_s: f64,
    last_timestamp_us: Option<u64>,
}

impl PoseEstimator {
    pub fn new(alpha: f64, limits: Pose, max_step_s: f64) -> Self {
        Self {
            pose: Pose::default(),
            alpha: alpha.clamp(0.0, 1.0),
            limits,
            max_step_s,
            last_timestamp_us: None,
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Step the filter to `timestamp_us`.  Returns the step length in
    /// seconds, or `None` when the step was skipped.
    pub fn update(&mut self, timestamp_us: u64, gyro: Vec3, accel: Vec3) -> Option<f64> {
        let previous = self.last_timestamp_us.replace(timestamp_us);
        let dt = match previous {
            Some(last) if timestamp_us > last => (timestamp_us - last) as f64 / 1e6,
            _ => return None,
        };
        if dt > self.max_step_s {
            return None;
        }

        let mut pitch = self.pose.pitch + gyro.x * dt;
        let mut roll = self.pose.roll + gyro.y * dt;
        if (accel.magnitude() - 1.0).abs() < TILT_TRUST_BAND_G {
            let pitch_acc = (-accel.y).atan2(accel.z).to_degrees();
            let roll_acc = accel.x.atan2(accel.z).to_degrees();
            pitch = self.alpha * pitch + (1.0 - self.alpha) * pitch_acc;
            roll = self.alpha * roll + (1.0 - self.alpha) * roll_acc;
        }

        self.pose = Pose {
            yaw: clamp_axis(self.pose.yaw + gyro.z * dt, self.limits.yaw),
            pitch: clamp_axis(pitch, self.limits.pitch),
            roll: clamp_axis(roll, self.limits.roll),
        };
        Some(dt)
    }

    /// Move yaw toward zero by at most `amount` degrees.
    pub fn recenter_yaw(&mut self, amount: f64) {
        let yaw = self.pose.yaw;
        self.pose.yaw = yaw - yaw.signum() * amount.min(yaw.abs());
    }

    /// Forget the previous timestamp so the next update does not integrate
    /// across a gap.
    pub fn break_continuity(&mut self) {
        self.last_timestamp_us = None;
    }
}

fn clamp_axis(value: f64, limit: f64) -> f64 {
    value.clamp(-limit, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> PoseEstimator {
        PoseEstimator::new(
            0.98,
            Pose {
                yaw: 45.0,
                pitch: 30.0,
                roll: 25.0,
            },
            0.5,
        )
    }

    fn level() -> Vec3 {
        Vec3::new(0.0, 0.0, 1.0)
    }

    #[test]
    fn first_update_only_sets_the_origin() {
        let mut pose = estimator();
        assert_eq!(pose.update(0, Vec3::new(0.0, 0.0, 100.0), level()), None);
        assert_eq!(pose.pose(), Pose::default());
    }

    #[test]
    fn yaw_integrates_and_clamps() {
        let mut pose = estimator();
        pose.update(0, Vec3::ZERO, level());
        pose.update(100_000, Vec3::new(0.0, 0.0, 100.0), level());
        assert!((pose.pose().yaw - 10.0).abs() < 1e-9);

        for i in 2..100u64 {
            pose.update(i * 100_000, Vec3::new(0.0, 0.0, 100.0), level());
        }
        assert_eq!(pose.pose().yaw, 45.0);
    }

    #[test]
    fn accel_tilt_pulls_pitch() {
        let mut pose = estimator();
        let tilt = 20.0f64.to_radians();
        let accel = Vec3::new(0.0, -tilt.sin(), tilt.cos());
        pose.update(0, Vec3::ZERO, accel);
        for i in 1..500u64 {
            pose.update(i * 20_000, Vec3::ZERO, accel);
        }
        assert!((pose.pose().pitch - 20.0).abs() < 0.5, "pitch {}", pose.pose().pitch);
    }

    #[test]
    fn long_gaps_and_rewinds_skip_integration() {
        let mut pose = estimator();
        pose.update(0, Vec3::ZERO, level());
        assert_eq!(pose.update(2_000_000, Vec3::new(0.0, 0.0, 90.0), level()), None);
        assert_eq!(pose.update(1_000_000, Vec3::new(0.0, 0.0, 90.0), level()), None);
        assert_eq!(pose.pose().yaw, 0.0);

        pose.break_continuity();
        assert_eq!(pose.update(1_020_000, Vec3::new(0.0, 0.0, 90.0), level()), None);
    }

    #[test]
    fn recenter_never_overshoots() {
        let mut pose = estimator();
        pose.update(0, Vec3::ZERO, level());
        pose.update(100_000, Vec3::new(0.0, 0.0, -50.0), level());
        pose.recenter_yaw(2.0);
        assert!((pose.pose().yaw + 3.0).abs() < 1e-9);
        pose.recenter_yaw(10.0);
        assert_eq!(pose.pose().yaw, 0.0);
    }
}
