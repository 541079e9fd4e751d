//! `axon-perception` – from raw gyro telemetry to an emotional expression.
//!
//! Everything here is pure computation over samples that already exist; no
//! method blocks or touches a queue.
//!
//! # Modules
//!
//! - [`calibrator`] – [`GyroCalibrator`][calibrator::GyroCalibrator]: detects a
//!   3 s rest window and removes the constant gyro bias.
//! - [`pose`] – [`PoseEstimator`][pose::PoseEstimator]: complementary filter
//!   that integrates calibrated rates into a clamped yaw/pitch/roll pose.
//! - [`emotion`] – [`EmotionPolicy`][emotion::EmotionPolicy]: rule-based
//!   classifier with dwell-time hysteresis.

pub mod calibrator;
pub mod emotion;
pub mod pose;

pub use calibrator::{CalibratorConfig, GyroCalibrator};
pub use emotion::{EmotionPolicy, EmotionPolicyConfig};
pub use pose::PoseEstimator;
