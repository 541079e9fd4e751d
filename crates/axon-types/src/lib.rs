//! `axon-types` – shared vocabulary for the Axon telemetry stack.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//!
//! - [`SensorSample`] – the immutable value produced once per acquisition
//!   tick and carried through calibration, emotion classification, and the
//!   network bridge.
//! - [`CalibratedSample`] – a raw sample paired with its bias-corrected gyro
//!   reading and the calibrator's status.
//! - [`EmotionState`] – the discrete emotion plus continuous head pose
//!   consumed by UI collaborators.
//! - [`Command`] – one operator line accepted by the bridge.
//! - [`wire`] – the newline-delimited `TEL` / `CMD` frame codec.
//!
//! The two seams between layers are also defined here so that no crate has to
//! depend on the concrete type on the other side: [`CommandSink`] (anything
//! that accepts a hardware-bound command) and [`TelemetrySink`] (anything that
//! republishes calibrated samples).

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod wire;

pub use wire::TelemetryFrame;

// ────────────────────────────────────────────────────────────────────────────
// Sample model
// ────────────────────────────────────────────────────────────────────────────

/// A three-axis reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Component-wise difference `self - other`.
    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Largest absolute component-wise difference between two vectors.
    pub fn max_abs_diff(&self, other: &Vec3) -> f64 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    Hardware,
    Simulated,
}

/// The motion and power payload decoded from one link frame, before the
/// acquisition loop stamps it with a session timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Accelerometer, g-units.
    pub accel: Vec3,
    /// Raw gyroscope rate, deg/s.
    pub gyro: Vec3,
    pub battery_voltage: f64,
    pub battery_percent: f64,
    /// 0–100.
    pub link_quality: u8,
}

/// One immutable telemetry sample.
///
/// Fields are private: a sample is built once by the acquisition loop (or
/// decoded from the wire) and only ever read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Microseconds since session start; `timestamp` on the wire.
    #[serde(rename = "timestamp")]
    timestamp_us: u64,
    accel: Vec3,
    gyro: Vec3,
    battery_voltage: f64,
    battery_percent: f64,
    link_quality: u8,
    source: SampleSource,
}

impl SensorSample {
    /// Stamp a decoded reading.
    pub fn new(timestamp_us: u64, source: SampleSource, reading: SensorReading) -> Self {
        Self {
            timestamp_us,
            accel: reading.accel,
            gyro: reading.gyro,
            battery_voltage: reading.battery_voltage,
            battery_percent: reading.battery_percent,
            link_quality: reading.link_quality.min(100),
            source,
        }
    }

    /// Synthetic sample emitted while the link is down.  Carries no motion
    /// and `link_quality = 0` so downstream timeout logic can react.
    pub fn heartbeat(timestamp_us: u64, source: SampleSource) -> Self {
        Self {
            timestamp_us,
            accel: Vec3::ZERO,
            gyro: Vec3::ZERO,
            battery_voltage: 0.0,
            battery_percent: 0.0,
            link_quality: 0,
            source,
        }
    }

    /// Monotonic session timestamp, microseconds.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn accel(&self) -> Vec3 {
        self.accel
    }

    pub fn gyro(&self) -> Vec3 {
        self.gyro
    }

    pub fn battery_voltage(&self) -> f64 {
        self.battery_voltage
    }

    pub fn battery_percent(&self) -> f64 {
        self.battery_percent
    }

    pub fn link_quality(&self) -> u8 {
        self.link_quality
    }

    pub fn source(&self) -> SampleSource {
        self.source
    }

    /// `true` for the synthetic samples produced while reconnecting.
    pub fn is_heartbeat(&self) -> bool {
        self.link_quality == 0 && self.accel == Vec3::ZERO && self.gyro == Vec3::ZERO
    }
}

/// Monotonic microsecond clock for one acquisition session.
///
/// Successive calls to [`SessionClock::now_us`] are strictly increasing even
/// when the underlying clock has not advanced by a full microsecond.
#[derive(Debug)]
pub struct SessionClock {
    origin: Instant,
    last_us: Option<u64>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_us: None,
        }
    }

    pub fn now_us(&mut self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        let next = match self.last_us {
            Some(last) => elapsed.max(last.saturating_add(1)),
            None => elapsed,
        };
        self.last_us = Some(next);
        next
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Calibration
// ────────────────────────────────────────────────────────────────────────────

/// Calibration state as reported on every telemetry frame.
///
/// `Uncalibrated` is a degraded-but-valid state, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationStatus {
    Uncalibrated,
    Calibrated,
}

impl fmt::Display for CalibrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationStatus::Uncalibrated => write!(f, "uncalibrated"),
            CalibrationStatus::Calibrated => write!(f, "calibrated"),
        }
    }
}

impl FromStr for CalibrationStatus {
    type Err = AxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncalibrated" => Ok(CalibrationStatus::Uncalibrated),
            "calibrated" => Ok(CalibrationStatus::Calibrated),
            other => Err(AxonError::Protocol(format!(
                "unknown calibration status '{other}'"
            ))),
        }
    }
}

/// A raw sample with the gyro bias removed.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedSample {
    pub raw: SensorSample,
    /// Bias-corrected gyro rate, deg/s.  Equal to the raw rate while
    /// uncalibrated.
    pub gyro: Vec3,
    pub status: CalibrationStatus,
}

// ────────────────────────────────────────────────────────────────────────────
// Emotion
// ────────────────────────────────────────────────────────────────────────────

/// Discrete facial expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Surprised,
    Sleepy,
    Curious,
    Neutral,
    Excited,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Sleepy,
        Emotion::Curious,
        Emotion::Neutral,
        Emotion::Excited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
            Emotion::Sleepy => "sleepy",
            Emotion::Curious => "curious",
            Emotion::Neutral => "neutral",
            Emotion::Excited => "excited",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = AxonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| AxonError::Protocol(format!("unknown emotion '{s}'")))
    }
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl Pose {
    /// Largest per-axis difference between two poses.
    pub fn max_axis_delta(&self, other: &Pose) -> f64 {
        (self.yaw - other.yaw)
            .abs()
            .max((self.pitch - other.pitch).abs())
            .max((self.roll - other.roll).abs())
    }
}

/// The value published to UI observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionState {
    pub emotion: Emotion,
    pub pose: Pose,
}

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// One operator command accepted by the bridge.
///
/// Created when a client sends a line; dropped once it has been forwarded to
/// the link and echoed to every client.  Never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sequence_id: u64,
    pub origin_client_id: u64,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

/// Hardware-bound command channel.
///
/// Implemented by the local acquisition handle and by the remote bridge
/// client, so an operator surface can issue commands without knowing whether
/// the robot is attached locally or reached over the network.
///
/// Implementations must not block.
pub trait CommandSink: Send + Sync {
    fn send_command(&self, raw_text: &str) -> Result<(), AxonError>;
}

/// Republishes calibrated samples (e.g. the bridge server's ingest side).
///
/// Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, sample: &CalibratedSample);
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Failures reported by a sensor link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("link read timed out")]
    Timeout,

    #[error("link disconnected: {0}")]
    Disconnected(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Error type spanning link failures, network failures, and configuration.
#[derive(Error, Debug)]
pub enum AxonError {
    #[error("Link Error: {0}")]
    Link(#[from] LinkError),

    #[error("Bind Failure on {addr}: {details}")]
    BindFailure { addr: String, details: String },

    #[error("Not connected to the bridge")]
    NotConnected,

    #[error("Observer Failure in {observer}: {details}")]
    ObserverFailure { observer: String, details: String },

    #[error("Client Overflow: client {client_id} dropped after {dropped} frames")]
    ClientOverflow { client_id: u64, dropped: u64 },

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Config Error: {0}")]
    Config(String),
}
