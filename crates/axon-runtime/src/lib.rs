//! # axon-runtime
//!
//! Orchestration between the sample stream and its consumers.
//!
//! | Module | Role |
//! |---|---|
//! | [`observer`] | [`EmotionObserver`] trait, the watch-channel and logging observers |
//! | [`face_controller`] | [`FaceController`]: calibrator → policy → observers and telemetry sinks |
//! | [`pipeline`] | [`run_pipeline`]: the single task that owns the controller |
//! | [`telemetry`] | `tracing` subscriber and optional OTLP export |

pub mod face_controller;
pub mod observer;
pub mod pipeline;
pub mod telemetry;

pub use face_controller::{ControllerStatus, FaceController};
pub use observer::{EmotionObserver, LogObserver, WatchObserver};
pub use pipeline::{PipelineControl, run_pipeline};
