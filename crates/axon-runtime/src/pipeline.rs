//! The pipeline task: the single owner of calibration and emotion state.
//!
//! Samples and control messages arrive on separate channels.  Control is
//! polled first so a calibration reset or shutdown never waits behind a
//! backlog of samples.

use axon_types::SensorSample;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::face_controller::FaceController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineControl {
    /// Clear the gyro offsets and start a new rest window.
    ResetCalibration,
    Shutdown,
}

/// Drive `controller` until shutdown or until the sample stream ends.
///
/// Returns the controller so callers (and tests) can inspect its final
/// state.
pub async fn run_pipeline(
    mut controller: FaceController,
    mut samples: mpsc::Receiver<SensorSample>,
    mut control: mpsc::Receiver<PipelineControl>,
) -> FaceController {
    let mut control_open = true;
    loop {
        tokio::select! {
            biased;

            message = control.recv(), if control_open => match message {
                Some(PipelineControl::ResetCalibration) => controller.reset_calibration(),
                Some(PipelineControl::Shutdown) => {
                    info!("pipeline shutdown requested");
                    break;
                }
                None => control_open = false,
            },

            sample = samples.recv() => match sample {
                Some(sample) => {
                    controller.on_sample(&sample);
                }
                None => {
                    debug!("sample stream ended");
                    break;
                }
            },
        }
    }
    controller
}
