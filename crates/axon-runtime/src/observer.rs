//! UI observer interface.
//!
//! Observers are called from the pipeline task, at most once per distinct
//! state change, and must return promptly.  An observer that returns an error
//! or panics is isolated by the [`FaceController`][crate::FaceController].

use axon_types::{AxonError, Emotion, EmotionState, Pose};
use tokio::sync::watch;
use tracing::{debug, info};

pub trait EmotionObserver: Send {
    /// Identity used in failure logs.
    fn name(&self) -> &str;

    fn on_emotion_update(&mut self, state: &EmotionState) -> Result<(), AxonError>;
}

/// Publishes the latest state on a `tokio::sync::watch` channel.
///
/// Receivers always see the newest value; intermediate updates may be
/// skipped, which is what a renderer wants.
pub struct WatchObserver {
    tx: watch::Sender<EmotionState>,
}

impl WatchObserver {
    pub fn new() -> (Self, watch::Receiver<EmotionState>) {
        let (tx, rx) = watch::channel(EmotionState {
            emotion: Emotion::Neutral,
            pose: Pose::default(),
        });
        (Self { tx }, rx)
    }
}

impl EmotionObserver for WatchObserver {
    fn name(&self) -> &str {
        "watch"
    }

    fn on_emotion_update(&mut self, state: &EmotionState) -> Result<(), AxonError> {
        self.tx.send_replace(*state);
        Ok(())
    }
}

/// Logs emotion transitions at `info` and pose updates at `debug`.
#[derive(Debug, Default)]
pub struct LogObserver {
    last_emotion: Option<Emotion>,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmotionObserver for LogObserver {
    fn name(&self) -> &str {
        "log"
    }

    fn on_emotion_update(&mut self, state: &EmotionState) -> Result<(), AxonError> {
        let pose = state.pose;
        if self.last_emotion != Some(state.emotion) {
            info!(
                from = self.last_emotion.map(|e| e.as_str()).unwrap_or("-"),
                to = state.emotion.as_str(),
                "emotion changed"
            );
            self.last_emotion = Some(state.emotion);
        }
        debug!(
            emotion = state.emotion.as_str(),
            yaw = pose.yaw,
            pitch = pose.pitch,
            roll = pose.roll,
            "face updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_observer_keeps_latest_state() {
        let (mut observer, rx) = WatchObserver::new();
        assert_eq!(rx.borrow().emotion, Emotion::Neutral);

        for emotion in [Emotion::Happy, Emotion::Excited] {
            observer
                .on_emotion_update(&EmotionState {
                    emotion,
                    pose: Pose::default(),
                })
                .unwrap();
        }
        assert_eq!(rx.borrow().emotion, Emotion::Excited);
    }

    #[test]
    fn watch_observer_survives_dropped_receivers() {
        let (mut observer, rx) = WatchObserver::new();
        drop(rx);
        let state = EmotionState {
            emotion: Emotion::Sad,
            pose: Pose::default(),
        };
        assert!(observer.on_emotion_update(&state).is_ok());
    }

    #[test]
    fn log_observer_tracks_the_last_emotion() {
        let mut observer = LogObserver::new();
        let state = EmotionState {
            emotion: Emotion::Curious,
            pose: Pose::default(),
        };
        observer.on_emotion_update(&state).unwrap();
        observer.on_emotion_update(&state).unwrap();
        assert_eq!(observer.last_emotion, Some(Emotion::Curious));
    }
}
