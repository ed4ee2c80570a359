//! Test doubles for the component traits.

use crate::actuator::{ActuatorError, ActuatorOutput, DirectionState, PinPair};
use crate::batcher::Batch;
use crate::camera::{CameraError, FrameSource};
use crate::classifier::{ClassifierBackend, ClassifierError, Prediction};
use crate::config::Config;
use crate::frame::Frame;
use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, Rgb};
use parking_lot::Mutex;
use std::collections::VecDeque;

pub const TEST_CONFIG: &str = r#"
log_level: debug
drive:
  speed: 50
  settle_delay_ms: 10
classifier:
  model_path: models/weed.onnx
  input_width: 8
  input_height: 8
  batch_size: 1
sweep:
  servo: x_axis
  start_angle: 0
  target_angle: 120
  duration_ms: 40
  steps: 4
  return_pause_ms: 5
  shutdown_grace_ms: 500
capture_dir: target/test-captures
"#;

pub fn test_config() -> Config {
    Config::from_yaml(TEST_CONFIG).unwrap()
}

pub fn test_frame(sequence: u64) -> Frame {
    let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(4, 4, Rgb([30, 160, 40]));
    Frame::new(sequence, DynamicImage::ImageRgb8(img))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Configure { channel: u8, frequency_hz: f64 },
    Duty { channel: u8, percent: f64 },
    Direction { pins: PinPair, state: DirectionState },
    Release,
}

/// Records every write in order.
#[derive(Default)]
pub struct RecordingActuator {
    writes: Mutex<Vec<Write>>,
    failing: Option<FailingChannel>,
}

struct FailingChannel {
    channel: u8,
    /// Writes accepted before the channel starts failing.
    remaining: Mutex<usize>,
}

impl RecordingActuator {
    /// Every write to `channel` fails.
    pub fn failing_channel(channel: u8) -> Self {
        Self::failing_channel_after(channel, 0)
    }

    /// Writes to `channel` succeed `accepted` times, then fail.
    pub fn failing_channel_after(channel: u8, accepted: usize) -> Self {
        Self {
            writes: Mutex::default(),
            failing: Some(FailingChannel {
                channel,
                remaining: Mutex::new(accepted),
            }),
        }
    }

    pub fn writes(&self) -> Vec<Write> {
        self.writes.lock().clone()
    }

    fn check(&self, channel: u8) -> Result<(), ActuatorError> {
        let Some(failing) = self.failing.as_ref().filter(|f| f.channel == channel) else {
            return Ok(());
        };
        let mut remaining = failing.remaining.lock();
        if *remaining == 0 {
            return Err(ActuatorError::UnknownChannel(channel));
        }
        *remaining -= 1;
        Ok(())
    }
}

impl ActuatorOutput for RecordingActuator {
    fn configure_pwm(
        &self,
        channel: u8,
        frequency_hz: f64,
        _initial_duty: f64,
    ) -> Result<(), ActuatorError> {
        self.check(channel)?;
        self.writes.lock().push(Write::Configure {
            channel,
            frequency_hz,
        });
        Ok(())
    }

    fn set_duty_cycle(&self, channel: u8, percent: f64) -> Result<(), ActuatorError> {
        self.check(channel)?;
        self.writes.lock().push(Write::Duty { channel, percent });
        Ok(())
    }

    fn set_direction(&self, pins: PinPair, state: DirectionState) -> Result<(), ActuatorError> {
        self.writes.lock().push(Write::Direction { pins, state });
        Ok(())
    }

    fn release(&self) -> Result<(), ActuatorError> {
        self.writes.lock().push(Write::Release);
        Ok(())
    }
}

/// Yields its scripted results, then ends the stream or stalls.
#[derive(Default)]
pub struct ScriptedSource {
    frames: VecDeque<Result<Frame, CameraError>>,
    stall_when_empty: bool,
}

impl ScriptedSource {
    pub fn frames(count: u64) -> Self {
        Self {
            frames: (1..=count).map(|sequence| Ok(test_frame(sequence))).collect(),
            stall_when_empty: false,
        }
    }

    /// Never ends the stream once the script is used up.
    pub fn then_stall(mut self) -> Self {
        self.stall_when_empty = true;
        self
    }

    pub fn then_fail(mut self, message: &str) -> Self {
        self.frames
            .push_back(Err(CameraError::ReadFrameFailed(message.to_string())));
        self
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        tokio::task::yield_now().await;
        if self.frames.is_empty() && self.stall_when_empty {
            std::future::pending::<()>().await;
        }
        self.frames.pop_front().transpose()
    }
}

/// A source that never produces a frame.
pub struct StalledSource;

#[async_trait]
impl FrameSource for StalledSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        std::future::pending().await
    }
}

/// Answers each batch with the next scripted result and remembers the
/// frame sequences it was given.
#[derive(Default)]
pub struct ScriptedClassifier {
    responses: Mutex<VecDeque<Result<Vec<Prediction>, ClassifierError>>>,
    seen: Mutex<Vec<Vec<u64>>>,
}

impl ScriptedClassifier {
    pub fn new(responses: Vec<Result<Vec<Prediction>, ClassifierError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::default(),
        }
    }

    /// One single-frame batch per row.
    pub fn rows(rows: &[[f32; 3]]) -> Self {
        Self::new(
            rows.iter()
                .map(|row| Ok(vec![Prediction::new(row.to_vec())]))
                .collect(),
        )
    }

    pub fn seen(&self) -> Vec<Vec<u64>> {
        self.seen.lock().clone()
    }
}

impl ClassifierBackend for ScriptedClassifier {
    fn classify(&self, batch: Batch) -> Result<Vec<Prediction>, ClassifierError> {
        self.seen
            .lock()
            .push(batch.frames().iter().map(|f| f.sequence).collect());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ClassifierError::InferenceFailed("script exhausted".into())))
    }
}
