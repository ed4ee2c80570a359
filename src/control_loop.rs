use crate::actuator::{ActuatorError, ActuatorOutput};
use crate::batcher::{Batch, FrameBatcher};
use crate::camera::{CameraError, FrameSource};
use crate::classifier::{check_predictions, ClassifierBackend, ClassifierError, Prediction};
use crate::config::Config;
use crate::frame::Frame;
use crate::manual::{save_capture, ManualCommand, ManualError, ManualOverride};
use crate::motion::MotionController;
use crate::servo::{ServoSweeper, SweepError, SweepLaunch, SweepPlan};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tracing::instrument;

const MANUAL_COMMAND_BUFFER: usize = 16;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Capture error: {0}")]
    Capture(#[from] CameraError),
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),
    #[error("Sweep of servo `{servo}` failed: {source}")]
    Sweep {
        servo: String,
        source: ActuatorError,
    },
}

impl ControlError {
    pub fn category(&self) -> &'static str {
        match self {
            ControlError::Capture(_) => "capture",
            ControlError::Actuator(_) | ControlError::Sweep { .. } => "actuator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Driving,
    HaltedForSweep,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    EndOfStream,
    ShutdownSignal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopReport {
    pub frames: u64,
    pub batches: u64,
    pub inference_failures: u64,
    pub dropped_frames: u64,
    pub halts: u64,
    pub sweeps_launched: u64,
    pub sweeps_rejected: u64,
    pub captures: u64,
    pub termination: Option<TerminationReason>,
}

/// Index of the first prediction whose argmax is `halt_class_index`.
pub fn find_halt_frame(predictions: &[Prediction], halt_class_index: usize) -> Option<usize> {
    predictions
        .iter()
        .position(|prediction| prediction.argmax() == Some(halt_class_index))
}

/// Runs inference on the blocking pool.
async fn classify(
    classifier: Arc<dyn ClassifierBackend>,
    batch: Batch,
    num_classes: usize,
) -> Result<Vec<Prediction>, ClassifierError> {
    let expected = batch.len();
    let predictions = tokio::task::spawn_blocking(move || classifier.classify(batch))
        .await
        .map_err(|e| ClassifierError::TaskFailed(e.to_string()))??;
    check_predictions(expected, num_classes, predictions)
}

/// Capture, classify, decide, act.
///
/// The loop is the only writer of the motor channels. Servo channels are
/// written by the sweeps it launches. Manual commands are queued through a
/// [`ManualOverride`] and executed between frames.
pub struct ControlLoop {
    config: Config,
    source: Box<dyn FrameSource>,
    classifier: Arc<dyn ClassifierBackend>,
    actuator: Arc<dyn ActuatorOutput>,
    motion: MotionController,
    sweeper: ServoSweeper,
    batcher: FrameBatcher,
    plan: SweepPlan,
    commands_tx: mpsc::Sender<ManualCommand>,
    commands_rx: mpsc::Receiver<ManualCommand>,
    state: LoopState,
    report: LoopReport,
}

type Step = Result<Option<TerminationReason>, ControlError>;

impl ControlLoop {
    pub fn new(
        config: Config,
        source: Box<dyn FrameSource>,
        classifier: Arc<dyn ClassifierBackend>,
        actuator: Arc<dyn ActuatorOutput>,
    ) -> Self {
        let motion = MotionController::new(Arc::clone(&actuator), config.motors.clone());
        let sweeper = ServoSweeper::new(Arc::clone(&actuator), &config);
        let batcher = FrameBatcher::new(&config.classifier);
        let plan = SweepPlan::from_config(&config.sweep);
        let (commands_tx, commands_rx) = mpsc::channel(MANUAL_COMMAND_BUFFER);

        Self {
            config,
            source,
            classifier,
            actuator,
            motion,
            sweeper,
            batcher,
            plan,
            commands_tx,
            commands_rx,
            state: LoopState::Driving,
            report: LoopReport::default(),
        }
    }

    pub fn manual_override(&self) -> ManualOverride {
        ManualOverride::new(self.commands_tx.clone())
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Loop state changed");
            self.state = next;
        }
    }

    /// Runs until the stream ends, a fatal error occurs or `shutdown_rx`
    /// fires. Every exit path stops the motors, parks the servos and
    /// releases the outputs.
    pub async fn run(
        mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<LoopReport, ControlError> {
        tracing::info!(
            speed = self.config.drive.speed,
            batch_size = self.config.classifier.batch_size,
            halt_class = self.config.classifier.halt_label(),
            "Control loop starting"
        );

        let outcome = self.drive(&mut shutdown_rx).await;
        let terminated = self.terminate().await;
        let late_failure = self.sweeper.take_failure();

        let result = match (outcome, terminated, late_failure) {
            (Err(e), terminated, _) => {
                if let Err(idle) = terminated {
                    tracing::error!("Failed to idle outputs: {}", idle);
                }
                Err(e)
            }
            (Ok(_), _, Some(failure)) => Err(ControlError::Sweep {
                servo: failure.servo,
                source: failure.error,
            }),
            (Ok(_), Err(idle), None) => Err(idle.into()),
            (Ok(reason), Ok(()), None) => {
                self.report.termination = Some(reason);
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(report = ?self.report, "Control loop terminated");
                Ok(self.report)
            }
            Err(e) => {
                tracing::error!(
                    category = e.category(),
                    report = ?self.report,
                    "Control loop failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<TerminationReason, ControlError> {
        self.motion.drive_forward(self.config.drive.speed)?;
        self.transition(LoopState::Driving);

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => Ok(Some(TerminationReason::ShutdownSignal)),
                Some(failure) = self.sweeper.next_failure() => Err(ControlError::Sweep {
                    servo: failure.servo,
                    source: failure.error,
                }),
                Some(command) = self.commands_rx.recv() => {
                    self.handle_command(command, shutdown_rx).await
                }
                frame = self.source.next_frame() => match frame? {
                    Some(frame) => self.process_frame(frame, shutdown_rx).await,
                    None => Ok(Some(TerminationReason::EndOfStream)),
                },
            };

            if let Some(reason) = step? {
                return Ok(reason);
            }
        }
    }

    #[instrument(skip_all, fields(sequence = frame.sequence()))]
    async fn process_frame(
        &mut self,
        frame: Frame,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Step {
        self.report.frames += 1;

        let batch = match self.batcher.push(frame) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                self.report.dropped_frames += 1;
                return Ok(None);
            }
        };
        let sequences: Vec<u64> = batch.frames().iter().map(|f| f.sequence).collect();

        let classifier = Arc::clone(&self.classifier);
        let num_classes = self.config.classifier.num_classes();
        let predictions = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(Some(TerminationReason::ShutdownSignal)),
            result = classify(classifier, batch, num_classes) => result,
        };
        let predictions = match predictions {
            Ok(predictions) => predictions,
            Err(e) => {
                tracing::warn!(frames = ?sequences, "Skipping batch: {}", e);
                self.report.inference_failures += 1;
                return Ok(None);
            }
        };
        self.report.batches += 1;

        let labels = &self.config.classifier.class_labels;
        for (sequence, prediction) in sequences.iter().zip(&predictions) {
            tracing::debug!(frame = sequence, "Prediction: {}", prediction.describe(labels));
        }

        match find_halt_frame(&predictions, self.config.classifier.halt_class_index) {
            Some(index) => self.halt_for_sweep(sequences[index], shutdown_rx).await,
            None => Ok(None),
        }
    }

    async fn halt_for_sweep(
        &mut self,
        sequence: u64,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Step {
        tracing::info!(
            frame = sequence,
            class = self.config.classifier.halt_label(),
            "Halt class detected, stopping for sweep"
        );
        self.transition(LoopState::HaltedForSweep);
        self.report.halts += 1;
        self.motion.stop()?;

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(Some(TerminationReason::ShutdownSignal)),
            _ = sleep(self.config.drive.get_settle_delay()) => {}
        }

        match self.sweeper.start(&self.config.sweep.servo, self.plan) {
            Ok(SweepLaunch::Started) => self.report.sweeps_launched += 1,
            Ok(SweepLaunch::Rejected) => self.report.sweeps_rejected += 1,
            Err(SweepError::Actuator(source)) => {
                return Err(ControlError::Sweep {
                    servo: self.config.sweep.servo.clone(),
                    source,
                })
            }
            Err(e) => tracing::error!("Sweep request aborted: {}", e),
        }

        self.motion.drive_forward(self.config.drive.speed)?;
        self.transition(LoopState::Driving);
        Ok(None)
    }

    async fn handle_command(
        &mut self,
        command: ManualCommand,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Step {
        match command {
            ManualCommand::Move { direction, reply } => {
                tracing::info!(?direction, "Manual move");
                let result = self.motion.apply(direction, self.config.drive.manual_speed);
                let _ = reply.send(
                    result
                        .clone()
                        .map_err(|e| ManualError::MoveFailed(e.to_string())),
                );
                result?;
                Ok(None)
            }
            ManualCommand::Capture { reply } => {
                let frame = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        let _ = reply.send(Err(ManualError::CaptureFailed(
                            "rover is shutting down".into(),
                        )));
                        return Ok(Some(TerminationReason::ShutdownSignal));
                    }
                    frame = self.source.next_frame() => frame,
                };
                self.finish_capture(frame, reply).await
            }
        }
    }

    async fn finish_capture(
        &mut self,
        frame: Result<Option<Frame>, CameraError>,
        reply: oneshot::Sender<Result<PathBuf, ManualError>>,
    ) -> Step {
        match frame {
            Ok(Some(frame)) => {
                let saved = save_capture(&self.config.capture_dir, frame).await;
                if saved.is_ok() {
                    self.report.captures += 1;
                }
                let _ = reply.send(saved);
                Ok(None)
            }
            Ok(None) => {
                let _ = reply.send(Err(ManualError::CaptureFailed("frame stream ended".into())));
                Ok(Some(TerminationReason::EndOfStream))
            }
            Err(e) => {
                let _ = reply.send(Err(ManualError::CaptureFailed(e.to_string())));
                Err(e.into())
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), ActuatorError> {
        self.transition(LoopState::Terminated);
        let stopped = self.motion.stop();
        self.sweeper
            .shutdown(self.config.sweep.get_shutdown_grace())
            .await;
        let released = self.actuator.release();
        stopped.and(released)
    }
}
