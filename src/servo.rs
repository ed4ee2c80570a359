use crate::actuator::{ActuatorError, ActuatorOutput};
use crate::config::{Config, SweepConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

/// Duty cycle at 0°.
pub const SERVO_DUTY_OFFSET: f64 = 2.5;
/// Degrees per percent of duty cycle; 180° lands on 12.5%.
pub const SERVO_DUTY_SCALE: f64 = 18.0;

pub fn clamp_angle(angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    angle.clamp(0.0, 180.0)
}

pub fn angle_to_duty_cycle(angle: f64) -> f64 {
    SERVO_DUTY_OFFSET + clamp_angle(angle) / SERVO_DUTY_SCALE
}

pub fn duty_cycle_to_angle(duty: f64) -> f64 {
    clamp_angle((duty - SERVO_DUTY_OFFSET) * SERVO_DUTY_SCALE)
}

/// `steps` evenly spaced angles from `start` to `target`, both included.
/// A single step goes straight to `target`.
pub fn interpolate_angles(start: f64, target: f64, steps: usize) -> Vec<f64> {
    let start = clamp_angle(start);
    let target = clamp_angle(target);
    match steps {
        0 => Vec::new(),
        1 => vec![target],
        _ => {
            let increment = (target - start) / (steps - 1) as f64;
            (0..steps)
                .map(|i| {
                    if i == steps - 1 {
                        target
                    } else {
                        start + increment * i as f64
                    }
                })
                .collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPlan {
    pub start_angle: f64,
    pub target_angle: f64,
    pub duration: Duration,
    pub steps: usize,
    pub return_pause: Duration,
}

impl SweepPlan {
    pub fn from_config(config: &SweepConfig) -> Self {
        Self {
            start_angle: config.start_angle,
            target_angle: config.target_angle,
            duration: config.get_duration(),
            steps: config.steps,
            return_pause: config.get_return_pause(),
        }
    }

    pub fn step_interval(&self) -> Duration {
        self.duration / self.steps.max(1) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepLaunch {
    Started,
    /// The servo is still owned by an earlier sweep; nothing was written.
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("Unknown servo: {0}")]
    UnknownServo(String),
    #[error("Invalid sweep: {0}")]
    InvalidPlan(String),
    #[error("Servo output failed: {0}")]
    Actuator(#[from] ActuatorError),
}

/// A sweep task that lost its servo output.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepFailure {
    pub servo: String,
    pub error: ActuatorError,
}

struct ServoSlot {
    channel: u8,
    /// Start angle of the latest sweep; where the servo idles.
    park_angle: f64,
    task: Option<JoinHandle<()>>,
}

impl ServoSlot {
    fn is_busy(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

/// Launches interpolated servo sweeps as background tasks.
///
/// A servo belongs to at most one running sweep. Requests for a servo that
/// is still sweeping are rejected, never queued.
pub struct ServoSweeper {
    actuator: Arc<dyn ActuatorOutput>,
    slots: HashMap<String, ServoSlot>,
    shutdown_tx: broadcast::Sender<()>,
    failure_tx: mpsc::UnboundedSender<SweepFailure>,
    failure_rx: mpsc::UnboundedReceiver<SweepFailure>,
    shutting_down: bool,
}

impl ServoSweeper {
    pub fn new(actuator: Arc<dyn ActuatorOutput>, config: &Config) -> Self {
        let slots = config
            .servos
            .iter()
            .map(|servo| {
                let slot = ServoSlot {
                    channel: servo.pwm_channel,
                    park_angle: servo.rest_angle,
                    task: None,
                };
                (servo.name.clone(), slot)
            })
            .collect();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        Self {
            actuator,
            slots,
            shutdown_tx,
            failure_tx,
            failure_rx,
            shutting_down: false,
        }
    }

    pub fn is_sweeping(&self, servo_id: &str) -> bool {
        self.slots.get(servo_id).is_some_and(ServoSlot::is_busy)
    }

    /// Writes the first step of the sweep, then spawns the rest of it
    /// without waiting.
    pub fn start(&mut self, servo_id: &str, plan: SweepPlan) -> Result<SweepLaunch, SweepError> {
        let slot = self
            .slots
            .get_mut(servo_id)
            .ok_or_else(|| SweepError::UnknownServo(servo_id.to_string()))?;

        if plan.steps == 0 {
            return Err(SweepError::InvalidPlan("a sweep needs at least one step".into()));
        }

        if self.shutting_down || slot.is_busy() {
            tracing::info!(servo = servo_id, "Sweep already in progress, request ignored");
            return Ok(SweepLaunch::Rejected);
        }

        let outward = interpolate_angles(plan.start_angle, plan.target_angle, plan.steps);
        self.actuator
            .set_duty_cycle(slot.channel, angle_to_duty_cycle(outward[0]))?;
        slot.park_angle = plan.start_angle;

        let sweep = Sweep {
            servo: servo_id.to_string(),
            channel: slot.channel,
            plan,
            actuator: Arc::clone(&self.actuator),
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let failure_tx = self.failure_tx.clone();

        slot.task = Some(tokio::spawn(async move {
            let servo = sweep.servo.clone();
            if let Err(error) = sweep.run(shutdown_rx).await {
                tracing::error!(servo = %servo, "Servo sweep failed: {}", error);
                let _ = failure_tx.send(SweepFailure { servo, error });
            }
        }));

        tracing::info!(
            servo = servo_id,
            from = plan.start_angle,
            to = plan.target_angle,
            steps = plan.steps,
            "Sweep launched"
        );
        Ok(SweepLaunch::Started)
    }

    /// Next failure reported by a finished sweep, if any.
    pub fn take_failure(&mut self) -> Option<SweepFailure> {
        self.failure_rx.try_recv().ok()
    }

    /// Waits for the next sweep failure. Cancel safe.
    pub async fn next_failure(&mut self) -> Option<SweepFailure> {
        self.failure_rx.recv().await
    }

    /// Stops every running sweep. All tasks share one `grace` deadline to
    /// park their servo; stragglers are aborted and parked here once they
    /// are gone.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        let _ = self.shutdown_tx.send(());
        let deadline = Instant::now() + grace;

        for (name, slot) in self.slots.iter_mut() {
            let Some(mut task) = slot.task.take() else {
                continue;
            };
            let stopped = if Instant::now() >= deadline {
                task.is_finished()
            } else {
                timeout_at(deadline, &mut task).await.is_ok()
            };
            if stopped {
                continue;
            }
            task.abort();
            // The task may be mid-poll on another worker.
            let _ = task.await;
            tracing::warn!(servo = %name, "Sweep did not stop in time, parking servo");
            if let Err(e) = self
                .actuator
                .set_duty_cycle(slot.channel, angle_to_duty_cycle(slot.park_angle))
            {
                tracing::error!(servo = %name, "Failed to park servo: {}", e);
            }
        }
    }
}

enum Progress {
    Completed,
    Cancelled,
}

async fn wait(duration: Duration, shutdown_rx: &mut broadcast::Receiver<()>) -> Progress {
    tokio::select! {
        _ = sleep(duration) => Progress::Completed,
        _ = shutdown_rx.recv() => Progress::Cancelled,
    }
}

struct Sweep {
    servo: String,
    channel: u8,
    plan: SweepPlan,
    actuator: Arc<dyn ActuatorOutput>,
}

impl Sweep {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), ActuatorError> {
        let plan = self.plan;
        let outward = interpolate_angles(plan.start_angle, plan.target_angle, plan.steps);

        // The sweeper already wrote the first outward step.
        if let Progress::Cancelled = wait(plan.step_interval(), &mut shutdown_rx).await {
            return self.park();
        }
        if let Progress::Cancelled = self.move_through(&outward[1..], &mut shutdown_rx).await? {
            return self.park();
        }
        if let Progress::Cancelled = wait(plan.return_pause, &mut shutdown_rx).await {
            return self.park();
        }

        let back = interpolate_angles(plan.target_angle, plan.start_angle, plan.steps);
        if let Progress::Cancelled = self.move_through(&back, &mut shutdown_rx).await? {
            return self.park();
        }

        tracing::debug!(servo = %self.servo, "Sweep completed");
        Ok(())
    }

    async fn move_through(
        &self,
        angles: &[f64],
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Progress, ActuatorError> {
        let interval = self.plan.step_interval();
        for &angle in angles {
            self.actuator
                .set_duty_cycle(self.channel, angle_to_duty_cycle(angle))?;
            if let Progress::Cancelled = wait(interval, shutdown_rx).await {
                return Ok(Progress::Cancelled);
            }
        }
        Ok(Progress::Completed)
    }

    fn park(&self) -> Result<(), ActuatorError> {
        tracing::debug!(servo = %self.servo, "Sweep cancelled, parking servo");
        self.actuator
            .set_duty_cycle(self.channel, angle_to_duty_cycle(self.plan.start_angle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_config, RecordingActuator, Write};
    use tokio::time::timeout;

    fn plan(steps: usize, duration_ms: u64) -> SweepPlan {
        SweepPlan {
            start_angle: 0.0,
            target_angle: 120.0,
            duration: Duration::from_millis(duration_ms),
            steps,
            return_pause: Duration::from_millis(5),
        }
    }

    fn servo_duties(actuator: &RecordingActuator, channel: u8) -> Vec<f64> {
        actuator
            .writes()
            .into_iter()
            .filter_map(|write| match write {
                Write::Duty { channel: c, percent } if c == channel => Some(percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_angle_to_duty_cycle_endpoints() {
        assert_eq!(angle_to_duty_cycle(0.0), 2.5);
        assert_eq!(angle_to_duty_cycle(90.0), 7.5);
        assert_eq!(angle_to_duty_cycle(180.0), 12.5);
    }

    #[test]
    fn test_angle_to_duty_cycle_is_bounded_and_monotonic() {
        let mut previous = angle_to_duty_cycle(0.0);
        for tenth in 0..=1800 {
            let duty = angle_to_duty_cycle(tenth as f64 / 10.0);
            assert!((2.5..=12.5).contains(&duty));
            assert!(duty >= previous);
            previous = duty;
        }
    }

    #[test]
    fn test_out_of_range_angles_are_clamped() {
        assert_eq!(angle_to_duty_cycle(-30.0), 2.5);
        assert_eq!(angle_to_duty_cycle(270.0), 12.5);
        assert_eq!(duty_cycle_to_angle(7.5), 90.0);
    }

    #[test]
    fn test_interpolate_angles_includes_both_ends() {
        assert_eq!(interpolate_angles(0.0, 120.0, 5), vec![0.0, 30.0, 60.0, 90.0, 120.0]);
        assert_eq!(interpolate_angles(120.0, 0.0, 3), vec![120.0, 60.0, 0.0]);
        assert_eq!(interpolate_angles(0.0, 120.0, 1), vec![120.0]);
        assert!(interpolate_angles(0.0, 120.0, 0).is_empty());
    }

    #[test]
    fn test_step_interval_divides_duration() {
        assert_eq!(plan(4, 100).step_interval(), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_shutdown_parks_servo_at_start_angle() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        let launch = sweeper.start("x_axis", plan(3, 300)).unwrap();
        assert_eq!(launch, SweepLaunch::Started);
        sweeper.shutdown(Duration::from_secs(2)).await;

        // First step written, then cancelled and parked at the start angle.
        assert_eq!(servo_duties(&actuator, 19), vec![2.5, 2.5]);
        assert!(!sweeper.is_sweeping("x_axis"));
    }

    #[tokio::test]
    async fn test_completed_sweep_writes_both_legs() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        sweeper.start("x_axis", plan(3, 15)).unwrap();
        while sweeper.is_sweeping("x_axis") {
            sleep(Duration::from_millis(5)).await;
        }

        let expected: Vec<f64> = [0.0, 60.0, 120.0, 120.0, 60.0, 0.0]
            .iter()
            .map(|angle| angle_to_duty_cycle(*angle))
            .collect();
        assert_eq!(servo_duties(&actuator, 19), expected);
        assert!(sweeper.take_failure().is_none());
    }

    #[tokio::test]
    async fn test_second_request_for_busy_servo_is_rejected() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        assert_eq!(sweeper.start("x_axis", plan(4, 40)).unwrap(), SweepLaunch::Started);
        assert_eq!(sweeper.start("x_axis", plan(4, 40)).unwrap(), SweepLaunch::Rejected);

        while sweeper.is_sweeping("x_axis") {
            sleep(Duration::from_millis(5)).await;
        }

        // One outward and one return leg, no interleaved second sweep.
        assert_eq!(servo_duties(&actuator, 19).len(), 8);
        assert_eq!(sweeper.start("x_axis", plan(4, 40)).unwrap(), SweepLaunch::Started);
        sweeper.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_other_servo_can_sweep_concurrently() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        assert_eq!(sweeper.start("x_axis", plan(4, 40)).unwrap(), SweepLaunch::Started);
        assert_eq!(sweeper.start("y_axis", plan(4, 40)).unwrap(), SweepLaunch::Started);
        sweeper.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_servo_writes_nothing() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        let err = sweeper.start("z_axis", plan(3, 30)).unwrap_err();

        assert_eq!(err, SweepError::UnknownServo("z_axis".to_string()));
        assert!(actuator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_actuator_failure_is_reported() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::failing_channel_after(19, 1));
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        sweeper.start("x_axis", plan(3, 30)).unwrap();
        let failure = timeout(Duration::from_secs(1), sweeper.next_failure())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(failure.servo, "x_axis");
        assert_eq!(failure.error, ActuatorError::UnknownChannel(19));
    }

    #[tokio::test]
    async fn test_first_step_failure_fails_the_launch() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::failing_channel(19));
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        let err = sweeper.start("x_axis", plan(3, 30)).unwrap_err();

        assert_eq!(err, SweepError::Actuator(ActuatorError::UnknownChannel(19)));
        assert!(!sweeper.is_sweeping("x_axis"));
    }

    #[tokio::test]
    async fn test_first_step_is_written_before_start_returns() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        sweeper.start("x_axis", plan(3, 300)).unwrap();

        assert_eq!(servo_duties(&actuator, 19), vec![2.5]);
        sweeper.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_straggler_is_aborted_then_parked_at_start_angle() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);
        let mut slow = plan(3, 3000);
        slow.start_angle = 36.0;

        sweeper.start("x_axis", slow).unwrap();
        sleep(Duration::from_millis(5)).await;
        sweeper.shutdown(Duration::ZERO).await;
        let parked = servo_duties(&actuator, 19);
        sleep(Duration::from_millis(20)).await;

        // Parked at the sweep's start angle, not the configured rest angle.
        assert_eq!(parked, vec![4.5, 4.5]);
        assert_eq!(servo_duties(&actuator, 19), parked);
        assert!(!sweeper.is_sweeping("x_axis"));
    }

    #[tokio::test]
    async fn test_no_sweeps_start_after_shutdown() {
        let config = test_config();
        let actuator = Arc::new(RecordingActuator::default());
        let mut sweeper = ServoSweeper::new(actuator.clone(), &config);

        sweeper.shutdown(Duration::from_millis(10)).await;

        assert_eq!(sweeper.start("x_axis", plan(3, 30)).unwrap(), SweepLaunch::Rejected);
        assert!(actuator.writes().is_empty());
    }
}
