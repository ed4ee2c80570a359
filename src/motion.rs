use crate::actuator::{ActuatorError, ActuatorOutput, DirectionState};
use crate::config::MotorConfig;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return 0.0;
    }
    speed.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Forward,
    Stop,
}

impl FromStr for MoveDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "stop" => Ok(Self::Stop),
            other => Err(format!(
                "{} is not a supported direction. Use either `forward` or `stop`.",
                other
            )),
        }
    }
}

/// Drives all configured motors together.
pub struct MotionController {
    actuator: Arc<dyn ActuatorOutput>,
    motors: Vec<MotorConfig>,
}

impl MotionController {
    pub fn new(actuator: Arc<dyn ActuatorOutput>, motors: Vec<MotorConfig>) -> Self {
        Self { actuator, motors }
    }

    #[instrument(skip(self))]
    pub fn drive_forward(&self, speed: f64) -> Result<(), ActuatorError> {
        let speed = clamp_speed(speed);
        for motor in &self.motors {
            self.actuator
                .set_direction(motor.pin_pair(), DirectionState::Forward)?;
            self.actuator.set_duty_cycle(motor.pwm_channel, speed)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<(), ActuatorError> {
        for motor in &self.motors {
            self.actuator
                .set_direction(motor.pin_pair(), DirectionState::Neutral)?;
            self.actuator.set_duty_cycle(motor.pwm_channel, 0.0)?;
        }
        Ok(())
    }

    pub fn apply(&self, direction: MoveDirection, speed: f64) -> Result<(), ActuatorError> {
        match direction {
            MoveDirection::Forward => self.drive_forward(speed),
            MoveDirection::Stop => self.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PinPair;
    use crate::testing::{test_config, RecordingActuator, Write};

    fn controller() -> (Arc<RecordingActuator>, MotionController) {
        let actuator = Arc::new(RecordingActuator::default());
        let motion = MotionController::new(actuator.clone(), test_config().motors);
        (actuator, motion)
    }

    fn duties(actuator: &RecordingActuator) -> Vec<f64> {
        actuator
            .writes()
            .into_iter()
            .filter_map(|write| match write {
                Write::Duty { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_drive_forward_sets_every_motor() {
        let (actuator, motion) = controller();

        motion.drive_forward(50.0).unwrap();

        let writes = actuator.writes();
        assert_eq!(writes.len(), 8);
        assert_eq!(
            writes[0],
            Write::Direction {
                pins: PinPair { a: 5, b: 6 },
                state: DirectionState::Forward
            }
        );
        assert_eq!(writes[1], Write::Duty { channel: 13, percent: 50.0 });
        assert_eq!(duties(&actuator), vec![50.0; 4]);
    }

    #[test]
    fn test_speed_is_clamped_before_writing() {
        let (actuator, motion) = controller();

        motion.drive_forward(150.0).unwrap();
        motion.drive_forward(-10.0).unwrap();

        let written = duties(&actuator);
        assert_eq!(&written[..4], &[100.0; 4]);
        assert_eq!(&written[4..], &[0.0; 4]);
    }

    #[test]
    fn test_stop_neutralises_direction_and_duty() {
        let (actuator, motion) = controller();

        motion.stop().unwrap();
        motion.stop().unwrap();

        let writes = actuator.writes();
        assert_eq!(writes.len(), 16);
        assert!(writes.iter().all(|write| match write {
            Write::Direction { state, .. } => *state == DirectionState::Neutral,
            Write::Duty { percent, .. } => *percent == 0.0,
            _ => false,
        }));
    }

    #[test]
    fn test_actuator_failure_propagates() {
        let actuator = Arc::new(RecordingActuator::failing_channel(13));
        let motion = MotionController::new(actuator, test_config().motors);

        assert_eq!(motion.drive_forward(40.0), Err(ActuatorError::UnknownChannel(13)));
    }

    #[test]
    fn test_parse_direction() {
        assert_eq!("Forward".parse::<MoveDirection>(), Ok(MoveDirection::Forward));
        assert_eq!("stop".parse::<MoveDirection>(), Ok(MoveDirection::Stop));
        assert!("left".parse::<MoveDirection>().is_err());
    }
}
